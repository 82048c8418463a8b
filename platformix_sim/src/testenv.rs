//! Test environment: a Farm populated from a description, driven by tests.

use crate::description::EnvDescription;
use crate::error::SimError;
use crate::factory::PlatformFactory;
use anyhow::ensure;
use platformix_core::{
    evaluate, BusError, Farm, FarmConfig, Message, ReplyRouting, Rule, TransactionReport, PLATFORMIX,
    PLATFORMS_CHANNEL,
};
use platformix_env::BusContext;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct TestEnv {
    farm: Farm,
    description: EnvDescription,
}

impl TestEnv {
    /// Wraps an already populated Farm.
    pub fn new(farm: Farm) -> Self {
        Self {
            farm,
            description: EnvDescription::default(),
        }
    }

    /// Instantiates every enabled platform of `description`.
    ///
    /// # Errors
    /// Unknown kinds, bad arguments, registration violations, and platforms
    /// left waiting for prerequisites nobody declared.
    pub fn from_description(
        description: EnvDescription,
        factory: &PlatformFactory,
        config: FarmConfig,
        clock: Arc<dyn BusContext>,
    ) -> Result<Self, SimError> {
        let mut farm = Farm::new(config, clock);
        for (spec, entry) in description.instances()? {
            let component = factory.build_spec(spec, &entry.kwargs, farm.config())?;
            farm.register(component)?;
        }
        let awaiting: Vec<String> = farm.awaiting().into_iter().map(str::to_string).collect();
        if !awaiting.is_empty() {
            return Err(SimError::Unresolved(awaiting));
        }
        info!("Test environment with {} platforms", farm.components().len());
        Ok(Self { farm, description })
    }

    pub fn farm(&self) -> &Farm {
        &self.farm
    }

    pub fn farm_mut(&mut self) -> &mut Farm {
        &mut self.farm
    }

    pub fn description(&self) -> &EnvDescription {
        &self.description
    }

    pub fn generic(&self, name: &str) -> Option<&Value> {
        self.description.generic(name)
    }

    /// Transaction expecting every participant to succeed.
    pub fn transaction(&mut self, channel: &str, message: Message) -> Result<TransactionReport, BusError> {
        self.transaction_expecting(channel, message, &[Rule::all_success()], &[])
    }

    /// Sends `message` on a fresh thread of `channel`, waits until the
    /// thread settles and judges the replies against `rules`.
    ///
    /// # Errors
    /// Unknown channel, another transaction in progress, or any protocol
    /// violation raised while the bus drained.
    pub fn transaction_expecting(
        &mut self,
        channel: &str,
        message: Message,
        rules: &[Rule],
        ignore: &[String],
    ) -> Result<TransactionReport, BusError> {
        let interface = message.interface.clone();
        let summary = message.summary();
        let context = self.farm.start_conversation(channel, &interface, ReplyRouting::default())?;
        debug!("Transaction {} on {}", summary, context);
        let replies = self.farm.send(&context, message, None)?.unwrap_or_default();
        let report = evaluate(replies, rules, ignore);
        if report.passed {
            debug!("Transaction {} passed", summary);
        } else {
            warn!("Transaction {} on {} failed: {}", summary, channel, report.failures.join("; "));
        }
        Ok(report)
    }

    /// Starts all platforms.
    pub fn start_platforms(&mut self) -> anyhow::Result<()> {
        let report = self.transaction(PLATFORMS_CHANNEL, Message::call(PLATFORMIX, "start"))?;
        ensure!(
            report.passed,
            "Failed to start platforms (transaction fail): {}",
            report.failures.join("; ")
        );
        ensure!(
            self.farm.all_running(),
            "Failed to start platforms (not all have been reacted on transaction)"
        );
        Ok(())
    }

    /// Stops all platforms.
    pub fn stop_platforms(&mut self) -> anyhow::Result<()> {
        let report = self.transaction(PLATFORMS_CHANNEL, Message::call(PLATFORMIX, "stop"))?;
        ensure!(
            report.passed,
            "Failed to stop platforms (transaction fail): {}",
            report.failures.join("; ")
        );
        ensure!(
            self.farm.all_stopped(),
            "Failed to stop platforms (not all have been reacted on transaction)"
        );
        Ok(())
    }

    pub fn emergency_stop(&mut self) -> bool {
        self.farm.emergency_stop()
    }
}

impl std::fmt::Debug for TestEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestEnv").field("farm", &self.farm).finish()
    }
}
