//! Platform factory: explicit registry of component constructors.
//!
//! ```text
//!   PlatformEntry{base_platform, kwargs}
//!        │
//!        ▼
//!   constructors[kind] ──► Parts{worker, protocols, subscriptions}
//!        │                          │
//!        │ unknown kind             ▼
//!        ▼                 Component::new(spec, ...)
//!   FactoryError::NotFound
//! ```

use crate::description::PlatformEntry;
use crate::error::FactoryError;
use crate::platforms;
use crate::rules::RulesRegistry;
use platformix_core::{Component, ComponentSpec, FarmConfig, Kwargs, Protocol, Worker};
use platformix_env::{generated_name, SubjectLink};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Everything a constructor gets to build one component.
pub struct Blueprint<'a> {
    pub spec: &'a ComponentSpec,
    pub kwargs: &'a Kwargs,
    subjects: &'a HashMap<String, SubjectMaker>,
    rules: &'a RulesRegistry,
}

impl<'a> Blueprint<'a> {
    /// Keyword argument `key` deserialized as `T`; `None` if absent.
    pub fn kwarg<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, FactoryError> {
        match self.kwargs.get(key) {
            None => Ok(None),
            Some(raw) => serde_json::from_value(raw.clone())
                .map(Some)
                .map_err(|e| FactoryError::BadArgument {
                    platform: self.spec.name.clone(),
                    argument: key.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    /// Keyword argument `key` deserialized as `T`.
    ///
    /// # Errors
    /// `BadArgument` if it is absent or malformed.
    pub fn required<T: DeserializeOwned>(&self, key: &str) -> Result<T, FactoryError> {
        self.kwarg(key)?.ok_or_else(|| FactoryError::BadArgument {
            platform: self.spec.name.clone(),
            argument: key.to_string(),
            reason: "missing".to_string(),
        })
    }

    /// Rule sets scoreboards and coverage collectors pick from.
    pub fn rules(&self) -> &RulesRegistry {
        self.rules
    }

    /// Opens a link to the subject registered as `name`.
    pub fn subject(&self, name: &str) -> Result<Box<dyn SubjectLink>, FactoryError> {
        let maker = self
            .subjects
            .get(name)
            .ok_or_else(|| FactoryError::UnknownSubject(name.to_string()))?;
        Ok(maker(&self.spec.name))
    }
}

/// What a constructor produces.
pub struct Parts {
    pub worker: Box<dyn Worker>,
    pub protocols: Vec<Box<dyn Protocol>>,

    /// Extra channels to join
    pub subscriptions: Vec<String>,
}

impl Parts {
    pub fn new(worker: Box<dyn Worker>) -> Self {
        Self {
            worker,
            protocols: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    pub fn with_protocol(mut self, protocol: Box<dyn Protocol>) -> Self {
        self.protocols.push(protocol);
        self
    }

    pub fn subscribe(mut self, channel: impl Into<String>) -> Self {
        self.subscriptions.push(channel.into());
        self
    }
}

pub type Constructor = fn(&Blueprint<'_>) -> Result<Parts, FactoryError>;

/// Opens a link for the component named by the argument.
pub type SubjectMaker = Arc<dyn Fn(&str) -> Box<dyn SubjectLink> + Send + Sync>;

pub struct PlatformFactory {
    constructors: HashMap<String, Constructor>,
    subjects: HashMap<String, SubjectMaker>,
    rules: RulesRegistry,
}

impl PlatformFactory {
    /// Factory without any kinds or rule sets.
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
            subjects: HashMap::new(),
            rules: RulesRegistry::empty(),
        }
    }

    /// Factory knowing the built-in kinds, rule sets and the in-process
    /// calculator.
    pub fn new() -> Self {
        let mut factory = Self::empty();
        factory.rules = RulesRegistry::new();
        factory.register("platformix", platforms::platformix::construct);
        factory.register("calc", platforms::calc::construct);
        factory.register("sequencer", platforms::sequencer::construct);
        factory.register("scoreboard", platforms::scoreboard::construct);
        factory.register("coverage", platforms::coverage::construct);
        factory.register_subject("calculator", Arc::new(|name: &str| -> Box<dyn SubjectLink> {
            Box::new(crate::arith::calculator_link(name))
        }));
        factory
    }

    pub fn register(&mut self, kind: impl Into<String>, constructor: Constructor) {
        self.constructors.insert(kind.into(), constructor);
    }

    pub fn register_subject(&mut self, name: impl Into<String>, maker: SubjectMaker) {
        self.subjects.insert(name.into(), maker);
    }

    pub fn rules_mut(&mut self) -> &mut RulesRegistry {
        &mut self.rules
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Builds a component from a description entry.
    ///
    /// Unnamed components get a generated `<kind>-xxxxxxxx` name.
    pub fn build(
        &self,
        name: Option<&str>,
        entry: &PlatformEntry,
        config: &FarmConfig,
    ) -> Result<Component, FactoryError> {
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| generated_name(&entry.base_platform));
        let spec = entry.spec(&name).map_err(|e| FactoryError::BadArgument {
            platform: name.clone(),
            argument: "limits".to_string(),
            reason: e.to_string(),
        })?;
        self.build_spec(spec, &entry.kwargs, config)
    }

    /// Builds a component from ready construction parameters.
    pub fn build_spec(&self, mut spec: ComponentSpec, kwargs: &Kwargs, config: &FarmConfig) -> Result<Component, FactoryError> {
        let constructor = self
            .constructors
            .get(&spec.kind)
            .ok_or_else(|| FactoryError::NotFound(spec.kind.clone()))?;
        let parts = constructor(&Blueprint {
            spec: &spec,
            kwargs,
            subjects: &self.subjects,
            rules: &self.rules,
        })?;
        spec.subscriptions.extend(parts.subscriptions);
        debug!("Built {} of kind {}", spec.name, spec.kind);
        Ok(Component::new(spec, parts.worker, parts.protocols, config)?)
    }
}

impl Default for PlatformFactory {
    fn default() -> Self {
        Self::new()
    }
}
