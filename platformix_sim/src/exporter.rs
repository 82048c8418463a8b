//! JSON exporter of the bus conversation.
//!
//! Captures the objects of a Farm and every recorded delivery as a sequence
//! diagram that external tooling can draw.

use platformix_core::Farm;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use uuid::Uuid;

/// A diagram lifeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagramObject {
    pub name: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wait: Vec<String>,
}

/// Structural edge between two lifelines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    pub from: String,
    pub to: String,

    /// "depends on" for wait entries, "subplatform of" for the parent
    pub label: String,
}

/// One delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relation {
    /// Global delivery order
    pub order: u64,

    /// Bus clock at delivery, in seconds
    pub at_secs: f64,

    pub channel: String,
    pub thread: u64,

    /// Sender; `None` for the environment
    pub from: Option<String>,
    pub to: String,

    /// Whether the receiver took the message
    pub accepted: bool,

    pub summary: String,
}

/// Complete conversation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceDiagram {
    /// Unique id of this export
    pub run_id: String,

    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    pub objects: Vec<DiagramObject>,

    /// Start ordering edges
    #[serde(default)]
    pub dependencies: Vec<Dependency>,

    /// Deliveries in order
    pub relations: Vec<Relation>,
}

impl SequenceDiagram {
    /// Creates an empty diagram.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            scenario: scenario.to_string(),
            seed,
            objects: Vec::new(),
            dependencies: Vec::new(),
            relations: Vec::new(),
        }
    }

    /// Adds the components and the recorded conversation of `farm`.
    pub fn capture(&mut self, farm: &Farm) {
        self.objects.extend(farm.components().iter().map(|c| DiagramObject {
            name: c.name().to_string(),
            kind: c.kind().to_string(),
            parent: c.parent().map(str::to_string),
            wait: c.wait().to_vec(),
        }));
        for object in &self.objects {
            let edge = |to: &String, label: &str| Dependency {
                from: object.name.clone(),
                to: to.clone(),
                label: label.to_string(),
            };
            self.dependencies.extend(object.parent.iter().map(|p| edge(p, "subplatform of")));
            self.dependencies.extend(object.wait.iter().map(|w| edge(w, "depends on")));
        }
        for name in farm.channel_names() {
            let Some(channel) = farm.channel(&name) else {
                continue;
            };
            for thread in 0..channel.thread_count() {
                for entry in channel.conversation(thread).unwrap_or_default() {
                    self.relations.push(Relation {
                        order: entry.order,
                        at_secs: entry.at_secs,
                        channel: name.clone(),
                        thread,
                        from: entry.sender.clone(),
                        to: entry.receiver.clone(),
                        accepted: entry.accepted,
                        summary: entry.summary.clone(),
                    });
                }
            }
        }
        self.relations.sort_by_key(|r| r.order);
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
