use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata travels opaquely from the initiator through every `process`
/// command and into the outcome reports.
pub type Metadata = Map<String, Value>;

/// A command received from, or published to, the message channel.
///
/// The wire format is JSON dispatched on the `code` field. Each shape is
/// validated at decode time; a payload that does not match one of the
/// variants is rejected by serde rather than handled with missing fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum Command {
    /// Initiate fan-out: resolve the scenario set and publish one
    /// [Command::Process] per surviving file.
    Start {
        /// The run id correlating this batch with every `process` command it
        /// spawns.
        id: String,
        /// `key=value` tag requirements, AND-combined.
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default)]
        metadata: Metadata,
    },
    /// Execute a single scenario file.
    Process {
        /// The run id of the `start` command that spawned this unit.
        id: String,
        scenario: String,
        #[serde(default)]
        metadata: Metadata,
    },
    /// Cancel the in-flight run registered under the logical key.
    Cancel { key: String },
}

impl Command {
    pub fn decode(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
