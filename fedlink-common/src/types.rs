//! Core identifier types and wire messages
//!
//! The engine treats model parameters as opaque flat `f32` vectors; every
//! message that crosses the client/server boundary is defined here so that
//! both sides agree on one schema.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a registered client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Creates a new client identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Monotonic training round identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct RoundId(u64);

impl RoundId {
    /// Creates a round identifier.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw round number.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Returns the next round identifier without mutating.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "round {}", self.0)
    }
}

/// Monotonic, strictly increasing global model version.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ModelVersion(u64);

impl ModelVersion {
    /// Creates a model version.
    pub fn new(v: u64) -> Self {
        Self(v)
    }

    /// Returns the raw version number.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Returns the version that follows this one.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Capabilities a client declares at registration time.
///
/// Registration is rejected when the declared model dimension or schema
/// version does not match the active global model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCapabilities {
    /// Flattened parameter vector length the client trains on
    pub model_dimension: usize,
    /// Model schema version the client understands
    pub schema_version: u32,
    /// Protocol version of the client software
    pub protocol_version: u32,
    /// Number of local training samples the client holds (advisory)
    #[serde(default)]
    pub declared_samples: u64,
}

/// Reasons a registration or update submission is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Client model schema/dimension does not match the global model
    IncompatibleCapability,
    /// Update failed shape/content validation
    InvalidUpdate,
    /// Client already contributed to this round
    DuplicateUpdate,
    /// No round is currently accepting contributions
    NoOpenRound,
    /// Client is not registered or not part of this round
    UnknownClient,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::IncompatibleCapability => write!(f, "incompatible capability"),
            RejectReason::InvalidUpdate => write!(f, "invalid update"),
            RejectReason::DuplicateUpdate => write!(f, "duplicate update"),
            RejectReason::NoOpenRound => write!(f, "no open round"),
            RejectReason::UnknownClient => write!(f, "unknown client"),
        }
    }
}

/// Messages sent by clients to the coordination engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First contact: announce identity and capabilities
    Register {
        /// Client identifier
        client_id: ClientId,
        /// Declared capabilities
        capabilities: ClientCapabilities,
    },
    /// Liveness refresh
    Heartbeat {
        /// Client identifier
        client_id: ClientId,
    },
    /// Acknowledge participation in an announced round
    Ack {
        /// Client identifier
        client_id: ClientId,
        /// Round being acknowledged
        round_id: RoundId,
    },
    /// Submit a local model update for the open round
    Update {
        /// Client identifier
        client_id: ClientId,
        /// Round this update belongs to
        round_id: RoundId,
        /// Flattened parameter vector (masked when secure aggregation is on)
        parameters: Vec<f32>,
        /// Number of local samples the update was trained on
        sample_count: u64,
        /// Reported control-variate delta (SCAFFOLD only)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        control_variate: Option<Vec<f32>>,
        /// Masking session tag (secure aggregation only)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mask_tag: Option<u64>,
        /// Local training loss (reporting only)
        #[serde(default)]
        loss: f32,
    },
}

/// Messages sent by the coordination engine to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Registration accepted; carries the current model version
    RegisterAccepted {
        /// Version of the currently published global model
        model_version: ModelVersion,
    },
    /// Registration rejected
    RegisterRejected {
        /// Why the registration was refused
        reason: RejectReason,
    },
    /// New round announcement with the current global model snapshot
    ModelBroadcast {
        /// Round being opened
        round_id: RoundId,
        /// Version of the broadcast model
        model_version: ModelVersion,
        /// Global model parameters
        parameters: Vec<f32>,
        /// Proximal strength for client-side regularization (FedProx only)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        proximal_mu: Option<f64>,
        /// Submission deadline in seconds from receipt
        deadline_secs: u64,
    },
    /// Round aborted; last published model remains valid
    RoundAbort {
        /// Aborted round
        round_id: RoundId,
        /// Human-readable abort reason
        reason: String,
    },
    /// Update accepted into the round buffer
    UpdateAccepted {
        /// Round the update was accepted for
        round_id: RoundId,
    },
    /// Update rejected; client stays eligible for future rounds
    UpdateRejected {
        /// Round the update targeted
        round_id: RoundId,
        /// Why the update was refused
        reason: RejectReason,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_roundtrip() {
        let id = ClientId::new("worker-7");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"worker-7\"");
        let back: ClientId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_round_id_next() {
        let r = RoundId::new(3);
        assert_eq!(r.next().value(), 4);
        assert_eq!(r.value(), 3);
    }

    #[test]
    fn test_update_message_wire_format() {
        let msg = ClientMessage::Update {
            client_id: ClientId::new("c1"),
            round_id: RoundId::new(5),
            parameters: vec![1.0, 2.0],
            sample_count: 10,
            control_variate: None,
            mask_tag: None,
            loss: 0.25,
        };
        let bytes = serde_json::to_vec(&msg).unwrap();
        let back: ClientMessage = serde_json::from_slice(&bytes).unwrap();
        match back {
            ClientMessage::Update {
                round_id,
                sample_count,
                ..
            } => {
                assert_eq!(round_id, RoundId::new(5));
                assert_eq!(sample_count, 10);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_broadcast_omits_mu_when_absent() {
        let msg = ServerMessage::ModelBroadcast {
            round_id: RoundId::new(1),
            model_version: ModelVersion::new(0),
            parameters: vec![0.0],
            proximal_mu: None,
            deadline_secs: 30,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("proximal_mu"));
    }
}
