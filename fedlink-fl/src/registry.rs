//! Client registry
//!
//! Tracks participant identity, liveness and eligibility. All mutation goes
//! through the owning coordinator task, which serializes access; the
//! registry itself is a plain service object with explicit construction.
//!
//! Liveness model: a client whose last heartbeat is older than the liveness
//! window becomes `Stale` and drops out of eligibility; once the missed-
//! heartbeat threshold is exceeded it is evicted. The registry also bounds
//! the total number of tracked clients, evicting the longest-idle entries
//! first when at capacity.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, info, warn};

use fedlink_common::config::RegistryConfig;
use fedlink_common::types::{ClientCapabilities, ClientId};

use crate::FlError;

/// Liveness status of a registered client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    /// Heartbeat within the liveness window
    Active,
    /// Missed at least one liveness window, not yet evicted
    Stale,
    /// Removed from the eligible population
    Evicted,
}

impl std::fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientStatus::Active => write!(f, "active"),
            ClientStatus::Stale => write!(f, "stale"),
            ClientStatus::Evicted => write!(f, "evicted"),
        }
    }
}

/// A registered participant.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    /// Client identifier
    pub id: ClientId,
    /// Declared capabilities from registration
    pub capabilities: ClientCapabilities,
    /// Current liveness status
    pub status: ClientStatus,
    /// Last registration or heartbeat time
    pub last_seen: Instant,
    /// Persistent SCAFFOLD control variate; untouched while absent from rounds
    pub control_variate: Option<Vec<f32>>,
}

/// Registry of participants keyed by client id.
///
/// Listing preserves insertion order; eligibility filtering is by liveness
/// window only.
pub struct ClientRegistry {
    config: RegistryConfig,
    clients: HashMap<ClientId, ClientRecord>,
    /// Insertion order for deterministic listing
    order: Vec<ClientId>,
    /// Model dimension clients must declare
    model_dimension: usize,
    /// Schema version clients must declare
    schema_version: u32,
}

impl ClientRegistry {
    /// Creates an empty registry bound to the active model's shape.
    pub fn new(config: RegistryConfig, model_dimension: usize, schema_version: u32) -> Self {
        Self {
            config,
            clients: HashMap::new(),
            order: Vec::new(),
            model_dimension,
            schema_version,
        }
    }

    /// Registers a client, or refreshes it if already known.
    ///
    /// Fails with [`FlError::IncompatibleCapability`] when the declared
    /// model dimension or schema version does not match the active global
    /// model; the client is not added.
    pub fn register(
        &mut self,
        id: ClientId,
        capabilities: ClientCapabilities,
    ) -> Result<(), FlError> {
        if capabilities.model_dimension != self.model_dimension {
            return Err(FlError::IncompatibleCapability(format!(
                "client {} declares dimension {}, global model has {}",
                id, capabilities.model_dimension, self.model_dimension
            )));
        }
        if capabilities.schema_version != self.schema_version {
            return Err(FlError::IncompatibleCapability(format!(
                "client {} declares schema v{}, server requires v{}",
                id, capabilities.schema_version, self.schema_version
            )));
        }

        let now = Instant::now();
        if let Some(existing) = self.clients.get_mut(&id) {
            // Re-registration refreshes liveness and capabilities but keeps
            // the control-variate state.
            existing.capabilities = capabilities;
            existing.status = ClientStatus::Active;
            existing.last_seen = now;
            debug!("client {} re-registered", id);
            return Ok(());
        }

        if self.clients.len() >= self.config.max_tracked_clients {
            self.evict_longest_idle();
        }

        info!("client {} registered", id);
        self.order.push(id.clone());
        self.clients.insert(
            id.clone(),
            ClientRecord {
                id,
                capabilities,
                status: ClientStatus::Active,
                last_seen: now,
                control_variate: None,
            },
        );
        Ok(())
    }

    /// Refreshes a client's liveness. Returns false for unknown clients.
    pub fn heartbeat(&mut self, id: &ClientId) -> bool {
        self.heartbeat_at(id, Instant::now())
    }

    /// Heartbeat with an explicit timestamp; the coordinator task always
    /// passes the current instant, tests may not.
    pub fn heartbeat_at(&mut self, id: &ClientId, now: Instant) -> bool {
        match self.clients.get_mut(id) {
            Some(record) if record.status != ClientStatus::Evicted => {
                record.last_seen = now;
                record.status = ClientStatus::Active;
                true
            }
            Some(_) => false,
            None => false,
        }
    }

    /// Returns clients eligible for a new round: active status and a
    /// heartbeat within the liveness window, in insertion order.
    pub fn list_eligible(&self, now: Instant) -> Vec<ClientId> {
        let window = self.config.liveness_window();
        self.order
            .iter()
            .filter(|id| {
                self.clients.get(*id).is_some_and(|r| {
                    r.status == ClientStatus::Active
                        && now.saturating_duration_since(r.last_seen) <= window
                })
            })
            .cloned()
            .collect()
    }

    /// Evicts a client explicitly. Returns true if it was present and not
    /// already evicted.
    pub fn evict(&mut self, id: &ClientId) -> bool {
        match self.clients.get_mut(id) {
            Some(record) if record.status != ClientStatus::Evicted => {
                info!("client {} evicted", id);
                record.status = ClientStatus::Evicted;
                true
            }
            _ => false,
        }
    }

    /// Ages liveness state: marks stale clients and evicts those past the
    /// missed-heartbeat threshold. Returns the ids evicted by this sweep so
    /// the coordinator can drop them from an open round's pending set.
    pub fn sweep(&mut self, now: Instant) -> Vec<ClientId> {
        let window = self.config.liveness_window();
        let eviction_age = self.config.eviction_age();
        let mut evicted = Vec::new();

        for id in &self.order {
            let Some(record) = self.clients.get_mut(id) else {
                continue;
            };
            if record.status == ClientStatus::Evicted {
                continue;
            }
            let idle = now.saturating_duration_since(record.last_seen);
            if idle > eviction_age {
                warn!("client {} missed heartbeat threshold, evicting", id);
                record.status = ClientStatus::Evicted;
                evicted.push(id.clone());
            } else if idle > window && record.status == ClientStatus::Active {
                debug!("client {} is stale", id);
                record.status = ClientStatus::Stale;
            }
        }

        // Drop evicted entries entirely; their control-variate state dies
        // with them.
        for id in &evicted {
            self.clients.remove(id);
        }
        self.order.retain(|id| self.clients.contains_key(id));
        evicted
    }

    /// Returns the stored control variate for a client, if any.
    pub fn control_variate(&self, id: &ClientId) -> Option<&Vec<f32>> {
        self.clients.get(id).and_then(|r| r.control_variate.as_ref())
    }

    /// Stores a client's control variate after a SCAFFOLD round.
    pub fn set_control_variate(&mut self, id: &ClientId, cv: Vec<f32>) {
        if let Some(record) = self.clients.get_mut(id) {
            record.control_variate = Some(cv);
        }
    }

    /// Returns the record for a client.
    pub fn get(&self, id: &ClientId) -> Option<&ClientRecord> {
        self.clients.get(id)
    }

    /// Iterates over tracked records in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ClientRecord> {
        self.order.iter().filter_map(|id| self.clients.get(id))
    }

    /// True if the client is registered and not evicted.
    pub fn is_known(&self, id: &ClientId) -> bool {
        self.clients
            .get(id)
            .is_some_and(|r| r.status != ClientStatus::Evicted)
    }

    /// Number of tracked (non-evicted) clients.
    pub fn len(&self) -> usize {
        self.clients
            .values()
            .filter(|r| r.status != ClientStatus::Evicted)
            .count()
    }

    /// True when no clients are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_longest_idle(&mut self) {
        let oldest = self
            .clients
            .values()
            .filter(|r| r.status != ClientStatus::Evicted)
            .min_by_key(|r| r.last_seen)
            .map(|r| r.id.clone());
        if let Some(id) = oldest {
            warn!("registry at capacity, evicting longest-idle client {}", id);
            self.clients.remove(&id);
            self.order.retain(|o| *o != id);
        }
    }
}
