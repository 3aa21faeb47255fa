//! Shared awareness map: one JSON state per connected client.
//!
//! Each client owns its own entry and bumps a per-client clock on every
//! write. Updates carry `(client, clock, state)` triples; a receiver keeps
//! whichever state has the newest clock, so states converge no matter how
//! updates are reordered or duplicated.
//!
//! ## Wire format
//!
//! ```text
//! AwarenessUpdate (bincode, standard config)
//!   └── entries: [ { client_id: u64, clock: u32, state: JSON text | "null" } ]
//! ```

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chalk_core::{EventListeners, ListenerHandle};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub type ClientId = u64;

/// Awareness state of one client: a JSON object.
pub type JsonMap = Map<String, Value>;

/// Remote states not refreshed for this long are considered gone.
pub const DEFAULT_OUTDATED_TIMEOUT: Duration = Duration::from_secs(30);
/// Age after which a quiet local state is re-published, half the timeout.
pub const DEFAULT_RENEW_AFTER: Duration = Duration::from_secs(15);

const NULL_STATE: &str = "null";

#[derive(Debug, Error)]
pub enum AwarenessError {
    #[error("failed to encode awareness update: {0}")]
    Encode(String),
    #[error("failed to decode awareness update: {0}")]
    Decode(String),
    #[error("invalid awareness state: {0}")]
    State(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
    /// Removed by [`Awareness::remove_outdated`].
    Timeout,
}

/// Clients whose state changed in one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
    pub origin: ChangeOrigin,
}

impl AwarenessChange {
    fn new(origin: ChangeOrigin) -> Self {
        Self { added: Vec::new(), updated: Vec::new(), removed: Vec::new(), origin }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every client mentioned by the change.
    pub fn changed(&self) -> Vec<ClientId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct UpdateEntry {
    client_id: ClientId,
    clock: u32,
    state: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct AwarenessUpdate {
    entries: Vec<UpdateEntry>,
}

#[derive(Debug, Clone, Copy)]
struct ClientMeta {
    clock: u32,
    last_updated: Instant,
}

#[derive(Debug, Default)]
struct AwarenessState {
    states: HashMap<ClientId, JsonMap>,
    meta: HashMap<ClientId, ClientMeta>,
}

impl AwarenessState {
    fn next_clock(&self, client: ClientId) -> u32 {
        self.meta.get(&client).map_or(0, |m| m.clock.wrapping_add(1))
    }

    fn touch(&mut self, client: ClientId, clock: u32) {
        self.meta.insert(client, ClientMeta { clock, last_updated: Instant::now() });
    }
}

/// Awareness map for one replica.
pub struct Awareness {
    client_id: ClientId,
    state: Mutex<AwarenessState>,
    listeners: EventListeners<AwarenessChange>,
}

impl Awareness {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            state: Mutex::new(AwarenessState::default()),
            listeners: EventListeners::new(),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn state(&self) -> MutexGuard<'_, AwarenessState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, change: AwarenessChange) -> AwarenessChange {
        if !change.is_empty() {
            self.listeners.emit(&change);
        }
        change
    }

    pub fn on_change<F>(&self, f: F) -> ListenerHandle
    where
        F: Fn(&AwarenessChange) + Send + Sync + 'static,
    {
        self.listeners.subscribe(f)
    }

    pub fn local_state(&self) -> Option<JsonMap> {
        self.state().states.get(&self.client_id).cloned()
    }

    /// Replace the local state. `None` marks this client as gone.
    pub fn set_local_state(&self, new_state: Option<JsonMap>) {
        let mut change = AwarenessChange::new(ChangeOrigin::Local);
        {
            let mut guard = self.state();
            let clock = guard.next_clock(self.client_id);
            let previous = match new_state {
                Some(state) => guard.states.insert(self.client_id, state),
                None => guard.states.remove(&self.client_id),
            };
            guard.touch(self.client_id, clock);

            let current = guard.states.get(&self.client_id);
            match (previous.as_ref(), current) {
                (None, Some(_)) => change.added.push(self.client_id),
                (Some(_), None) => change.removed.push(self.client_id),
                (Some(before), Some(after)) if before != after => change.updated.push(self.client_id),
                _ => {}
            }
        }
        self.emit(change);
    }

    /// Set one top-level field of the local state, creating the state if needed.
    pub fn set_local_state_field(&self, field: &str, value: Value) {
        let mut state = self.local_state().unwrap_or_default();
        state.insert(field.to_string(), value);
        self.set_local_state(Some(state));
    }

    /// Every known state, the local one included.
    pub fn states(&self) -> HashMap<ClientId, JsonMap> {
        self.state().states.clone()
    }

    pub fn clock(&self, client: ClientId) -> Option<u32> {
        self.state().meta.get(&client).map(|m| m.clock)
    }

    /// Encode the current entries of `clients`. Clients that were removed
    /// are encoded with a `null` state so receivers drop them too.
    pub fn encode_update(&self, clients: &[ClientId]) -> Result<Vec<u8>, AwarenessError> {
        let update = {
            let guard = self.state();
            let mut entries = Vec::with_capacity(clients.len());
            for client in clients {
                let Some(meta) = guard.meta.get(client) else {
                    continue;
                };
                let state = match guard.states.get(client) {
                    Some(state) => serde_json::to_string(state)?,
                    None => NULL_STATE.to_string(),
                };
                entries.push(UpdateEntry { client_id: *client, clock: meta.clock, state });
            }
            AwarenessUpdate { entries }
        };
        bincode::serde::encode_to_vec(&update, bincode::config::standard())
            .map_err(|e| AwarenessError::Encode(e.to_string()))
    }

    /// Merge an update from a peer. Entries about this client are ignored.
    pub fn apply_update(&self, bytes: &[u8]) -> Result<AwarenessChange, AwarenessError> {
        let (update, _): (AwarenessUpdate, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| AwarenessError::Decode(e.to_string()))?;

        // Parse everything before touching shared state so a bad entry
        // rejects the whole update.
        let mut parsed = Vec::with_capacity(update.entries.len());
        for entry in update.entries {
            let state: Option<JsonMap> = serde_json::from_str(&entry.state)?;
            parsed.push((entry.client_id, entry.clock, state));
        }

        let mut change = AwarenessChange::new(ChangeOrigin::Remote);
        {
            let mut guard = self.state();
            for (client, clock, state) in parsed {
                if client == self.client_id {
                    continue;
                }
                let known = guard.states.contains_key(&client);
                let newer = guard.meta.get(&client).map_or(true, |m| {
                    m.clock < clock || (m.clock == clock && state.is_none() && known)
                });
                if !newer {
                    continue;
                }
                match state {
                    Some(state) => {
                        match guard.states.insert(client, state) {
                            None => change.added.push(client),
                            Some(previous) => {
                                if guard.states.get(&client) != Some(&previous) {
                                    change.updated.push(client);
                                }
                            }
                        }
                    }
                    None => {
                        if guard.states.remove(&client).is_some() {
                            change.removed.push(client);
                        }
                    }
                }
                guard.touch(client, clock);
            }
        }
        debug!(
            "awareness update: +{} ~{} -{}",
            change.added.len(),
            change.updated.len(),
            change.removed.len()
        );
        Ok(self.emit(change))
    }

    /// Drop the given clients' states, e.g. when their connection closes.
    pub fn remove_states(&self, clients: &[ClientId]) -> AwarenessChange {
        let mut change = AwarenessChange::new(ChangeOrigin::Local);
        {
            let mut guard = self.state();
            for client in clients {
                if guard.states.remove(client).is_none() {
                    continue;
                }
                if *client == self.client_id {
                    let clock = guard.next_clock(*client);
                    guard.touch(*client, clock);
                }
                change.removed.push(*client);
            }
        }
        self.emit(change)
    }

    /// Re-publish an unchanged local state once it is `max_age` old.
    ///
    /// Peers sweep states with [`Awareness::remove_outdated`], so a connected
    /// but idle client has to call this periodically and broadcast the
    /// renewed entry. The returned change lists the local client under
    /// `updated` when the clock was bumped.
    pub fn renew_local_state(&self, max_age: Duration) -> AwarenessChange {
        let mut change = AwarenessChange::new(ChangeOrigin::Local);
        {
            let mut guard = self.state();
            let due = guard.states.contains_key(&self.client_id)
                && guard
                    .meta
                    .get(&self.client_id)
                    .is_some_and(|meta| meta.last_updated.elapsed() >= max_age);
            if due {
                let clock = guard.next_clock(self.client_id);
                guard.touch(self.client_id, clock);
                change.updated.push(self.client_id);
            }
        }
        self.emit(change)
    }

    /// Drop remote states that have not been refreshed within `timeout`.
    ///
    /// Only entries whose owner stopped renewing expire; see
    /// [`Awareness::renew_local_state`].
    pub fn remove_outdated(&self, timeout: Duration) -> AwarenessChange {
        let mut change = AwarenessChange::new(ChangeOrigin::Timeout);
        {
            let mut guard = self.state();
            let now = Instant::now();
            let stale: Vec<ClientId> = guard
                .meta
                .iter()
                .filter(|(client, meta)| {
                    **client != self.client_id && now.duration_since(meta.last_updated) >= timeout
                })
                .map(|(client, _)| *client)
                .collect();
            for client in stale {
                if guard.states.remove(&client).is_some() {
                    change.removed.push(client);
                }
            }
        }
        self.emit(change)
    }
}

impl std::fmt::Debug for Awareness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Awareness")
            .field("client_id", &self.client_id)
            .field("clients", &self.state().states.len())
            .finish()
    }
}
