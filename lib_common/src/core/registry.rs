//! # Presence Registry
//!
//! Last-known liveness of every display that has ever reported in. One entry
//! per client id; a newer message always overwrites an older one, in the order
//! the coordinator observes them. Nothing is ever expired here: consumers
//! judge staleness from `last_seen`.

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Liveness states a display reports about itself.
///
/// Displays may grow new states without a server release, so anything outside
/// the known three is kept verbatim in [`PresenceStatus::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PresenceStatus {
    Alive,
    Dead,
    Shutdown,
    Other(String),
}

impl PresenceStatus {
    /// The statuses every display firmware is known to send.
    pub const KNOWN: [PresenceStatus; 3] = [PresenceStatus::Alive, PresenceStatus::Dead, PresenceStatus::Shutdown];

    pub fn as_str(&self) -> &str {
        match self {
            PresenceStatus::Alive => "ALIVE",
            PresenceStatus::Dead => "DEAD",
            PresenceStatus::Shutdown => "SHUTDOWN",
            PresenceStatus::Other(s) => s,
        }
    }
}

impl FromStr for PresenceStatus {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Ok(match trimmed {
            "ALIVE" => PresenceStatus::Alive,
            "DEAD" => PresenceStatus::Dead,
            "SHUTDOWN" => PresenceStatus::Shutdown,
            other => PresenceStatus::Other(other.to_string()),
        })
    }
}

impl From<&str> for PresenceStatus {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(status) => status,
            Err(never) => match never {},
        }
    }
}

impl From<String> for PresenceStatus {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(status) => status,
            Err(never) => match never {},
        }
    }
}

impl From<PresenceStatus> for String {
    fn from(status: PresenceStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One display's last report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientPresence {
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
}

/// Client id -> last report, behind a reader/writer lock.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    clients: RwLock<HashMap<String, ClientPresence>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `status` for `client_id`, replacing whatever was there.
    pub fn upsert(&self, client_id: &str, status: PresenceStatus, observed_at: DateTime<Utc>) -> ClientPresence {
        let presence = ClientPresence {
            status,
            last_seen: observed_at,
        };
        let mut clients = self.clients.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        clients.insert(client_id.to_string(), presence.clone());
        presence
    }

    /// Like [`upsert`](Self::upsert), then hands the per-status counts to
    /// `on_counts` before the write lock is released.
    ///
    /// Callers that mirror the counts elsewhere apply them in the same order the
    /// updates landed, so a slower caller never overwrites newer counts.
    pub fn upsert_with_counts<F>(
        &self,
        client_id: &str,
        status: PresenceStatus,
        observed_at: DateTime<Utc>,
        on_counts: F,
    ) -> ClientPresence
    where
        F: FnOnce(&BTreeMap<PresenceStatus, usize>),
    {
        let presence = ClientPresence {
            status,
            last_seen: observed_at,
        };
        let mut clients = self.clients.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        clients.insert(client_id.to_string(), presence.clone());
        on_counts(&tally(&clients));
        presence
    }

    /// Owned point-in-time copy, ordered by client id.
    pub fn snapshot(&self) -> BTreeMap<String, ClientPresence> {
        let clients = self.clients.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        clients.iter().map(|(id, p)| (id.clone(), p.clone())).collect()
    }

    pub fn get(&self, client_id: &str) -> Option<ClientPresence> {
        let clients = self.clients.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        clients.get(client_id).cloned()
    }

    /// Number of clients per status. Full scan; the fleet is a handful of devices.
    pub fn counts_by_status(&self) -> BTreeMap<PresenceStatus, usize> {
        let clients = self.clients.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        tally(&clients)
    }

    pub fn len(&self) -> usize {
        self.clients.read().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn tally(clients: &HashMap<String, ClientPresence>) -> BTreeMap<PresenceStatus, usize> {
    let mut counts = BTreeMap::new();
    for presence in clients.values() {
        *counts.entry(presence.status.clone()).or_insert(0) += 1;
    }
    counts
}
