use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One entry of a lock request. `locking = false` is a probe: it is checked
/// against existing locks but never acquires the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    pub key: String,
    #[serde(default)]
    pub locking: bool,
}

impl LockRequest {
    pub fn lock(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            locking: true,
        }
    }

    pub fn probe(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            locking: false,
        }
    }
}

/// Per-key outcome of a lock request. Encoded as `0` / `1` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Ok = 0,
    Locked = 1,
}

impl Serialize for KeyState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for KeyState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(KeyState::Ok),
            1 => Ok(KeyState::Locked),
            other => Err(serde::de::Error::custom(format!(
                "invalid key state {other}"
            ))),
        }
    }
}

/// Who holds a key and since when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    pub date: DateTime<Utc>,
    pub agent: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStatus {
    pub per_key_state: Vec<KeyState>,
    pub version: u64,
    pub updated: bool,
    pub ok: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseStatus {
    pub version: u64,
    pub updated: bool,
}

/// Versioned map of held keys.
///
/// Every governor holds its own copy. The version grows by exactly one per
/// mutating call and is compared across governors to detect divergence; a
/// diverged copy is replaced wholesale by the leader's snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedLockState {
    pub locks: BTreeMap<String, LockEntry>,
    pub version: u64,
}

impl SharedLockState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.locks.contains_key(key)
    }

    /// Check every requested key and, if none is held, acquire the ones
    /// flagged `locking`.
    ///
    /// A held key blocks the whole request even when the entry naming it is
    /// only a probe. A blocked request mutates nothing.
    pub fn apply_locks(
        &mut self,
        requests: &[LockRequest],
        date: DateTime<Utc>,
        agent: &str,
    ) -> LockStatus {
        let per_key_state: Vec<KeyState> = requests
            .iter()
            .map(|req| {
                if self.is_locked(&req.key) {
                    KeyState::Locked
                } else {
                    KeyState::Ok
                }
            })
            .collect();
        let ok = !per_key_state.contains(&KeyState::Locked);

        let mut updated = false;
        if ok {
            for req in requests.iter().filter(|r| r.locking) {
                self.locks.insert(
                    req.key.clone(),
                    LockEntry {
                        date,
                        agent: agent.to_string(),
                    },
                );
                updated = true;
            }
        }

        if updated {
            self.version += 1;
        }

        LockStatus {
            per_key_state,
            version: self.version,
            updated,
            ok,
        }
    }

    /// Drop the keys flagged `locking` that `agent` holds. Probes are
    /// ignored, as are keys another agent has taken since.
    pub fn release_locks(&mut self, requests: &[LockRequest], agent: &str) -> ReleaseStatus {
        let mut updated = false;
        for req in requests.iter().filter(|r| r.locking) {
            if self.locks.get(&req.key).is_some_and(|entry| entry.agent == agent) {
                self.locks.remove(&req.key);
                updated = true;
            }
        }

        if updated {
            self.version += 1;
        }

        ReleaseStatus {
            version: self.version,
            updated,
        }
    }

    /// Drop every key owned by `agent`.
    pub fn clear_agent_locks(&mut self, agent: &str) -> ReleaseStatus {
        let before = self.locks.len();
        self.locks.retain(|_, entry| entry.agent != agent);
        let updated = self.locks.len() != before;

        if updated {
            self.version += 1;
        }

        ReleaseStatus {
            version: self.version,
            updated,
        }
    }

    /// Replace this copy with a snapshot fetched from the leader.
    pub fn replace(&mut self, snapshot: SharedLockState) {
        *self = snapshot;
    }
}
