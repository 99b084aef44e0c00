//! Idempotency cache with single-flight de-duplication.
//!
//! Key = SHA-256 over tenant prefix ‖ tool name ‖ canonical(arguments) ‖ stable
//! suffix, so identical calls within the TTL replay the cached response and
//! concurrent identical calls await the first invocation instead of dialing the
//! tool again. Shared across requests; tenant isolation lives in the key.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::watch;

use crate::state::canonical_string;

use super::envelope::ToolResponse;

/// Deterministic at-most-once key.
pub fn derive_key(tenant: &str, tool_name: &str, arguments: &serde_json::Value, suffix: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tenant.as_bytes());
    hasher.update(b"|");
    hasher.update(tool_name.as_bytes());
    hasher.update(b"|");
    hasher.update(canonical_string(arguments).as_bytes());
    hasher.update(b"|");
    hasher.update(suffix.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

type FlightResult = Option<Result<ToolResponse, String>>;

enum Slot {
    Ready {
        response: ToolResponse,
        stored_at: Instant,
    },
    InFlight {
        rx: watch::Receiver<FlightResult>,
    },
}

/// What a caller holds after `begin`: a cached response, a ticket to await the
/// in-flight leader, or leadership of this key.
pub(crate) enum Begin {
    Cached(ToolResponse),
    Wait(watch::Receiver<FlightResult>),
    Lead(LeadGuard),
}

/// Shared cache. Cheap to clone.
#[derive(Clone, Default)]
pub struct IdempotencyCache {
    slots: Arc<DashMap<String, Slot>>,
}

impl IdempotencyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn begin(&self, key: &str, ttl: Duration) -> Begin {
        use dashmap::mapref::entry::Entry;
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => match occupied.get() {
                Slot::Ready { response, stored_at } if stored_at.elapsed() < ttl => {
                    Begin::Cached(response.clone())
                }
                Slot::InFlight { rx } => Begin::Wait(rx.clone()),
                Slot::Ready { .. } => {
                    // Expired: current caller leads a fresh invocation.
                    let (tx, rx) = watch::channel(None);
                    occupied.insert(Slot::InFlight { rx });
                    Begin::Lead(LeadGuard {
                        key: key.to_string(),
                        tx,
                        slots: self.slots.clone(),
                        settled: false,
                    })
                }
            },
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(None);
                vacant.insert(Slot::InFlight { rx });
                Begin::Lead(LeadGuard {
                    key: key.to_string(),
                    tx,
                    slots: self.slots.clone(),
                    settled: false,
                })
            }
        }
    }

    /// Entries currently resident (ready or in flight). Test/metric hook.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Leadership of one in-flight key. Dropping it unsettled (cancellation, panic)
/// clears the slot and releases any waiters to retry, so a cancelled request
/// never leaves its keys wedged.
pub(crate) struct LeadGuard {
    key: String,
    tx: watch::Sender<FlightResult>,
    slots: Arc<DashMap<String, Slot>>,
    settled: bool,
}

impl LeadGuard {
    /// Publishes a definitive response to all waiters. `cache_it` keeps it for
    /// TTL replay (ok and fatal outcomes); transient failures pass `false`.
    pub(crate) fn complete(mut self, response: ToolResponse, cache_it: bool) {
        if cache_it {
            self.slots.insert(
                self.key.clone(),
                Slot::Ready {
                    response: response.clone(),
                    stored_at: Instant::now(),
                },
            );
        } else {
            self.slots.remove(&self.key);
        }
        let _ = self.tx.send(Some(Ok(response)));
        self.settled = true;
    }

    /// Publishes a failure and clears the slot; waiters re-enter `begin`.
    pub(crate) fn fail(mut self, message: impl Into<String>) {
        self.slots.remove(&self.key);
        let _ = self.tx.send(Some(Err(message.into())));
        self.settled = true;
    }
}

impl Drop for LeadGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.slots.remove(&self.key);
            let _ = self.tx.send(Some(Err("invocation aborted".into())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// **Scenario**: Keys are tenant-scoped: identical calls from two tenants
    /// derive distinct keys.
    #[test]
    fn keys_are_tenant_scoped() {
        let args = json!({"epic": "Checkout", "title": "Apply coupon"});
        let a = derive_key("t1", "tasks.create_story", &args, "");
        let b = derive_key("t2", "tasks.create_story", &args, "");
        assert_ne!(a, b);
    }

    /// **Scenario**: Argument key order does not change the key.
    #[test]
    fn keys_ignore_argument_order() {
        let a: serde_json::Value = serde_json::from_str(r#"{"epic":"E","title":"T"}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"title":"T","epic":"E"}"#).unwrap();
        assert_eq!(
            derive_key("t", "tool", &a, ""),
            derive_key("t", "tool", &b, "")
        );
    }

    /// **Scenario**: A completed key replays from cache; after the TTL it leads again.
    #[tokio::test]
    async fn ready_entries_replay_within_ttl() {
        let cache = IdempotencyCache::new();
        let ttl = Duration::from_secs(60);

        let Begin::Lead(guard) = cache.begin("k", ttl) else {
            panic!("first caller should lead");
        };
        guard.complete(ToolResponse::ok(json!({"story_id": "S-1"})), true);

        match cache.begin("k", ttl) {
            Begin::Cached(resp) => assert_eq!(resp.value.unwrap()["story_id"], "S-1"),
            _ => panic!("second caller should hit the cache"),
        }

        match cache.begin("k", Duration::ZERO) {
            Begin::Lead(_) => {}
            _ => panic!("expired entry should elect a new leader"),
        }
    }

    /// **Scenario**: A concurrent caller waits and receives the leader's response.
    #[tokio::test]
    async fn waiter_receives_leader_result() {
        let cache = IdempotencyCache::new();
        let ttl = Duration::from_secs(60);

        let Begin::Lead(guard) = cache.begin("k", ttl) else {
            panic!("expected leadership");
        };
        let Begin::Wait(mut rx) = cache.begin("k", ttl) else {
            panic!("expected wait");
        };

        let waiter = tokio::spawn(async move {
            loop {
                if let Some(result) = rx.borrow().clone() {
                    return result;
                }
                if rx.changed().await.is_err() {
                    return Err("leader gone".into());
                }
            }
        });

        guard.complete(ToolResponse::ok(json!(1)), true);
        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.value.unwrap(), json!(1));
    }

    /// **Scenario**: Dropping the guard unsettled clears the slot and fails waiters.
    #[tokio::test]
    async fn dropped_guard_releases_waiters() {
        let cache = IdempotencyCache::new();
        let ttl = Duration::from_secs(60);
        let Begin::Lead(guard) = cache.begin("k", ttl) else {
            panic!("expected leadership");
        };
        let Begin::Wait(mut rx) = cache.begin("k", ttl) else {
            panic!("expected wait");
        };

        drop(guard);
        rx.changed().await.unwrap();
        assert!(rx.borrow().clone().unwrap().is_err());
        assert!(cache.is_empty());
    }
}
