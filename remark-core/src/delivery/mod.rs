//! Delivery layer: reliable forwarding of the outbox to a remote collector
//!
//! ```text
//! ┌────────────┐     ┌────────────────┐     ┌───────────────┐
//! │   Store    │ ──► │ DeliveryEngine │ ──► │   Collector   │
//! │  (outbox)  │     │  (FIFO drain)  │     │ (remote HTTP) │
//! └────────────┘     └────────────────┘     └───────────────┘
//!                           │
//!                           ▼
//!                    ┌────────────┐
//!                    │  RelayHub  │  count refresh round-trip
//!                    └────────────┘
//! ```
//!
//! Delivery is at-least-once: a lost acknowledgment means a retry re-sends
//! an already-accepted record, so every payload carries a stable
//! `event_key` the collector dedups on.

pub mod client;
pub mod engine;

pub use client::CollectorClient;
pub use engine::{DeliveryEngine, FlushReport, RetryPolicy};

use crate::error::Result;
use crate::identity::IdentityResolver;
use crate::relay::{Message, RelayHub};
use crate::types::StoredComment;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Remote collector capability.
///
/// The engine and the count responder are generic over this so tests can
/// script outcomes instead of waiting on wall-clock network calls.
pub trait Collector: Send + Sync {
    /// Deliver one event; any error is a retryable delivery failure.
    fn post_event(&self, record: &StoredComment) -> impl Future<Output = Result<()>> + Send;

    /// Daily admitted-comment count for an actor. `Ok(None)` is a soft
    /// failure: callers fall back to the last known value.
    fn fetch_count(
        &self,
        actor_key: &str,
        date: &str,
        timezone: &str,
    ) -> impl Future<Output = Result<Option<i64>>> + Send;
}

/// Answer relay requests until shutdown.
///
/// `RequestCount` round-trips to the collector and comes back as
/// `CountUpdated`; on a soft failure the last successfully fetched value
/// for that actor is re-broadcast instead. `RequestIdentity` is answered
/// from the resolver so presentation processes never run extraction.
pub async fn run_responder<C: Collector>(
    collector: Arc<C>,
    resolver: Arc<IdentityResolver>,
    hub: RelayHub,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut rx = hub.subscribe();
    let mut last_counts: HashMap<String, i64> = HashMap::new();

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Ok(Message::RequestCount { actor_key, date, timezone }) => {
                    let count = match collector.fetch_count(&actor_key, &date, &timezone).await {
                        Ok(Some(count)) => {
                            last_counts.insert(actor_key.clone(), count);
                            Some(count)
                        }
                        Ok(None) => {
                            tracing::debug!(actor = %actor_key, "Count unavailable, using last known");
                            last_counts.get(&actor_key).copied()
                        }
                        Err(e) => {
                            tracing::warn!(actor = %actor_key, error = %e, "Count query failed");
                            last_counts.get(&actor_key).copied()
                        }
                    };
                    if let Some(count) = count {
                        hub.publish(Message::CountUpdated { count });
                    }
                }
                Ok(Message::RequestIdentity) => {
                    let identity = resolver.resolve().unwrap_or_default();
                    hub.publish(Message::IdentityReply { identity });
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Responder lagged behind the relay");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            res = shutdown.changed() => {
                let _ = res;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Collector double whose count query can be switched to soft-fail.
    struct CountingCollector {
        soft_fail: AtomicBool,
    }

    impl Collector for CountingCollector {
        async fn post_event(&self, _: &StoredComment) -> Result<()> {
            Ok(())
        }

        async fn fetch_count(&self, _: &str, _: &str, _: &str) -> Result<Option<i64>> {
            if self.soft_fail.load(Ordering::SeqCst) {
                Ok(None)
            } else {
                Ok(Some(4))
            }
        }
    }

    async fn next_count(rx: &mut broadcast::Receiver<Message>) -> i64 {
        loop {
            match tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("timed out waiting for CountUpdated")
            {
                Ok(Message::CountUpdated { count }) => return count,
                Ok(_) => continue,
                Err(e) => panic!("relay closed: {:?}", e),
            }
        }
    }

    #[tokio::test]
    async fn test_responder_answers_count_and_falls_back() {
        let collector = Arc::new(CountingCollector {
            soft_fail: AtomicBool::new(false),
        });
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.migrate().unwrap();
        let resolver = Arc::new(IdentityResolver::new(store, vec![]));
        let hub = RelayHub::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let responder = tokio::spawn(run_responder(
            Arc::clone(&collector),
            resolver,
            hub.clone(),
            shutdown_rx,
        ));

        let mut rx = hub.subscribe();
        let request = Message::RequestCount {
            actor_key: "/in/jane".to_string(),
            date: "2025-06-01".to_string(),
            timezone: "UTC".to_string(),
        };

        // Let the spawned responder subscribe to the hub before the first
        // publish; broadcast drops messages sent before a receiver exists.
        tokio::time::sleep(Duration::from_millis(50)).await;
        hub.publish(request.clone());
        assert_eq!(next_count(&mut rx).await, 4);

        // Collector starts soft-failing: the last known value is relayed
        collector.soft_fail.store(true, Ordering::SeqCst);
        hub.publish(request);
        assert_eq!(next_count(&mut rx).await, 4);

        shutdown_tx.send(true).unwrap();
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_responder_replies_identity() {
        let collector = Arc::new(CountingCollector {
            soft_fail: AtomicBool::new(false),
        });
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.migrate().unwrap();
        store
            .set_identity(&crate::types::ActorIdentity::new("Jane", "/in/jane"))
            .unwrap();
        let resolver = Arc::new(IdentityResolver::new(store, vec![]));
        let hub = RelayHub::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let responder = tokio::spawn(run_responder(
            collector,
            resolver,
            hub.clone(),
            shutdown_rx,
        ));

        let mut rx = hub.subscribe();
        // Let the spawned responder subscribe to the hub before publishing;
        // broadcast drops messages sent before a receiver exists.
        tokio::time::sleep(Duration::from_millis(50)).await;
        hub.publish(Message::RequestIdentity);

        let identity = loop {
            match tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("timed out waiting for IdentityReply")
            {
                Ok(Message::IdentityReply { identity }) => break identity,
                Ok(_) => continue,
                Err(e) => panic!("relay closed: {:?}", e),
            }
        };
        assert_eq!(identity.key, "/in/jane");

        shutdown_tx.send(true).unwrap();
        responder.await.unwrap();
    }
}
