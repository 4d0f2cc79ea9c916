//! Outbox delivery engine
//!
//! Drains the store one record at a time, strict FIFO by insertion order,
//! to bound resource use and respect collector rate limits. A failing head
//! record blocks everything behind it until it succeeds: ordering over
//! throughput. Retries are unbounded with capped exponential backoff; the
//! durable store, not the shutdown hook, is the safety net against loss.

use crate::config::DeliveryConfig;
use crate::error::Result;
use crate::relay::{Message, RelayHub};
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

use super::Collector;

/// Capped exponential backoff: `min(initial * 2^(n-1), max)`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    initial: Duration,
    max: Duration,
}

impl RetryPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_secs(config.max_delay_secs),
        )
    }

    /// Delay before the next attempt, given how many have failed so far.
    pub fn delay_for(&self, retry_count: i64) -> Duration {
        let exp = retry_count.saturating_sub(1).clamp(0, 30) as u32;
        let factor = 1u32 << exp;
        self.initial
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy)]
pub struct FlushReport {
    /// Records delivered and swept this pass
    pub delivered: usize,
    /// Records still awaiting delivery
    pub pending: usize,
    /// Backoff before the head should be retried, if the pass stalled
    pub next_retry: Option<Duration>,
}

/// Drains the durable outbox to the remote collector.
pub struct DeliveryEngine<C: Collector> {
    store: Arc<Store>,
    collector: Arc<C>,
    relay: RelayHub,
    policy: RetryPolicy,
    timezone: String,
    flush_interval: Duration,
}

impl<C: Collector> DeliveryEngine<C> {
    pub fn new(
        store: Arc<Store>,
        collector: Arc<C>,
        relay: RelayHub,
        config: &DeliveryConfig,
        timezone: String,
    ) -> Self {
        Self {
            store,
            collector,
            relay,
            policy: RetryPolicy::from_config(config),
            timezone,
            flush_interval: Duration::from_secs(config.flush_interval_secs),
        }
    }

    /// One flush pass: deliver from the head until the outbox is empty or
    /// the head fails.
    ///
    /// Each success is marked and swept before the next record is touched
    /// (two-phase: a crash between mark and sweep leaves a `synced = true`
    /// record that the next sweep removes without re-delivery). On failure
    /// the head's retry counter is persisted and the computed backoff is
    /// returned; no record behind the head is attempted.
    pub async fn drain(&self) -> Result<FlushReport> {
        let mut delivered = 0;

        loop {
            let head = match self.store.head_unsynced()? {
                Some(head) => head,
                None => break,
            };

            match self.collector.post_event(&head).await {
                Ok(()) => {
                    self.store.mark_synced(&[head.local_id])?;
                    self.store.sweep_synced()?;
                    delivered += 1;
                    tracing::info!(local_id = head.local_id, "Comment delivered");
                    self.request_count_refresh(&head.event.actor_key);
                }
                Err(e) => {
                    let retries = self.store.bump_retry(head.local_id)?;
                    let delay = self.policy.delay_for(retries);
                    tracing::warn!(
                        local_id = head.local_id,
                        retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Delivery failed, backing off"
                    );
                    return Ok(FlushReport {
                        delivered,
                        pending: self.store.pending_count()? as usize,
                        next_retry: Some(delay),
                    });
                }
            }
        }

        Ok(FlushReport {
            delivered,
            pending: 0,
            next_retry: None,
        })
    }

    /// Ask the aggregator to refresh the actor's daily count. Best effort;
    /// the reply comes back through the relay as `CountUpdated`.
    fn request_count_refresh(&self, actor_key: &str) {
        let date = chrono::Local::now().date_naive().to_string();
        self.relay.publish(Message::RequestCount {
            actor_key: actor_key.to_string(),
            date,
            timezone: self.timezone.clone(),
        });
    }

    /// Long-running flush loop.
    ///
    /// Wakes on the watcher's captured signal, on the periodic timer, and
    /// once more, best effort, when shutdown is signalled.
    pub async fn run(&self, captured: Arc<Notify>, mut shutdown: watch::Receiver<bool>) {
        let mut next_wake = Duration::ZERO; // drain whatever survived the last run

        loop {
            tokio::select! {
                _ = tokio::time::sleep(next_wake) => {}
                _ = captured.notified() => {}
                res = shutdown.changed() => {
                    let _ = res;
                    if let Err(e) = self.drain().await {
                        tracing::warn!(error = %e, "Shutdown flush failed");
                    }
                    break;
                }
            }

            next_wake = match self.drain().await {
                Ok(report) => {
                    if report.delivered > 0 {
                        tracing::debug!(
                            delivered = report.delivered,
                            pending = report.pending,
                            "Flush pass complete"
                        );
                    }
                    report.next_retry.unwrap_or(self.flush_interval)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Outbox drain failed");
                    self.policy.delay_for(1)
                }
            };
        }
    }
}
