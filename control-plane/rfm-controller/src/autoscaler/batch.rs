use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Unit of work queued per matched webhook delivery: one autoscaler plus
/// the trigger pledge it matched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScaleTarget {
    pub namespace: String,
    pub name: String,
    pub amount: i64,
    pub duration_seconds: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TriggerAmount {
    pub amount: i64,
    pub duration_seconds: i64,
}

/// Persists one batch of trigger pledges onto a target autoscaler with an
/// optimistic write. The kube-backed implementation lives in the
/// controller; tests substitute their own.
#[async_trait]
pub trait ReservationApplier: Send + Sync {
    async fn apply(
        &self,
        namespace: &str,
        name: &str,
        triggers: &[TriggerAmount],
    ) -> anyhow::Result<()>;
}

/// Event-driven capacity-reservation pipeline.
///
/// Producers hand ScaleTargets to a bounded queue ([`submit`] awaits when
/// it is full, which is the backpressure contract). A single consumer task
/// wakes on a fixed interval, groups everything received since the last
/// tick by target identity, and applies one update per distinct target.
/// Targets whose write fails are retried on a capped exponential backoff
/// until they succeed or the controller shuts down.
///
/// [`submit`]: BatchScaler::submit
pub struct BatchScaler {
    tx: flume::Sender<ScaleTarget>,
}

impl BatchScaler {
    pub fn start(
        applier: Arc<dyn ReservationApplier>,
        capacity: usize,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = flume::bounded::<ScaleTarget>(capacity);
        tokio::spawn(consume_loop(applier, rx, interval, cancel));
        Self { tx }
    }

    /// Awaits while the hand-off queue is full.
    pub async fn submit(&self, target: ScaleTarget) -> anyhow::Result<()> {
        self.tx
            .send_async(target)
            .await
            .map_err(|_| anyhow::anyhow!("batch scaler is shut down"))
    }
}

async fn consume_loop(
    applier: Arc<dyn ReservationApplier>,
    rx: flume::Receiver<ScaleTarget>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("batch scaler: shutdown requested");
                return;
            }
            _ = ticker.tick() => {}
        }
        let mut received = Vec::new();
        while let Ok(t) = rx.try_recv() {
            received.push(t);
        }
        if received.is_empty() {
            continue;
        }
        let batch = group_targets(received);
        debug!(targets = batch.len(), "batch scaler: applying batch");
        run_batch(applier.as_ref(), batch, &cancel).await;
    }
}

/// Groups queued targets by identity, concatenating their triggers in
/// arrival order.
pub fn group_targets(
    received: Vec<ScaleTarget>,
) -> BTreeMap<(String, String), Vec<TriggerAmount>> {
    let mut batch: BTreeMap<(String, String), Vec<TriggerAmount>> =
        BTreeMap::new();
    for t in received {
        batch
            .entry((t.namespace, t.name))
            .or_default()
            .push(TriggerAmount {
                amount: t.amount,
                duration_seconds: t.duration_seconds,
            });
    }
    batch
}

/// Retry schedule: 1s, 2s, 4s, 8s, 16s, then flat 16s.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1 << attempt.min(4))
}

/// Applies one update per target; the failed subset is retried on the
/// backoff schedule until everything succeeds or shutdown is requested.
pub async fn run_batch(
    applier: &dyn ReservationApplier,
    mut batch: BTreeMap<(String, String), Vec<TriggerAmount>>,
    cancel: &CancellationToken,
) {
    let mut attempt: u32 = 0;
    loop {
        let mut failed = BTreeMap::new();
        for ((ns, name), triggers) in batch {
            match applier.apply(&ns, &name, &triggers).await {
                Ok(()) => {
                    debug!(%ns, %name, count = triggers.len(), "reservations applied");
                }
                Err(e) => {
                    warn!(%ns, %name, error = %e, attempt, "reservation update failed; will retry");
                    failed.insert((ns, name), triggers);
                }
            }
        }
        if failed.is_empty() {
            return;
        }
        let delay = backoff_delay(attempt);
        attempt += 1;
        tokio::select! {
            _ = cancel.cancelled() => {
                warn!(remaining = failed.len(), "batch scaler: shutdown with unapplied targets");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
        batch = failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn target(ns: &str, name: &str, amount: i64) -> ScaleTarget {
        ScaleTarget {
            namespace: ns.into(),
            name: name.into(),
            amount,
            duration_seconds: 300,
        }
    }

    #[test]
    fn grouping_concatenates_triggers_per_target() {
        let batch = group_targets(vec![
            target("ns", "a", 1),
            target("ns", "b", 2),
            target("ns", "a", 3),
        ]);
        assert_eq!(batch.len(), 2);
        let a = &batch[&("ns".to_string(), "a".to_string())];
        assert_eq!(
            a.iter().map(|t| t.amount).collect::<Vec<_>>(),
            vec![1, 3]
        );
    }

    #[test]
    fn backoff_schedule_caps_at_sixteen_seconds() {
        let secs: Vec<u64> =
            (0..7).map(|a| backoff_delay(a).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 16, 16]);
    }

    struct FlakyApplier {
        // remaining failures per target name
        failures: Mutex<BTreeMap<String, u32>>,
        applied: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ReservationApplier for FlakyApplier {
        async fn apply(
            &self,
            _ns: &str,
            name: &str,
            _triggers: &[TriggerAmount],
        ) -> anyhow::Result<()> {
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(name) {
                if *left > 0 {
                    *left -= 1;
                    anyhow::bail!("transient conflict");
                }
            }
            drop(failures);
            self.applied.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn only_failed_subset_is_retried() {
        let applier = FlakyApplier {
            failures: Mutex::new(BTreeMap::from([("b".to_string(), 2)])),
            applied: Mutex::new(vec![]),
        };
        let batch = group_targets(vec![
            target("ns", "a", 1),
            target("ns", "b", 1),
        ]);
        let cancel = CancellationToken::new();
        run_batch(&applier, batch, &cancel).await;
        let applied = applier.applied.lock().unwrap().clone();
        // "a" applied exactly once, "b" succeeds on the third attempt.
        assert_eq!(
            applied.iter().filter(|n| n.as_str() == "a").count(),
            1
        );
        assert_eq!(
            applied.iter().filter(|n| n.as_str() == "b").count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abandons_retry_loop() {
        let applier = FlakyApplier {
            failures: Mutex::new(BTreeMap::from([("a".to_string(), u32::MAX)])),
            applied: Mutex::new(vec![]),
        };
        let batch = group_targets(vec![target("ns", "a", 1)]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        run_batch(&applier, batch, &cancel).await;
        assert!(applier.applied.lock().unwrap().is_empty());
    }
}
