use std::sync::Arc;

use easel_contracts::session::StatusPatch;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::config::TimingConfig;
use crate::store::SessionStore;

/// Synthetic progress for providers that do not stream any.
///
/// A fixed-interval ticker walks the message from `progress_start` to
/// `progress_ceiling` over `progress_duration`, stopping early once the
/// message stops generating.
#[derive(Clone)]
pub struct ProgressEstimator {
    store: Arc<SessionStore>,
    clock: Arc<dyn Clock>,
    timing: TimingConfig,
}

/// Stops the ticker when dropped.
#[derive(Debug)]
pub struct ProgressHandle {
    task: JoinHandle<()>,
}

impl ProgressHandle {
    pub fn stop(self) {}

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ProgressHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl ProgressEstimator {
    pub fn new(store: Arc<SessionStore>, clock: Arc<dyn Clock>, timing: TimingConfig) -> Self {
        Self {
            store,
            clock,
            timing,
        }
    }

    pub fn start(&self, message_id: &str) -> ProgressHandle {
        let estimator = self.clone();
        let message_id = message_id.to_string();
        let task = tokio::spawn(async move {
            estimator.run(&message_id).await;
        });
        ProgressHandle { task }
    }

    /// Value the ticker reports after `step` of `steps` ticks.
    pub fn value_at(&self, step: u64, steps: u64) -> u8 {
        let start = u64::from(self.timing.progress_start);
        let ceiling = u64::from(self.timing.progress_ceiling.max(self.timing.progress_start));
        let steps = steps.max(1);
        let value = start + (ceiling - start) * step.min(steps) / steps;
        value.min(ceiling) as u8
    }

    fn steps(&self) -> u64 {
        let tick = self.timing.progress_tick().as_millis().max(1);
        let total = self.timing.progress_duration().as_millis();
        u64::try_from(total / tick).unwrap_or(u64::MAX).max(1)
    }

    async fn run(&self, message_id: &str) {
        let steps = self.steps();
        let ceiling = self.timing.progress_ceiling;
        let mut last = self.timing.progress_start;
        for step in 1..=steps {
            self.clock.sleep(self.timing.progress_tick()).await;
            let generating = self
                .store
                .message(message_id)
                .is_some_and(|message| message.is_generating());
            if !generating {
                tracing::trace!(target: "pipeline", message_id, "progress ticker settled");
                return;
            }
            let value = self.value_at(step, steps);
            if value > last {
                self.store
                    .update_message_status(message_id, StatusPatch::progress(value));
                last = value;
            }
            if value >= ceiling {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use easel_contracts::events::MemorySink;
    use easel_contracts::layout::placeholder_id_for;
    use easel_contracts::session::{MessageDraft, StatusPatch};

    use super::ProgressEstimator;
    use crate::clock::TokioClock;
    use crate::config::TimingConfig;
    use crate::store::SessionStore;

    fn timing() -> TimingConfig {
        TimingConfig {
            progress_tick_ms: 100,
            progress_duration_ms: 1_000,
            ..TimingConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_rise_monotonically_to_the_ceiling() {
        let sink = Arc::new(MemorySink::new());
        let store = Arc::new(SessionStore::new(sink.clone(), Arc::new(TokioClock)));
        let message = store.add_message(MessageDraft::assistant("working"));
        store.update_message_status(&message.id, StatusPatch::started(15, "preparing"));

        let estimator = ProgressEstimator::new(store.clone(), Arc::new(TokioClock), timing());
        let handle = estimator.start(&message.id);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(handle.is_finished());

        let ticks = sink.progress_for(&placeholder_id_for(&message.id));
        assert!(ticks.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(ticks.last().copied(), Some(95));
        assert_eq!(ticks.len(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_stops_when_the_message_settles() {
        let sink = Arc::new(MemorySink::new());
        let store = Arc::new(SessionStore::new(sink.clone(), Arc::new(TokioClock)));
        let message = store.add_message(MessageDraft::assistant("working"));
        store.update_message_status(&message.id, StatusPatch::started(15, "preparing"));

        let estimator = ProgressEstimator::new(store.clone(), Arc::new(TokioClock), timing());
        let _handle = estimator.start(&message.id);
        tokio::time::sleep(Duration::from_millis(250)).await;
        store.update_message_status(&message.id, StatusPatch::succeeded());
        tokio::time::sleep(Duration::from_secs(2)).await;

        let status = store.message(&message.id).and_then(|m| m.status).expect("status");
        assert_eq!(status.progress, 100);
        assert!(!status.is_generating);
    }

    #[test]
    fn value_is_clamped_between_start_and_ceiling() {
        let store = Arc::new(SessionStore::new(
            Arc::new(MemorySink::new()),
            Arc::new(TokioClock),
        ));
        let estimator = ProgressEstimator::new(store, Arc::new(TokioClock), TimingConfig::default());
        assert_eq!(estimator.value_at(0, 120), 15);
        assert_eq!(estimator.value_at(60, 120), 55);
        assert_eq!(estimator.value_at(500, 120), 95);
    }
}
