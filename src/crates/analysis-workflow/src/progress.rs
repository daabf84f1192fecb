//! Progress notification
//!
//! The workflow never waits on a notification channel. [`ProgressNotifier::notify`]
//! pushes onto an unbounded queue and returns; a background task drains the
//! queue in order and hands each event to the [`NotificationSink`].
//!
//! ```text
//!  step executor ──notify()──► mpsc queue ──► delivery task ──► NotificationSink
//!                                               │
//!                                               ├─ drop stale generations
//!                                               ├─ drop regressions within a generation
//!                                               ├─ space each task's events by min_interval
//!                                               └─ retry failed sends with backoff
//! ```
//!
//! Within one generation of a task, delivered percentages never decrease. A
//! clean restart bumps the generation, after which lower percentages are
//! accepted again. Spacing is tracked per task: a task waiting out its
//! interval never holds back events of another task. Delivery state of a task
//! is dropped after its final event or [`ProgressNotifier::finish_task`].
//! Delivery failures are logged and never reach the workflow.

use crate::collaborators::NotificationSink;
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

/// One progress update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: String,
    pub step: String,
    pub percent: u8,
    pub message: String,
    pub generation: u32,
    /// Enqueue order across all tasks
    pub sequence: u64,
    pub emitted_at: DateTime<Utc>,
}

/// Delivery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierSettings {
    /// Minimum spacing between two deliveries for the same task
    pub min_interval_ms: u64,
    pub delivery_retry: RetryPolicy,
}

impl Default for NotifierSettings {
    fn default() -> Self {
        Self {
            min_interval_ms: 50,
            delivery_retry: RetryPolicy::new(3).with_initial_interval(0.1).with_max_interval(2.0),
        }
    }
}

enum Command {
    Deliver(ProgressEvent),
    Finish(String),
    Flush(oneshot::Sender<()>),
    Tracked(oneshot::Sender<usize>),
}

/// Non-blocking progress publisher
#[derive(Clone)]
pub struct ProgressNotifier {
    tx: mpsc::UnboundedSender<Command>,
    sequence: Arc<AtomicU64>,
}

impl ProgressNotifier {
    /// Start the delivery task on the current tokio runtime
    pub fn spawn(sink: Arc<dyn NotificationSink>, settings: NotifierSettings) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let delivery = Delivery {
            sink,
            settings,
            cursors: HashMap::new(),
            received: 0,
            flushes: Vec::new(),
        };
        tokio::spawn(delivery.run(rx));
        Self {
            tx,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue an event for the first generation of a task
    pub fn notify(&self, task_id: &str, step: &str, percent: u8, message: impl Into<String>) {
        self.notify_generation(task_id, step, percent, message, 0);
    }

    /// Queue an event tagged with a restart generation
    pub fn notify_generation(
        &self,
        task_id: &str,
        step: &str,
        percent: u8,
        message: impl Into<String>,
        generation: u32,
    ) {
        let event = ProgressEvent {
            task_id: task_id.to_string(),
            step: step.to_string(),
            percent: percent.min(100),
            message: message.into(),
            generation,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            emitted_at: Utc::now(),
        };
        if self.tx.send(Command::Deliver(event)).is_err() {
            debug!(task_id, step, "Progress delivery task has stopped, event dropped");
        }
    }

    /// Forget a task that reached a terminal state once its queued events are out
    pub fn finish_task(&self, task_id: &str) {
        if self.tx.send(Command::Finish(task_id.to_string())).is_err() {
            debug!(task_id, "Progress delivery task has stopped");
        }
    }

    /// Wait until every event queued before this call has been handled
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Number of tasks the delivery task still holds state for
    pub async fn tracked_tasks(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Tracked(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or_default()
    }
}

/// Delivery state of one task
struct TaskCursor {
    /// Generation and percent of the last accepted event
    generation: u32,
    percent: u8,
    /// Earliest time the next event may go out
    next_due: Instant,
    /// Accepted events not yet sent, with their arrival ticket
    pending: VecDeque<(u64, ProgressEvent)>,
    finished: bool,
}

impl TaskCursor {
    fn new(generation: u32) -> Self {
        Self {
            generation,
            percent: 0,
            next_due: Instant::now(),
            pending: VecDeque::new(),
            finished: false,
        }
    }

    /// Whether the head of the queue may be sent at `now`
    ///
    /// A final event skips the spacing.
    fn ready(&self, now: Instant) -> bool {
        match self.pending.front() {
            Some((_, event)) => event.percent >= 100 || self.next_due <= now,
            None => false,
        }
    }

    fn evictable(&self) -> bool {
        self.pending.is_empty() && (self.finished || self.percent >= 100)
    }
}

struct Delivery {
    sink: Arc<dyn NotificationSink>,
    settings: NotifierSettings,
    cursors: HashMap<String, TaskCursor>,
    /// Arrival counter; tickets start at 1
    received: u64,
    /// Flush waiters and the last ticket they cover
    flushes: Vec<(u64, oneshot::Sender<()>)>,
}

impl Delivery {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            self.dispatch_ready().await;
            self.resolve_flushes();

            let wake = self.next_wake();
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Deliver(event)) => self.accept(event),
                    Some(Command::Finish(task_id)) => self.finish(&task_id),
                    Some(Command::Flush(done)) => self.flushes.push((self.received, done)),
                    Some(Command::Tracked(reply)) => {
                        let _ = reply.send(self.cursors.len());
                    }
                    None => break,
                },
                _ = sleep_until(wake) => {}
            }
        }

        // senders are gone; drain what is left, still honouring the spacing
        while let Some(wake) = self.next_wake() {
            tokio::time::sleep_until(wake).await;
            self.dispatch_ready().await;
        }
        self.resolve_flushes();
        debug!("Progress delivery task finished");
    }

    /// Filter an incoming event and queue it behind the task's earlier events
    fn accept(&mut self, event: ProgressEvent) {
        let cursor = self
            .cursors
            .entry(event.task_id.clone())
            .or_insert_with(|| TaskCursor::new(event.generation));

        if event.generation < cursor.generation {
            debug!(
                task_id = %event.task_id,
                generation = event.generation,
                current = cursor.generation,
                "Dropping event from a superseded generation"
            );
            return;
        }
        if event.generation > cursor.generation {
            cursor.generation = event.generation;
            cursor.percent = 0;
            cursor.finished = false;
        } else if event.percent < cursor.percent {
            warn!(
                task_id = %event.task_id,
                percent = event.percent,
                last = cursor.percent,
                "Dropping progress regression"
            );
            return;
        }

        cursor.percent = event.percent;
        self.received += 1;
        cursor.pending.push_back((self.received, event));
    }

    fn finish(&mut self, task_id: &str) {
        if let Some(cursor) = self.cursors.get_mut(task_id) {
            cursor.finished = true;
            if cursor.evictable() {
                self.cursors.remove(task_id);
            }
        }
    }

    /// Send every head event whose due time has passed, until none is left
    async fn dispatch_ready(&mut self) {
        let min_interval = Duration::from_millis(self.settings.min_interval_ms);
        loop {
            let now = Instant::now();
            // oldest ready head first keeps cross-task order close to arrival order
            let next = self
                .cursors
                .iter()
                .filter(|(_, cursor)| cursor.ready(now))
                .filter_map(|(task_id, cursor)| cursor.pending.front().map(|(ticket, _)| (*ticket, task_id.clone())))
                .min();
            let Some((_, task_id)) = next else {
                return;
            };

            let Some((_, event)) = self.cursors.get_mut(&task_id).and_then(|c| c.pending.pop_front()) else {
                return;
            };
            self.send_with_retry(&event).await;

            if let Some(cursor) = self.cursors.get_mut(&task_id) {
                cursor.next_due = Instant::now() + min_interval;
                if cursor.evictable() {
                    self.cursors.remove(&task_id);
                }
            }
        }
    }

    /// Earliest due time among tasks with queued events
    fn next_wake(&self) -> Option<Instant> {
        self.cursors
            .values()
            .filter(|cursor| !cursor.pending.is_empty())
            .map(|cursor| cursor.next_due)
            .min()
    }

    fn resolve_flushes(&mut self) {
        let oldest_pending = self
            .cursors
            .values()
            .filter_map(|cursor| cursor.pending.front().map(|(ticket, _)| *ticket))
            .min();
        let (done, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.flushes)
            .into_iter()
            .partition(|(upto, _)| oldest_pending.map_or(true, |oldest| oldest > *upto));
        self.flushes = waiting;
        for (_, waiter) in done {
            let _ = waiter.send(());
        }
    }

    async fn send_with_retry(&self, event: &ProgressEvent) {
        let policy = &self.settings.delivery_retry;
        let mut attempts = 0usize;
        loop {
            match self.sink.send(event).await {
                Ok(()) => return,
                Err(e) => {
                    attempts += 1;
                    if !policy.should_retry(attempts) {
                        warn!(
                            task_id = %event.task_id,
                            step = %event.step,
                            attempts,
                            error = %e,
                            "Progress notification dropped"
                        );
                        return;
                    }
                    tokio::time::sleep(policy.calculate_delay(attempts - 1)).await;
                }
            }
        }
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PipelineError, Result};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<ProgressEvent>>,
        fail_first: AtomicUsize,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn send(&self, event: &ProgressEvent) -> Result<()> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(PipelineError::TransientProvider("socket closed".into()));
            }
            self.events.lock().await.push(event.clone());
            Ok(())
        }
    }

    fn fast_settings() -> NotifierSettings {
        NotifierSettings {
            min_interval_ms: 0,
            delivery_retry: RetryPolicy::new(3).with_initial_interval(0.001).with_jitter(false),
        }
    }

    async fn percents(sink: &RecordingSink) -> Vec<u8> {
        sink.events.lock().await.iter().map(|e| e.percent).collect()
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = ProgressNotifier::spawn(sink.clone(), fast_settings());

        for (step, pct) in [("validate_input", 5), ("extract_text", 35), ("check_compliance", 70)] {
            notifier.notify("t1", step, pct, "done");
        }
        notifier.flush().await;

        assert_eq!(percents(&sink).await, vec![5, 35, 70]);
        let events = sink.events.lock().await;
        assert!(events.windows(2).all(|w| w[0].sequence < w[1].sequence));
    }

    #[tokio::test]
    async fn test_regression_within_generation_dropped() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = ProgressNotifier::spawn(sink.clone(), fast_settings());

        notifier.notify("t1", "check_compliance", 70, "");
        notifier.notify("t1", "extract_text", 35, "");
        notifier.flush().await;

        assert_eq!(percents(&sink).await, vec![70]);
    }

    #[tokio::test]
    async fn test_new_generation_resets_progress() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = ProgressNotifier::spawn(sink.clone(), fast_settings());

        notifier.notify_generation("t1", "assess_risk", 85, "", 0);
        notifier.notify_generation("t1", "validate_input", 5, "restarted", 1);
        notifier.notify_generation("t1", "compile_report", 95, "late", 0);
        notifier.flush().await;

        assert_eq!(percents(&sink).await, vec![85, 5]);
    }

    #[tokio::test]
    async fn test_tasks_tracked_independently() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = ProgressNotifier::spawn(sink.clone(), fast_settings());

        notifier.notify("a", "s", 70, "");
        notifier.notify("b", "s", 5, "");
        notifier.flush().await;

        assert_eq!(percents(&sink).await, vec![70, 5]);
    }

    #[tokio::test]
    async fn test_failed_delivery_retried() {
        let sink = Arc::new(RecordingSink { fail_first: AtomicUsize::new(2), ..Default::default() });
        let notifier = ProgressNotifier::spawn(sink.clone(), fast_settings());

        notifier.notify("t1", "extract_text", 35, "");
        notifier.flush().await;

        assert_eq!(percents(&sink).await, vec![35]);
    }

    #[tokio::test]
    async fn test_exhausted_delivery_does_not_block_later_events() {
        let sink = Arc::new(RecordingSink { fail_first: AtomicUsize::new(3), ..Default::default() });
        let notifier = ProgressNotifier::spawn(sink.clone(), fast_settings());

        notifier.notify("t1", "validate_input", 5, "");
        notifier.notify("t1", "extract_text", 35, "");
        notifier.flush().await;

        assert_eq!(percents(&sink).await, vec![35]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_interval_spaces_deliveries() {
        let sink = Arc::new(RecordingSink::default());
        let settings = NotifierSettings { min_interval_ms: 1_000, ..fast_settings() };
        let notifier = ProgressNotifier::spawn(sink.clone(), settings);

        let started = Instant::now();
        notifier.notify("t1", "a", 10, "");
        notifier.notify("t1", "b", 20, "");
        notifier.notify("t1", "c", 100, "");
        notifier.flush().await;

        assert_eq!(percents(&sink).await, vec![10, 20, 100]);
        assert!(started.elapsed() >= Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spacing_of_one_task_does_not_hold_back_another() {
        let sink = Arc::new(RecordingSink::default());
        let settings = NotifierSettings { min_interval_ms: 1_000, ..fast_settings() };
        let notifier = ProgressNotifier::spawn(sink.clone(), settings);

        notifier.notify("slow", "a", 10, "");
        notifier.notify("slow", "b", 20, "");
        notifier.notify("other", "a", 5, "");
        notifier.flush().await;

        let delivered: Vec<(String, u8)> = sink
            .events
            .lock()
            .await
            .iter()
            .map(|e| (e.task_id.clone(), e.percent))
            .collect();
        assert_eq!(
            delivered,
            vec![("slow".to_string(), 10), ("other".to_string(), 5), ("slow".to_string(), 20)]
        );
    }

    #[tokio::test]
    async fn test_terminal_tasks_are_forgotten() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = ProgressNotifier::spawn(sink.clone(), fast_settings());

        notifier.notify("done", "compile_report", 100, "");
        notifier.notify("failed", "extract_text", 35, "");
        notifier.notify("running", "extract_text", 35, "");
        notifier.finish_task("failed");
        notifier.flush().await;
        assert_eq!(notifier.tracked_tasks().await, 1);

        // a restarted run of a forgotten task is delivered from scratch
        notifier.notify_generation("failed", "validate_input", 5, "", 1);
        notifier.flush().await;
        assert_eq!(percents(&sink).await, vec![100, 35, 35, 5]);
    }
}
