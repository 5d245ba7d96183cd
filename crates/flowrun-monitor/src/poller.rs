//! Per-task monitoring loop.
//!
//! A [`TaskMonitor`] owns everything known about one task: the progress
//! snapshot, the log tail, the signal detector and the intent coordinator.
//! The loop never awaits network I/O itself. Refreshes and dispatches run
//! as spawned tasks and report back over channels, so ticks, commands and
//! results are handled one at a time by the loop alone.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use flowrun_client::{ClientError, TaskApi};
use flowrun_core::{
    CurrentAgent, ExecutionIntent, IntentKind, JobReference, LogLine, LogSignal, LogTail,
    MonitorSnapshot, Progress, ProgressSnapshot, SignalDetector, TaskId, TaskStatus,
    WorkflowDefinition,
};

use crate::config::MonitorConfig;
use crate::coordinator::{CoordinatorState, Decision, DropReason, IntentCoordinator, Outcome};
use crate::dispatcher::{DispatchError, JobDispatcher};

/// Instant on the runtime clock, which tests can pause and advance.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Commands accepted by a running monitor.
#[derive(Debug)]
pub enum MonitorCommand {
    /// Ask for an intent to be dispatched. The reply carries the admission
    /// decision, not the delivery result.
    Trigger {
        intent: ExecutionIntent,
        reply: Option<oneshot::Sender<Decision>>,
    },
    Stop,
}

/// Whether refreshes are currently succeeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MonitorHealth {
    Healthy,
    Degraded { consecutive_failures: u32 },
}

/// What a monitor publishes after every change.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorView {
    pub task_id: TaskId,
    /// `None` until the first successful refresh.
    pub status: Option<TaskStatus>,
    pub progress: Progress,
    pub current_agent: CurrentAgent,
    pub run_kind: IntentKind,
    pub signal: LogSignal,
    pub health: MonitorHealth,
    pub coordinator: CoordinatorState,
    /// Delivered jobs whose effect has not been observed yet.
    pub pending_jobs: usize,
    pub result_link: Option<String>,
    pub error_message: Option<String>,
    pub last_refresh: Option<DateTime<Utc>>,
    /// The monitor loop has exited.
    pub finished: bool,
}

/// One successful refresh.
#[derive(Debug, Clone)]
pub struct Refresh {
    pub snapshot: MonitorSnapshot,
    pub logs: Vec<LogLine>,
    /// When the fetch was issued.
    pub requested_at: Instant,
}

/// Side effects the loop must carry out after a refresh.
#[derive(Debug)]
pub struct RefreshOutcome {
    pub decision: Decision,
    pub acknowledged: Vec<JobReference>,
}

#[derive(Debug, Clone)]
struct PendingEffect {
    reference: JobReference,
    intent: ExecutionIntent,
    delivered_at: Instant,
    /// Newest task status seen since delivery, or the last one before it.
    previous: Option<TaskStatus>,
}

/// Result of one spawned dispatch.
#[derive(Debug)]
struct DispatchDone {
    intent: ExecutionIntent,
    result: Result<JobReference, DispatchError>,
}

/// Synchronous monitor state. All time-dependent methods take `now`.
pub struct MonitorState {
    task_id: TaskId,
    workflow: Arc<WorkflowDefinition>,
    workflow_ref: Option<String>,
    progress: ProgressSnapshot,
    tail: LogTail,
    detector: Box<dyn SignalDetector>,
    coordinator: IntentCoordinator,
    last: Option<MonitorSnapshot>,
    last_refresh: Option<DateTime<Utc>>,
    signal: LogSignal,
    consecutive_failures: u32,
    degraded_threshold: u32,
    pending: Vec<PendingEffect>,
    effect_timeout: Duration,
    dispatches_in_flight: usize,
}

impl MonitorState {
    pub fn new(
        task_id: TaskId,
        workflow: Arc<WorkflowDefinition>,
        detector: Box<dyn SignalDetector>,
        config: &MonitorConfig,
    ) -> Self {
        Self {
            task_id,
            workflow,
            workflow_ref: config.workflow_ref.clone(),
            progress: ProgressSnapshot::start(Vec::new()),
            tail: LogTail::new(config.log_window),
            detector,
            coordinator: IntentCoordinator::new(config.debounce),
            last: None,
            last_refresh: None,
            signal: LogSignal::None,
            consecutive_failures: 0,
            degraded_threshold: config.degraded_threshold.max(1),
            pending: Vec::new(),
            effect_timeout: config.effect_timeout,
            dispatches_in_flight: 0,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Sequence number to resume log fetching after.
    pub fn after_seq(&self) -> Option<u64> {
        self.tail.last_seq()
    }

    pub fn health(&self) -> MonitorHealth {
        if self.consecutive_failures >= self.degraded_threshold {
            MonitorHealth::Degraded {
                consecutive_failures: self.consecutive_failures,
            }
        } else {
            MonitorHealth::Healthy
        }
    }

    /// Fold a successful refresh in and decide on automatic recovery.
    pub fn apply_refresh(&mut self, refresh: Refresh, now: Instant) -> RefreshOutcome {
        if self.consecutive_failures >= self.degraded_threshold {
            info!(
                task_id = %self.task_id,
                failures = self.consecutive_failures,
                "Monitoring recovered"
            );
        }
        self.consecutive_failures = 0;

        let Refresh {
            mut snapshot,
            logs,
            requested_at,
        } = refresh;
        if snapshot.workflow_sequence.is_empty() {
            snapshot.workflow_sequence = self.workflow.agents().to_vec();
        }

        let status = snapshot.status;
        let mut acknowledged = Vec::new();
        let mut rerun_started = false;
        let timeout = self.effect_timeout;
        let task_id = &self.task_id;
        self.pending.retain_mut(|effect| {
            if requested_at >= effect.delivered_at {
                if effect.intent.effect_observed(effect.previous, status) {
                    rerun_started |= effect.intent.kind() == IntentKind::Rerun;
                    acknowledged.push(effect.reference.clone());
                    return false;
                }
                effect.previous = Some(status);
            }
            if now.saturating_duration_since(effect.delivered_at) >= timeout {
                warn!(
                    task_id = %task_id,
                    reference = %effect.reference,
                    kind = %effect.intent.kind(),
                    "Job effect not observed before timeout"
                );
                return false;
            }
            true
        });

        if rerun_started {
            self.progress.confirm_run();
        }
        self.progress.observe(&snapshot);
        let appended = self.tail.append(logs);
        let detection = self.detector.scan(self.tail.lines(), now);

        if detection.ambiguous > 0 {
            debug!(
                task_id = %self.task_id,
                count = detection.ambiguous,
                "Ignoring quota-like lines without engine origin"
            );
        }
        if detection.suppressed {
            debug!(
                task_id = %self.task_id,
                seq = ?detection.seq,
                "Quota signal suppressed after recent rotation"
            );
        }
        if detection.signal != self.signal {
            info!(
                task_id = %self.task_id,
                from = ?self.signal,
                to = ?detection.signal,
                "Log signal changed"
            );
        }
        self.signal = detection.signal;

        let recoverable = status == TaskStatus::InProgress || self.is_retriable(&snapshot);
        let decision = if recoverable {
            self.coordinator
                .on_signal(&detection, self.workflow_ref.clone(), now)
        } else {
            Decision::Drop(DropReason::NotActionable)
        };

        debug!(
            task_id = %self.task_id,
            status = %status,
            new_lines = appended,
            "Refresh applied"
        );

        self.last = Some(snapshot);
        self.last_refresh = Some(Utc::now());

        RefreshOutcome {
            decision,
            acknowledged,
        }
    }

    /// Count a failed refresh. Returns the resulting health.
    pub fn record_failure(&mut self, error: &ClientError) -> MonitorHealth {
        self.consecutive_failures += 1;
        if self.consecutive_failures == self.degraded_threshold {
            warn!(
                task_id = %self.task_id,
                failures = self.consecutive_failures,
                error = %error,
                "Monitoring degraded"
            );
        } else {
            warn!(
                task_id = %self.task_id,
                failures = self.consecutive_failures,
                error = %error,
                "Refresh failed"
            );
        }
        self.health()
    }

    pub fn accept_trigger(&mut self, intent: ExecutionIntent, now: Instant) -> Decision {
        self.coordinator.on_trigger(intent, now)
    }

    pub fn dispatch_started(&mut self, count: usize) {
        self.dispatches_in_flight += count;
    }

    /// Record the result of one dispatch.
    pub fn dispatch_finished(
        &mut self,
        intent: &ExecutionIntent,
        result: &Result<JobReference, DispatchError>,
        now: Instant,
    ) {
        self.dispatches_in_flight = self.dispatches_in_flight.saturating_sub(1);

        match result {
            Ok(reference) => {
                if intent.starts_run() {
                    self.begin(intent);
                    // A new run supersedes any cancellation still waiting.
                    self.pending
                        .retain(|effect| effect.intent.kind() != IntentKind::Cancel);
                    self.coordinator
                        .finish(intent.kind(), Outcome::Acknowledged, now);
                }
                self.pending.push(PendingEffect {
                    reference: reference.clone(),
                    intent: intent.clone(),
                    delivered_at: now,
                    previous: self.last.as_ref().map(|s| s.status),
                });
            }
            Err(e) => {
                warn!(
                    task_id = %self.task_id,
                    kind = %intent.kind(),
                    error = %e,
                    "Dispatch failed"
                );
                self.coordinator.finish(intent.kind(), Outcome::Failed, now);
            }
        }
    }

    /// Apply an intent's local effect on the progress snapshot.
    fn begin(&mut self, intent: &ExecutionIntent) {
        let sequence = intent.sequence().map(<[String]>::to_vec);
        match intent.kind() {
            IntentKind::Submit => {
                self.progress = ProgressSnapshot::start(sequence.unwrap_or_default());
            }
            IntentKind::Rerun => self.progress.rerun(sequence),
            IntentKind::Resume => self.progress.resume(),
            IntentKind::Cancel => {}
        }
    }

    fn is_retriable(&self, snapshot: &MonitorSnapshot) -> bool {
        snapshot.status == TaskStatus::Failed
            && snapshot
                .error_message
                .as_deref()
                .is_some_and(|e| self.detector.is_retriable_failure(e))
    }

    /// True once the task is terminal and nothing of ours is outstanding.
    pub fn is_finished(&self) -> bool {
        let Some(last) = &self.last else {
            return false;
        };
        last.status.is_terminal(self.is_retriable(last))
            && self.pending.is_empty()
            && self.dispatches_in_flight == 0
            && self.coordinator.in_flight().is_none()
    }

    pub fn view(&self, now: Instant) -> MonitorView {
        let backend = self.last.as_ref().and_then(MonitorSnapshot::backend_percentage);
        MonitorView {
            task_id: self.task_id.clone(),
            status: self.last.as_ref().map(|s| s.status),
            progress: self.progress.progress(&self.workflow, backend),
            current_agent: self.progress.current().clone(),
            run_kind: self.progress.run_kind(),
            signal: self.signal,
            health: self.health(),
            coordinator: self.coordinator.state(now),
            pending_jobs: self.pending.len(),
            result_link: self.last.as_ref().and_then(|s| s.result_link.clone()),
            error_message: self.last.as_ref().and_then(|s| s.error_message.clone()),
            last_refresh: self.last_refresh,
            finished: false,
        }
    }
}

/// Error returned when talking to a monitor that has exited.
#[derive(Debug, thiserror::Error)]
#[error("monitor for task {0} is not running")]
pub struct MonitorClosed(pub TaskId);

/// Caller side of a running [`TaskMonitor`].
#[derive(Clone)]
pub struct MonitorHandle {
    task_id: TaskId,
    commands: mpsc::Sender<MonitorCommand>,
    view: watch::Receiver<MonitorView>,
}

impl MonitorHandle {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Submit an intent and wait for the admission decision.
    pub async fn trigger(&self, intent: ExecutionIntent) -> Result<Decision, MonitorClosed> {
        let (reply, decision) = oneshot::channel();
        self.commands
            .send(MonitorCommand::Trigger {
                intent,
                reply: Some(reply),
            })
            .await
            .map_err(|_| MonitorClosed(self.task_id.clone()))?;
        decision.await.map_err(|_| MonitorClosed(self.task_id.clone()))
    }

    pub async fn stop(&self) {
        let _ = self.commands.send(MonitorCommand::Stop).await;
    }

    pub fn view(&self) -> MonitorView {
        self.view.borrow().clone()
    }

    /// Receiver notified on every published view.
    pub fn subscribe(&self) -> watch::Receiver<MonitorView> {
        self.view.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

/// Polling loop for one task.
pub struct TaskMonitor {
    state: MonitorState,
    api: Arc<dyn TaskApi>,
    dispatcher: Arc<JobDispatcher>,
    poll_interval: Duration,
    log_page_limit: usize,
    commands: mpsc::Receiver<MonitorCommand>,
    view: watch::Sender<MonitorView>,
}

impl TaskMonitor {
    pub fn new(
        state: MonitorState,
        api: Arc<dyn TaskApi>,
        dispatcher: Arc<JobDispatcher>,
        config: &MonitorConfig,
    ) -> (Self, MonitorHandle) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (view_tx, view_rx) = watch::channel(state.view(now()));
        let handle = MonitorHandle {
            task_id: state.task_id().clone(),
            commands: command_tx,
            view: view_rx,
        };
        let monitor = Self {
            state,
            api,
            dispatcher,
            poll_interval: config.poll_interval,
            log_page_limit: config.log_page_limit,
            commands: command_rx,
            view: view_tx,
        };
        (monitor, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        let (refresh_tx, mut refresh_rx) = mpsc::channel(1);
        let (done_tx, mut done_rx) = mpsc::channel::<DispatchDone>(8);
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut refreshing = false;

        info!(task_id = %self.state.task_id(), "Monitor started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if refreshing {
                        debug!(
                            task_id = %self.state.task_id(),
                            "Refresh still running, skipping tick"
                        );
                        continue;
                    }
                    refreshing = true;
                    self.spawn_refresh(refresh_tx.clone());
                }
                Some(result) = refresh_rx.recv() => {
                    refreshing = false;
                    match result {
                        Ok(refresh) => {
                            let outcome = self.state.apply_refresh(refresh, now());
                            self.acknowledge(outcome.acknowledged);
                            self.launch(outcome.decision, &done_tx);
                        }
                        Err(e) => {
                            self.state.record_failure(&e);
                        }
                    }
                }
                Some(done) = done_rx.recv() => {
                    self.state.dispatch_finished(&done.intent, &done.result, now());
                }
                command = self.commands.recv() => match command {
                    Some(MonitorCommand::Trigger { intent, reply }) => {
                        let decision = self.state.accept_trigger(intent, now());
                        if let Some(reply) = reply {
                            let _ = reply.send(decision.clone());
                        }
                        self.launch(decision, &done_tx);
                    }
                    Some(MonitorCommand::Stop) | None => {
                        info!(task_id = %self.state.task_id(), "Monitor stopped");
                        break;
                    }
                },
            }

            self.publish(false);
            if self.state.is_finished() {
                info!(task_id = %self.state.task_id(), "Task settled, monitor exiting");
                break;
            }
        }

        self.publish(true);
    }

    fn publish(&self, finished: bool) {
        let mut view = self.state.view(now());
        view.finished = finished;
        self.view.send_replace(view);
    }

    fn spawn_refresh(&self, tx: mpsc::Sender<Result<Refresh, ClientError>>) {
        let api = self.api.clone();
        let task_id = self.state.task_id().clone();
        let after_seq = self.state.after_seq();
        let limit = self.log_page_limit;

        tokio::spawn(async move {
            let result = fetch(api.as_ref(), &task_id, after_seq, limit).await;
            let _ = tx.send(result).await;
        });
    }

    fn acknowledge(&self, references: Vec<JobReference>) {
        if references.is_empty() {
            return;
        }
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            for reference in references {
                if let Err(e) = dispatcher.acknowledge(&reference).await {
                    warn!(reference = %reference, error = %e, "Failed to acknowledge job");
                }
            }
        });
    }

    fn launch(&mut self, decision: Decision, done_tx: &mpsc::Sender<DispatchDone>) {
        let task_id = self.state.task_id().clone();
        let dispatcher = self.dispatcher.clone();
        let done_tx = done_tx.clone();

        match decision {
            Decision::Dispatch(intent) => {
                self.state.dispatch_started(1);
                tokio::spawn(async move {
                    let result = dispatcher.dispatch(&intent, &task_id).await;
                    let _ = done_tx.send(DispatchDone { intent, result }).await;
                });
            }
            Decision::Recover { resume } => {
                info!(
                    task_id = %task_id,
                    "Quota exhausted and key rotated, cancelling and resuming"
                );
                self.state.dispatch_started(2);
                tokio::spawn(async move {
                    let cancel = ExecutionIntent::Cancel;
                    let result = dispatcher.dispatch(&cancel, &task_id).await;
                    if let Err(e) = &result {
                        error!(
                            task_id = %task_id,
                            error = %e,
                            "Recovery cancel failed, resuming anyway"
                        );
                    }
                    let _ = done_tx.send(DispatchDone { intent: cancel, result }).await;

                    let result = dispatcher.dispatch(&resume, &task_id).await;
                    let _ = done_tx.send(DispatchDone { intent: resume, result }).await;
                });
            }
            Decision::Drop(reason) => {
                debug!(task_id = %task_id, reason = ?reason, "Intent dropped");
            }
        }
    }
}

async fn fetch(
    api: &dyn TaskApi,
    task_id: &TaskId,
    after_seq: Option<u64>,
    limit: usize,
) -> Result<Refresh, ClientError> {
    let requested_at = now();
    let (snapshot, logs) = tokio::try_join!(
        api.monitor(task_id),
        api.logs(task_id, after_seq, limit)
    )?;
    Ok(Refresh {
        snapshot,
        logs,
        requested_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::tests::ScriptedProcessor;
    use crate::ledger::{InMemoryLedger, JobLedger};
    use async_trait::async_trait;
    use flowrun_client::IntentParams;
    use flowrun_core::{JobStatus, JobType, LogLevel, LogSignalDetector, Phase};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory system of record.
    #[derive(Default)]
    struct FakeApi {
        snapshot: Mutex<MonitorSnapshot>,
        logs: Mutex<Vec<LogLine>>,
        cancels: Mutex<Vec<TaskId>>,
        failing: AtomicBool,
        cancel_fails: AtomicBool,
        /// How long each monitor fetch takes.
        monitor_delay: Duration,
        fetches: AtomicUsize,
        fetching: AtomicUsize,
        max_fetching: AtomicUsize,
    }

    impl FakeApi {
        fn set_status(&self, status: TaskStatus) {
            self.snapshot.lock().unwrap().status = status;
        }

        fn push_log(&self, seq: u64, message: &str) {
            self.logs
                .lock()
                .unwrap()
                .push(LogLine::new(seq, LogLevel::Warning, message));
        }
    }

    #[async_trait]
    impl TaskApi for FakeApi {
        async fn monitor(&self, _task_id: &TaskId) -> Result<MonitorSnapshot, ClientError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let fetching = self.fetching.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_fetching.fetch_max(fetching, Ordering::SeqCst);
            if !self.monitor_delay.is_zero() {
                tokio::time::sleep(self.monitor_delay).await;
            }
            self.fetching.fetch_sub(1, Ordering::SeqCst);

            if self.failing.load(Ordering::SeqCst) {
                return Err(ClientError::Status {
                    status: 503,
                    body: "unavailable".into(),
                });
            }
            Ok(self.snapshot.lock().unwrap().clone())
        }

        async fn logs(
            &self,
            _task_id: &TaskId,
            after_seq: Option<u64>,
            limit: usize,
        ) -> Result<Vec<LogLine>, ClientError> {
            Ok(self
                .logs
                .lock()
                .unwrap()
                .iter()
                .filter(|l| after_seq.map_or(true, |after| l.seq > after))
                .take(limit)
                .cloned()
                .collect())
        }

        async fn cancel(
            &self,
            task_id: &TaskId,
            _params: &IntentParams,
        ) -> Result<(), ClientError> {
            self.cancels.lock().unwrap().push(task_id.clone());
            if self.cancel_fails.load(Ordering::SeqCst) {
                return Err(ClientError::Status {
                    status: 409,
                    body: "task is not running".into(),
                });
            }
            Ok(())
        }
    }

    struct Harness {
        api: Arc<FakeApi>,
        processor: Arc<ScriptedProcessor>,
        ledger: Arc<dyn JobLedger>,
        handle: MonitorHandle,
        join: JoinHandle<()>,
    }

    fn workflow() -> Arc<WorkflowDefinition> {
        Arc::new(
            WorkflowDefinition::phased(vec![
                Phase::new("planning", "web", ["analyst", "pm"]),
                Phase::new("development", "cli", ["developer", "qa"]),
            ])
            .unwrap(),
        )
    }

    fn start(api: FakeApi) -> Harness {
        start_with(api, ScriptedProcessor::default())
    }

    fn start_with(api: FakeApi, processor: ScriptedProcessor) -> Harness {
        let config = MonitorConfig {
            workflow_ref: Some("bmad".into()),
            ..MonitorConfig::default()
        };
        let api = Arc::new(api);
        let processor = Arc::new(processor);
        let ledger: Arc<dyn JobLedger> = Arc::new(InMemoryLedger::new());
        let dispatcher = Arc::new(JobDispatcher::new(
            api.clone(),
            processor.clone(),
            ledger.clone(),
            "http://api.local/api",
        ));

        let state = MonitorState::new(
            TaskId::new("t1"),
            workflow(),
            Box::new(LogSignalDetector::default()),
            &config,
        );
        let (monitor, handle) = TaskMonitor::new(state, api.clone(), dispatcher, &config);
        let join = monitor.spawn();

        Harness {
            api,
            processor,
            ledger,
            handle,
            join,
        }
    }

    fn submit() -> ExecutionIntent {
        ExecutionIntent::Submit {
            prompt: "write a parser".into(),
            workflow_ref: "bmad".into(),
            sequence: None,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_submit_creates_one_job() {
        let h = start(FakeApi::default());

        let first = h.handle.trigger(submit()).await.unwrap();
        assert!(matches!(first, Decision::Dispatch(_)));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let second = h.handle.trigger(submit()).await.unwrap();
        assert!(matches!(
            second,
            Decision::Drop(DropReason::InFlight | DropReason::Debounce { .. })
        ));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.ledger.list(None).await.unwrap().len(), 1);
        assert_eq!(h.processor.received().len(), 1);

        h.handle.stop().await;
        h.join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_is_acknowledged_when_run_starts() {
        let h = start(FakeApi::default());
        h.handle.trigger(submit()).await.unwrap();
        settle().await;

        let jobs = h.ledger.list(None).await.unwrap();
        assert_eq!(jobs[0].status, JobStatus::Delivered);

        {
            let mut snapshot = h.api.snapshot.lock().unwrap();
            snapshot.status = TaskStatus::InProgress;
            snapshot.current_agent = Some("pm".into());
            snapshot.completed_agents = vec!["analyst".into()];
            snapshot.workflow_sequence =
                vec!["analyst".into(), "pm".into(), "developer".into(), "qa".into()];
        }
        tokio::time::sleep(Duration::from_secs(3)).await;

        let jobs = h.ledger.list(None).await.unwrap();
        assert_eq!(jobs[0].status, JobStatus::Acknowledged);

        let view = h.handle.view();
        assert_eq!(view.status, Some(TaskStatus::InProgress));
        assert_eq!(view.progress.percentage, 25);
        assert_eq!(view.current_agent, CurrentAgent::Named("pm".into()));
        assert_eq!(view.pending_jobs, 0);

        h.handle.stop().await;
        h.join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_after_consecutive_failures() {
        let api = FakeApi::default();
        api.failing.store(true, Ordering::SeqCst);
        let h = start(api);

        // Ticks at 0, 2, 4 and 6 seconds.
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(h.handle.view().health, MonitorHealth::Healthy);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            h.handle.view().health,
            MonitorHealth::Degraded {
                consecutive_failures: 5
            }
        );

        h.api.failing.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.handle.view().health, MonitorHealth::Healthy);

        h.handle.stop().await;
        h.join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_combined_marker_triggers_one_recovery() {
        let api = FakeApi::default();
        api.set_status(TaskStatus::InProgress);
        api.push_log(1, "[gemini] analyst started");
        api.push_log(2, "[gemini] quota exhausted and rotated to the next key");
        let h = start(api);

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(h.api.cancels.lock().unwrap().len(), 1);
        let requests = h.processor.received();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].job_type, JobType::ResumeWorkflow);
        assert_eq!(requests[0].parameters["workflow_ref"], "bmad");
        assert_eq!(h.ledger.list(None).await.unwrap().len(), 2);

        h.handle.stop().await;
        h.join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_exits_once_task_settles() {
        let api = FakeApi::default();
        api.set_status(TaskStatus::Completed);
        api.snapshot.lock().unwrap().result_link = Some("https://results/t1".into());
        let h = start(api);

        h.join.await.unwrap();
        let view = h.handle.view();
        assert!(view.finished);
        assert_eq!(view.result_link.as_deref(), Some("https://results/t1"));
        assert!(!h.handle.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_failure_keeps_polling() {
        let api = FakeApi::default();
        api.set_status(TaskStatus::Failed);
        api.snapshot.lock().unwrap().error_message =
            Some("gemini: 429 RESOURCE_EXHAUSTED".into());
        let h = start(api);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(h.handle.is_running());

        h.api.snapshot.lock().unwrap().error_message = Some("syntax error".into());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!h.handle.is_running());
        h.join.await.unwrap();
    }

    #[test]
    fn test_state_waits_for_pending_cancel() {
        let config = MonitorConfig::default();
        let mut state = MonitorState::new(
            TaskId::new("t1"),
            workflow(),
            Box::new(LogSignalDetector::default()),
            &config,
        );
        let t0 = Instant::now();

        state.dispatch_started(1);
        state.dispatch_finished(
            &ExecutionIntent::Cancel,
            &Ok(JobReference::new("job-t-00000001")),
            t0,
        );

        let running = MonitorSnapshot {
            status: TaskStatus::InProgress,
            ..Default::default()
        };
        let outcome = state.apply_refresh(
            Refresh {
                snapshot: running,
                logs: Vec::new(),
                requested_at: t0 + Duration::from_secs(1),
            },
            t0 + Duration::from_secs(1),
        );
        assert!(outcome.acknowledged.is_empty());
        assert!(!state.is_finished());

        let cancelled = MonitorSnapshot {
            status: TaskStatus::Cancelled,
            ..Default::default()
        };
        let outcome = state.apply_refresh(
            Refresh {
                snapshot: cancelled,
                logs: Vec::new(),
                requested_at: t0 + Duration::from_secs(3),
            },
            t0 + Duration::from_secs(3),
        );
        assert_eq!(outcome.acknowledged, vec![JobReference::new("job-t-00000001")]);
        assert!(state.is_finished());
    }

    #[test]
    fn test_unobserved_effect_expires() {
        let config = MonitorConfig::default();
        let mut state = MonitorState::new(
            TaskId::new("t1"),
            workflow(),
            Box::new(LogSignalDetector::default()),
            &config,
        );
        let t0 = Instant::now();

        state.dispatch_started(1);
        state.dispatch_finished(
            &ExecutionIntent::resume(None),
            &Ok(JobReference::new("job-t-00000001")),
            t0,
        );
        assert_eq!(state.view(t0).pending_jobs, 1);

        let paused = MonitorSnapshot {
            status: TaskStatus::Paused,
            ..Default::default()
        };
        let later = t0 + config.effect_timeout;
        let outcome = state.apply_refresh(
            Refresh {
                snapshot: paused,
                logs: Vec::new(),
                requested_at: later,
            },
            later,
        );
        assert!(outcome.acknowledged.is_empty());
        assert_eq!(state.view(later).pending_jobs, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_submit_still_debounces_the_next_one() {
        let processor = ScriptedProcessor::failing_with(vec![ClientError::Status {
            status: 503,
            body: "processor busy".into(),
        }]);
        let h = start_with(FakeApi::default(), processor);

        let first = h.handle.trigger(submit()).await.unwrap();
        assert!(matches!(first, Decision::Dispatch(_)));
        settle().await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        let second = h.handle.trigger(submit()).await.unwrap();
        assert!(matches!(second, Decision::Drop(DropReason::Debounce { .. })));

        settle().await;
        let jobs = h.ledger.list(None).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert_eq!(h.processor.received().len(), 1);

        h.handle.stop().await;
        h.join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_recovery_cancel_still_resumes() {
        let api = FakeApi::default();
        api.set_status(TaskStatus::InProgress);
        api.cancel_fails.store(true, Ordering::SeqCst);
        api.push_log(1, "[gemini] quota exhausted and rotated to the next key");
        let h = start(api);

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(h.api.cancels.lock().unwrap().len(), 1);
        let requests = h.processor.received();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].job_type, JobType::ResumeWorkflow);

        let jobs = h.ledger.list(None).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].intent, ExecutionIntent::Cancel);
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert_eq!(jobs[1].status, JobStatus::Delivered);

        h.handle.stop().await;
        h.join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_refresh_skips_ticks() {
        let api = FakeApi {
            monitor_delay: Duration::from_secs(5),
            ..FakeApi::default()
        };
        api.set_status(TaskStatus::InProgress);
        let h = start(api);

        // Ticks every 2s, each fetch takes 5s: fetches start at 0, 6, 12 and 18.
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert_eq!(h.api.max_fetching.load(Ordering::SeqCst), 1);
        let fetches = h.api.fetches.load(Ordering::SeqCst);
        assert!((3..=4).contains(&fetches), "fetches = {fetches}");

        h.handle.stop().await;
        h.join.await.unwrap();
    }

    fn state() -> MonitorState {
        MonitorState::new(
            TaskId::new("t1"),
            workflow(),
            Box::new(LogSignalDetector::default()),
            &MonitorConfig::default(),
        )
    }

    fn refreshed(status: TaskStatus, completed: &[&str], at: Instant) -> Refresh {
        Refresh {
            snapshot: MonitorSnapshot {
                status,
                completed_agents: completed.iter().map(|a| a.to_string()).collect(),
                workflow_sequence: vec!["analyst".into(), "pm".into(), "developer".into()],
                ..Default::default()
            },
            logs: Vec::new(),
            requested_at: at,
        }
    }

    #[test]
    fn test_resume_of_running_task_waits_for_restart() {
        let mut state = state();
        let t0 = Instant::now();
        let secs = |n| t0 + Duration::from_secs(n);

        state.apply_refresh(refreshed(TaskStatus::InProgress, &[], t0), t0);
        state.dispatch_started(1);
        state.dispatch_finished(
            &ExecutionIntent::resume(None),
            &Ok(JobReference::new("job-t-00000001")),
            secs(1),
        );

        let outcome = state.apply_refresh(refreshed(TaskStatus::InProgress, &[], secs(2)), secs(2));
        assert!(outcome.acknowledged.is_empty());

        let outcome = state.apply_refresh(refreshed(TaskStatus::Paused, &[], secs(4)), secs(4));
        assert!(outcome.acknowledged.is_empty());

        let outcome = state.apply_refresh(refreshed(TaskStatus::InProgress, &[], secs(6)), secs(6));
        assert_eq!(outcome.acknowledged, vec![JobReference::new("job-t-00000001")]);
    }

    #[test]
    fn test_acknowledged_rerun_trusts_new_reports() {
        let mut state = state();
        let t0 = Instant::now();
        let secs = |n| t0 + Duration::from_secs(n);

        state.apply_refresh(refreshed(TaskStatus::Completed, &["analyst"], t0), t0);
        let rerun = ExecutionIntent::Rerun {
            prompt: "again".into(),
            workflow_ref: None,
            sequence: None,
        };
        state.dispatch_started(1);
        state.dispatch_finished(&rerun, &Ok(JobReference::new("job-t-00000001")), secs(1));

        // Still the old run.
        state.apply_refresh(refreshed(TaskStatus::Completed, &["analyst", "pm"], secs(2)), secs(2));
        assert_eq!(state.view(secs(2)).progress.percentage, 0);

        // The new run started and already finished the first agent again.
        let outcome =
            state.apply_refresh(refreshed(TaskStatus::InProgress, &["analyst"], secs(4)), secs(4));
        assert_eq!(outcome.acknowledged.len(), 1);
        assert_eq!(state.view(secs(4)).progress.percentage, 33);
    }

    #[test]
    fn test_missing_sequence_falls_back_to_workflow() {
        let mut state = state();
        let t0 = Instant::now();
        let mut refresh = refreshed(TaskStatus::InProgress, &["analyst"], t0);
        refresh.snapshot.workflow_sequence.clear();

        state.apply_refresh(refresh, t0);
        let progress = state.view(t0).progress;
        assert_eq!(progress.percentage, 25);
        assert_eq!(progress.phase.unwrap().label, "planning");
    }
}
