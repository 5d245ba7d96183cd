//! Shared application state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use flowrun_client::TaskApi;
use flowrun_core::{LogSignalDetector, TaskId, Vocabulary, WorkflowDefinition};

use crate::config::MonitorConfig;
use crate::dispatcher::JobDispatcher;
use crate::ledger::JobLedger;
use crate::poller::{MonitorHandle, MonitorState, MonitorView, TaskMonitor};

/// Shared application state.
pub struct AppState {
    /// Monitors indexed by TaskId. Exited ones linger until the next `watch`.
    pub monitors: RwLock<HashMap<TaskId, MonitorHandle>>,

    pub dispatcher: Arc<JobDispatcher>,

    api: Arc<dyn TaskApi>,
    config: MonitorConfig,
    workflow: Arc<WorkflowDefinition>,
    vocabulary: Vocabulary,
}

impl AppState {
    /// Create a new AppState wrapped in Arc.
    pub fn new(
        api: Arc<dyn TaskApi>,
        dispatcher: Arc<JobDispatcher>,
        workflow: WorkflowDefinition,
        vocabulary: Vocabulary,
        config: MonitorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            monitors: RwLock::new(HashMap::new()),
            dispatcher,
            api,
            config,
            workflow: Arc::new(workflow),
            vocabulary,
        })
    }

    pub fn ledger(&self) -> &Arc<dyn JobLedger> {
        self.dispatcher.ledger()
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Start monitoring `task_id`. Returns false if a monitor for it is
    /// already running. Exited monitors are evicted here.
    pub async fn watch(&self, task_id: TaskId) -> bool {
        let mut monitors = self.monitors.write().await;
        if monitors.get(&task_id).is_some_and(MonitorHandle::is_running) {
            return false;
        }
        let before = monitors.len();
        monitors.retain(|_, handle| handle.is_running());
        if monitors.len() < before {
            debug!(evicted = before - monitors.len(), "Dropped exited monitors");
        }

        let detector = LogSignalDetector::new(self.vocabulary.clone())
            .with_window(self.config.log_window)
            .with_cooldown(self.config.signal_cooldown);
        let state = MonitorState::new(
            task_id.clone(),
            self.workflow.clone(),
            Box::new(detector),
            &self.config,
        );
        let (monitor, handle) =
            TaskMonitor::new(state, self.api.clone(), self.dispatcher.clone(), &self.config);
        monitor.spawn();
        log_progress(handle.clone());

        info!(task_id = %task_id, "Watching task");
        monitors.insert(task_id, handle);
        true
    }

    pub async fn handle(&self, task_id: &TaskId) -> Option<MonitorHandle> {
        self.monitors.read().await.get(task_id).cloned()
    }

    /// Latest view of every monitor, ordered by task id.
    pub async fn views(&self) -> Vec<MonitorView> {
        let monitors = self.monitors.read().await;
        let mut views: Vec<MonitorView> = monitors.values().map(MonitorHandle::view).collect();
        views.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        views
    }

    /// Ask every running monitor to stop.
    pub async fn shutdown(&self) {
        let handles: Vec<MonitorHandle> = self.monitors.read().await.values().cloned().collect();
        for handle in handles {
            handle.stop().await;
        }
    }
}

/// Log progress changes of one monitor until it exits.
fn log_progress(handle: MonitorHandle) {
    let mut views = handle.subscribe();
    tokio::spawn(async move {
        let mut last = None;
        while views.changed().await.is_ok() {
            let view = views.borrow_and_update().clone();
            let key = (view.status, view.progress.percentage, view.current_agent.clone());
            if last.as_ref() != Some(&key) {
                info!(
                    task_id = %view.task_id,
                    status = ?view.status,
                    percentage = view.progress.percentage,
                    phase = ?view.progress.phase.as_ref().map(|p| p.label.as_str()),
                    agent = %view.current_agent,
                    "Progress"
                );
                last = Some(key);
            }
            if view.finished {
                break;
            }
        }
    });
}
