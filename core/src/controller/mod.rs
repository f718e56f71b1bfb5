//! Public entry point for starting, stopping and observing scripts.
//!
//! Caller-driven operations and exit handling are serialized by one lifecycle
//! gate. Waiter tasks never touch published state directly: they report exits
//! over a channel and the controller's event loop applies them under the gate,
//! so classification always sees the latest stop request.

mod waiter;

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::Weak;

use chrono::DateTime;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::LifecycleConfig;
use crate::error::LifecycleError;
use crate::error::Result;
use crate::process::ProcessHandle;
use crate::process::TerminationSignal;
use crate::process::is_alive;
use crate::process::is_same_process;
use crate::process::send_signal;
use crate::process::spawn_script;
use crate::process::start_token;
use crate::registry::ProcessRegistry;
use crate::run_index::PersistedRunEntry;
use crate::run_index::PersistentRunIndex;
use crate::run_state::RunState;
use crate::run_state::RunStateChange;
use crate::script::ScriptDefinition;
use crate::script::ScriptId;

use waiter::ExitOutcome;
use waiter::ProcessExited;
use waiter::Waiter;

const STATE_CHANNEL_CAPACITY: usize = 256;

/// What `reconcile_on_startup` did with each persisted entry.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Still alive; now tracked by pid without an owned handle.
    pub adopted: Vec<ScriptId>,
    /// Process gone; entry removed and state reset to idle.
    pub discarded: Vec<ScriptId>,
    /// Script no longer in the catalog; entry removed silently.
    pub pruned: Vec<ScriptId>,
}

#[derive(Clone)]
pub struct LifecycleController {
    inner: Arc<Inner>,
}

struct Inner {
    config: LifecycleConfig,
    registry: Arc<ProcessRegistry>,
    run_index: StdMutex<PersistentRunIndex>,
    states: StdMutex<BTreeMap<ScriptId, RunState>>,
    updates: broadcast::Sender<RunStateChange>,
    lifecycle_gate: Mutex<()>,
    exit_tx: mpsc::UnboundedSender<ProcessExited>,
}

impl LifecycleController {
    /// Must be called from within a Tokio runtime: the exit event loop is
    /// spawned here.
    pub fn new(config: LifecycleConfig, run_index: PersistentRunIndex) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        let inner = Arc::new(Inner {
            config,
            registry: Arc::new(ProcessRegistry::new()),
            run_index: StdMutex::new(run_index),
            states: StdMutex::new(BTreeMap::new()),
            updates,
            lifecycle_gate: Mutex::new(()),
            exit_tx,
        });
        spawn_exit_loop(Arc::downgrade(&inner), exit_rx);
        Self { inner }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunStateChange> {
        self.inner.updates.subscribe()
    }

    /// Absent entries read as idle.
    pub fn run_state(&self, id: &ScriptId) -> RunState {
        self.inner.state_of(id)
    }

    pub fn run_states(&self) -> BTreeMap<ScriptId, RunState> {
        self.inner.lock_states().clone()
    }

    pub async fn run(&self, script: &ScriptDefinition) -> Result<()> {
        let inner = &self.inner;
        let id = &script.id;
        let _gate = inner.lifecycle_gate.lock().await;
        let has_record = inner.holds_live_process(id).await;

        if !script.is_enabled {
            // A live process keeps its running state even if the script was
            // disabled underneath it.
            if !has_record {
                inner.publish(id, RunState::failed("script is disabled", None));
            }
            return Err(LifecycleError::ScriptDisabled { id: id.clone() });
        }
        if has_record {
            return Err(LifecycleError::AlreadyRunning { id: id.clone() });
        }
        if script.trimmed_command().is_empty() {
            inner.publish(id, RunState::failed("command is empty", None));
            return Err(LifecycleError::EmptyCommand { id: id.clone() });
        }

        inner.registry.clear_output(id).await;

        let (child, pid) = match spawn_script(&inner.config, script) {
            Ok(spawned) => spawned,
            Err(err) => {
                warn!(script_id = %id, error = %err, "failed to start script");
                inner.publish(id, RunState::failed(format!("failed to start: {err}"), None));
                return Err(LifecycleError::start_failed(id, err));
            }
        };
        let started_at = Utc::now();

        let (handle, control_rx) = ProcessHandle::new(pid);
        inner.registry.set_process(id, handle).await;
        inner.persist(id, PersistedRunEntry::new(pid, started_at));
        inner.publish(id, RunState::running(started_at, pid));

        Waiter {
            id: id.clone(),
            pid,
            registry: Arc::clone(&inner.registry),
            output_max_chars: inner.config.output_max_chars,
            stop_grace_period: inner.config.stop_grace_period,
            exit_tx: inner.exit_tx.clone(),
        }
        .spawn(child, control_rx);

        info!(script_id = %id, pid, "script started");
        Ok(())
    }

    /// Stopping something that is not running is a no-op.
    ///
    /// Owned processes are asked to terminate and finalized when their exit
    /// arrives. Adopted processes are signalled and finalized immediately
    /// because no exit event will ever come for them.
    pub async fn stop(&self, id: &ScriptId) -> Result<()> {
        let inner = &self.inner;
        let _gate = inner.lifecycle_gate.lock().await;

        if let Some(handle) = inner.registry.get_process(id).await {
            inner.registry.mark_stop_requested(id).await;
            if handle.request_termination(TerminationSignal::Graceful) {
                info!(script_id = %id, pid = handle.pid(), "stop requested");
            } else {
                debug!(script_id = %id, "process already exiting");
            }
            return Ok(());
        }

        let Some(pid) = inner.registry.get_recorded_pid(id).await else {
            debug!(script_id = %id, "stop ignored; nothing running");
            return Ok(());
        };

        inner.registry.mark_stop_requested(id).await;
        if is_alive(pid) {
            let token = start_token(pid);
            if let Err(err) = send_signal(pid, TerminationSignal::Graceful) {
                warn!(script_id = %id, pid, error = %err, "failed to signal adopted process");
            }
            inner.schedule_adopted_escalation(id, pid, token);
        } else {
            debug!(script_id = %id, pid, "adopted process already gone; not signalling");
        }
        inner.registry.clear_process(id).await;
        inner.forget(id);

        let started_at = inner.state_of(id).started_at;
        inner.publish(id, RunState::stopped(started_at));
        info!(script_id = %id, pid, "adopted process stopped");
        Ok(())
    }

    /// Runs every enabled script that is not already tracked.
    pub async fn run_all(
        &self,
        scripts: &[ScriptDefinition],
    ) -> Vec<(ScriptId, Result<()>)> {
        let mut outcomes = Vec::new();
        for script in scripts.iter().filter(|script| script.is_enabled) {
            match self.run(script).await {
                Err(LifecycleError::AlreadyRunning { .. }) => {}
                outcome => outcomes.push((script.id.clone(), outcome)),
            }
        }
        outcomes
    }

    /// Stops every tracked script and returns the ids that were asked to stop.
    pub async fn stop_all(&self) -> Vec<ScriptId> {
        let ids = self.inner.registry.recorded_ids().await;
        for id in &ids {
            if let Err(err) = self.stop(id).await {
                warn!(script_id = %id, error = %err, "stop failed");
            }
        }
        ids
    }

    pub async fn get_output(&self, id: &ScriptId) -> String {
        self.inner.registry.get_output(id).await
    }

    pub async fn clear_output(&self, id: &ScriptId) {
        self.inner.registry.clear_output(id).await;
    }

    pub async fn clear_all_outputs(&self) {
        self.inner.registry.clear_all_outputs().await;
    }

    /// Matches the persisted run index against the catalog and the OS.
    ///
    /// Never spawns or kills anything. Entries for scripts missing from
    /// `scripts` are dropped without publishing state. Live pids are adopted;
    /// dead ones are removed and their scripts reset to idle.
    pub async fn reconcile_on_startup(&self, scripts: &[ScriptDefinition]) -> ReconcileReport {
        let inner = &self.inner;
        let _gate = inner.lifecycle_gate.lock().await;
        let known: HashSet<&ScriptId> = scripts.iter().map(|script| &script.id).collect();
        let mut report = ReconcileReport::default();

        let remaining = {
            let mut index = inner.lock_index();
            report.pruned = index
                .entries()
                .keys()
                .filter(|id| !known.contains(id))
                .cloned()
                .collect();
            if let Err(err) = index.retain(|id, _| known.contains(id)) {
                warn!(error = %err, "failed to prune run index");
            }
            index.entries().clone()
        };

        for (id, entry) in remaining {
            if inner.registry.has_owned_process(&id).await {
                continue;
            }
            let pid = entry.process_identifier;
            if is_alive(pid) {
                inner.registry.restore_pid(&id, pid).await;
                let started_at = entry.started_at().unwrap_or_else(Utc::now);
                inner.publish(&id, RunState::restored(started_at));
                info!(script_id = %id, pid, "adopted running process");
                report.adopted.push(id);
            } else {
                inner.forget(&id);
                inner.registry.clear_process(&id).await;
                inner.publish(&id, RunState::idle());
                debug!(script_id = %id, pid, "recorded process is gone");
                report.discarded.push(id);
            }
        }

        report
    }
}

impl Inner {
    fn lock_states(&self) -> std::sync::MutexGuard<'_, BTreeMap<ScriptId, RunState>> {
        self.states
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_index(&self) -> std::sync::MutexGuard<'_, PersistentRunIndex> {
        self.run_index
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn state_of(&self, id: &ScriptId) -> RunState {
        self.lock_states().get(id).cloned().unwrap_or_default()
    }

    fn publish(&self, id: &ScriptId, state: RunState) {
        self.lock_states().insert(id.clone(), state.clone());
        // No receivers is fine; the map above is the source of truth.
        let _ = self.updates.send(RunStateChange {
            id: id.clone(),
            state,
        });
    }

    // Run index writes are advisory: failures only degrade restart recovery.
    fn persist(&self, id: &ScriptId, entry: PersistedRunEntry) {
        if let Err(err) = self.lock_index().record(id, entry) {
            warn!(script_id = %id, error = %err, "failed to persist run index entry");
        }
    }

    fn forget(&self, id: &ScriptId) {
        if let Err(err) = self.lock_index().remove(id) {
            warn!(script_id = %id, error = %err, "failed to remove run index entry");
        }
    }

    /// Whether `id` has a process that still counts as running. Owned ones
    /// always do. An adopted pid is probed, and one that exited on its own is
    /// released so the script can run again. Call with the lifecycle gate held.
    async fn holds_live_process(&self, id: &ScriptId) -> bool {
        if !self.registry.has_record(id).await {
            return false;
        }
        if self.registry.has_owned_process(id).await {
            return true;
        }
        match self.registry.get_recorded_pid(id).await {
            Some(pid) if is_alive(pid) => true,
            pid => {
                info!(script_id = %id, ?pid, "adopted process exited on its own");
                self.registry.clear_process(id).await;
                self.forget(id);
                false
            }
        }
    }

    /// Adopted processes get the same grace period as owned ones, checked by
    /// probing the pid since there is no child to wait on. `token` pins the
    /// incarnation that was signalled so a recycled pid is left alone.
    fn schedule_adopted_escalation(&self, id: &ScriptId, pid: u32, token: Option<u64>) {
        let Some(grace) = self.config.stop_grace_period else {
            return;
        };
        let id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if is_same_process(pid, token) {
                warn!(script_id = %id, pid, "adopted process ignored stop; sending SIGKILL");
                if let Err(err) = send_signal(pid, TerminationSignal::Force) {
                    warn!(script_id = %id, pid, error = %err, "failed to kill adopted process");
                }
            }
        });
    }

    async fn handle_exit(&self, event: ProcessExited) {
        let ProcessExited { id, pid, outcome } = event;
        let _gate = self.lifecycle_gate.lock().await;

        if self.registry.get_recorded_pid(&id).await != Some(pid) {
            debug!(script_id = %id, pid, "exit for a process no longer tracked");
            return;
        }

        self.registry.clear_handle(&id).await;
        self.forget(&id);
        let stop_requested = self.registry.consume_stop_requested(&id).await;
        self.registry.clear_process(&id).await;

        let started_at = self.state_of(&id).started_at;
        let state = classify(stop_requested, &outcome, started_at);
        info!(script_id = %id, pid, status = %state.status, "script finished");
        self.publish(&id, state);
    }
}

fn classify(
    stop_requested: bool,
    outcome: &ExitOutcome,
    started_at: Option<DateTime<Utc>>,
) -> RunState {
    if stop_requested {
        return RunState::stopped(started_at);
    }
    match outcome {
        ExitOutcome::Code(code) => RunState::finished(*code, started_at),
        ExitOutcome::Signal(signal) => {
            RunState::failed(format!("terminated by signal {signal}"), started_at)
        }
        ExitOutcome::WaitFailed(reason) => {
            RunState::failed(format!("lost track of process: {reason}"), started_at)
        }
    }
}

fn spawn_exit_loop(inner: Weak<Inner>, mut exit_rx: mpsc::UnboundedReceiver<ProcessExited>) {
    tokio::spawn(async move {
        while let Some(event) = exit_rx.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.handle_exit(event).await;
        }
    });
}
