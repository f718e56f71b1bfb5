use std::collections::BTreeSet;
use std::process::ExitCode;

use anyhow::Result;
use scriptdeck_core::LifecycleController;
use scriptdeck_core::RunState;
use scriptdeck_core::RunStatus;
use scriptdeck_core::ScriptDefinition;
use scriptdeck_core::ScriptId;
use tokio::sync::broadcast::error::RecvError;

use crate::Session;

/// Runs `scripts`, waits for each to reach a terminal state and prints its
/// output. Ctrl-C stops whatever is still running.
pub(crate) async fn run_foreground(
    session: &Session,
    scripts: Vec<ScriptDefinition>,
) -> Result<ExitCode> {
    let controller = &session.controller;
    let mut updates = controller.subscribe();
    let mut tracker = Tracker::default();

    for script in &scripts {
        match controller.run(script).await {
            Ok(()) => {
                tracker.pending.insert(script.id.clone());
            }
            Err(err) => {
                eprintln!("error: {err}");
                tracker.all_succeeded = false;
            }
        }
    }

    let mut interrupted = false;
    while !tracker.pending.is_empty() {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(change) => tracker.settle(controller, &change.id, &change.state).await,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "state updates lagged; resyncing");
                    let pending: Vec<ScriptId> = tracker.pending.iter().cloned().collect();
                    for id in pending {
                        let state = controller.run_state(&id);
                        tracker.settle(controller, &id, &state).await;
                    }
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                eprintln!("interrupted; stopping {} script(s)", tracker.pending.len());
                for id in &tracker.pending {
                    if let Err(err) = controller.stop(id).await {
                        eprintln!("error: {err}");
                    }
                }
            }
        }
    }

    Ok(if tracker.all_succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

struct Tracker {
    pending: BTreeSet<ScriptId>,
    all_succeeded: bool,
}

impl Default for Tracker {
    fn default() -> Self {
        Self {
            pending: BTreeSet::new(),
            all_succeeded: true,
        }
    }
}

impl Tracker {
    async fn settle(&mut self, controller: &LifecycleController, id: &ScriptId, state: &RunState) {
        if !state.status.is_terminal() || !self.pending.remove(id) {
            return;
        }
        if state.status != RunStatus::Success {
            self.all_succeeded = false;
        }

        println!("==> {id}: {} ({})", state.status, state.last_message);
        let output = controller.get_output(id).await;
        if !output.is_empty() {
            print!("{output}");
            if !output.ends_with('\n') {
                println!();
            }
        }
    }
}
