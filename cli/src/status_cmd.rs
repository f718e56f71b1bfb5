use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use chrono::DateTime;
use chrono::Local;
use chrono::Utc;
use scriptdeck_core::PersistentRunIndex;
use scriptdeck_core::ScriptId;
use scriptdeck_core::process::is_alive;
use tokio::time::Instant;

use crate::Session;
use crate::catalog;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub(crate) fn list(session: &Session) -> Result<ExitCode> {
    if session.scripts.is_empty() {
        println!("no scripts in the catalog");
        return Ok(ExitCode::SUCCESS);
    }

    for script in &session.scripts {
        let state = session.controller.run_state(&script.id);
        let enabled = if script.is_enabled { "" } else { " [disabled]" };
        let mut line = format!(
            "{:<20} {:<8} {}{enabled}",
            script.id.as_str(),
            state.status.to_string(),
            script.display_name(),
        );
        if !state.last_message.is_empty() {
            line.push_str(&format!("  ({})", state.last_message));
        }
        if let Some(started_at) = state.started_at {
            line.push_str(&format!("  since {}", format_time(started_at)));
        }
        println!("{line}");
    }
    Ok(ExitCode::SUCCESS)
}

pub(crate) fn status(session: &Session) -> Result<ExitCode> {
    let index = open_index(session)?;
    if index.entries().is_empty() {
        println!("nothing running");
        return Ok(ExitCode::SUCCESS);
    }

    for (id, entry) in index.entries() {
        let started = entry
            .started_at()
            .map(format_time)
            .unwrap_or_else(|| "unknown".to_string());
        println!(
            "{:<20} pid {:<8} started {started}",
            id.as_str(),
            entry.process_identifier
        );
    }
    Ok(ExitCode::SUCCESS)
}

pub(crate) async fn stop(session: &Session, raw_id: &str) -> Result<ExitCode> {
    let script = catalog::select(&session.scripts, &[raw_id.to_string()])?;
    let Some(script) = script.first() else {
        return Ok(ExitCode::FAILURE);
    };
    let id = script.id.clone();

    let pid = open_index(session)?
        .get(&id)
        .map(|entry| entry.process_identifier);
    session.controller.stop(&id).await?;
    if let Some(pid) = pid {
        wait_for_exit(session, &id, pid).await;
    }

    let state = session.controller.run_state(&id);
    println!("{id}: {} ({})", state.status, state.last_message);
    Ok(ExitCode::SUCCESS)
}

pub(crate) async fn stop_all(session: &Session) -> Result<ExitCode> {
    let pids: Vec<(ScriptId, u32)> = open_index(session)?
        .entries()
        .iter()
        .map(|(id, entry)| (id.clone(), entry.process_identifier))
        .collect();

    let stopped = session.controller.stop_all().await;
    if stopped.is_empty() {
        println!("nothing running");
        return Ok(ExitCode::SUCCESS);
    }

    for (id, pid) in pids {
        wait_for_exit(session, &id, pid).await;
    }
    for id in stopped {
        let state = session.controller.run_state(&id);
        println!("{id}: {} ({})", state.status, state.last_message);
    }
    Ok(ExitCode::SUCCESS)
}

/// Adopted processes are escalated by a background task, which would die with
/// this process. Keep the runtime alive until the pid is gone or the grace
/// period (plus a little slack for the forced kill) has elapsed.
async fn wait_for_exit(session: &Session, id: &ScriptId, pid: u32) {
    let grace = session
        .controller
        .config()
        .stop_grace_period
        .unwrap_or_default();
    let deadline = Instant::now() + grace + Duration::from_secs(1);
    while is_alive(pid) {
        if Instant::now() >= deadline {
            tracing::warn!(script_id = %id, pid, "process still alive after stop");
            return;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
}

fn open_index(session: &Session) -> Result<PersistentRunIndex> {
    match session.controller.config().run_index_path.as_deref() {
        Some(path) => PersistentRunIndex::open(path),
        None => Ok(PersistentRunIndex::in_memory()),
    }
}

fn format_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}
