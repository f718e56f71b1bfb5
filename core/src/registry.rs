//! Single source of truth for which scripts have a live process.
//!
//! Every read and write goes through one `tokio::sync::Mutex`, so output
//! arriving from reader tasks, termination handling and caller-driven
//! `run`/`stop` never observe a half-applied update. No method holds the gate
//! across I/O.

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::output_buffer::OutputBuffer;
use crate::process::ProcessHandle;
use crate::script::ScriptId;

#[derive(Debug, Default)]
struct ProcessRecord {
    /// Present only while this instance owns the child and it has not exited.
    handle: Option<ProcessHandle>,
    /// Kept after the handle is gone so an adopted process can still be killed.
    pid: Option<u32>,
    stop_requested: bool,
}

#[derive(Debug, Default)]
struct RegistryState {
    records: HashMap<ScriptId, ProcessRecord>,
    outputs: HashMap<ScriptId, OutputBuffer>,
}

#[derive(Debug, Default)]
pub struct ProcessRegistry {
    state: Mutex<RegistryState>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly spawned child. Any stale stop request is dropped.
    pub async fn set_process(&self, id: &ScriptId, handle: ProcessHandle) {
        let mut state = self.state.lock().await;
        let record = state.records.entry(id.clone()).or_default();
        record.pid = Some(handle.pid());
        record.handle = Some(handle);
        record.stop_requested = false;
    }

    pub async fn get_process(&self, id: &ScriptId) -> Option<ProcessHandle> {
        let state = self.state.lock().await;
        state
            .records
            .get(id)
            .and_then(|record| record.handle.clone())
    }

    pub async fn get_recorded_pid(&self, id: &ScriptId) -> Option<u32> {
        let state = self.state.lock().await;
        state.records.get(id).and_then(|record| record.pid)
    }

    /// Drops the owned handle but keeps the recorded pid.
    pub async fn clear_handle(&self, id: &ScriptId) {
        let mut state = self.state.lock().await;
        if let Some(record) = state.records.get_mut(id) {
            record.handle = None;
        }
    }

    /// Removes the record entirely. Output is left alone.
    pub async fn clear_process(&self, id: &ScriptId) {
        self.state.lock().await.records.remove(id);
    }

    /// Returns `false` when there is no record to mark.
    pub async fn mark_stop_requested(&self, id: &ScriptId) -> bool {
        let mut state = self.state.lock().await;
        match state.records.get_mut(id) {
            Some(record) => {
                record.stop_requested = true;
                true
            }
            None => false,
        }
    }

    /// Reads and clears the stop flag in one step.
    pub async fn consume_stop_requested(&self, id: &ScriptId) -> bool {
        let mut state = self.state.lock().await;
        state
            .records
            .get_mut(id)
            .map(|record| std::mem::take(&mut record.stop_requested))
            .unwrap_or(false)
    }

    pub async fn has_owned_process(&self, id: &ScriptId) -> bool {
        let state = self.state.lock().await;
        state
            .records
            .get(id)
            .is_some_and(|record| record.handle.is_some())
    }

    /// True for owned and adopted records alike.
    pub async fn has_record(&self, id: &ScriptId) -> bool {
        self.state.lock().await.records.contains_key(id)
    }

    /// Tracks a process that survived a manager restart. There is no handle,
    /// only the pid.
    pub async fn restore_pid(&self, id: &ScriptId, pid: u32) {
        let mut state = self.state.lock().await;
        state.records.insert(
            id.clone(),
            ProcessRecord {
                handle: None,
                pid: Some(pid),
                stop_requested: false,
            },
        );
    }

    pub async fn recorded_ids(&self) -> Vec<ScriptId> {
        let state = self.state.lock().await;
        let mut ids: Vec<ScriptId> = state.records.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn append_output(&self, id: &ScriptId, text: &str, max_chars: usize) {
        let mut state = self.state.lock().await;
        state
            .outputs
            .entry(id.clone())
            .or_default()
            .append(text, max_chars);
    }

    pub async fn get_output(&self, id: &ScriptId) -> String {
        let state = self.state.lock().await;
        state
            .outputs
            .get(id)
            .map(|buffer| buffer.as_str().to_string())
            .unwrap_or_default()
    }

    pub async fn clear_output(&self, id: &ScriptId) {
        self.state.lock().await.outputs.remove(id);
    }

    pub async fn clear_all_outputs(&self) {
        self.state.lock().await.outputs.clear();
    }
}
