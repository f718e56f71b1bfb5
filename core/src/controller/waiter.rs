//! Per-process task that owns the child: pumps its output into the registry,
//! delivers termination requests, escalates stuck stops and reports the exit
//! back to the controller.

use std::sync::Arc;
use std::time::Duration;

use async_channel::Sender;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use tracing::warn;

use crate::output_buffer::Utf8Decoder;
use crate::process::TerminationSignal;
use crate::process::send_signal;
use crate::registry::ProcessRegistry;
use crate::script::ScriptId;

const READ_CHUNK_SIZE: usize = 8192;

/// How long to keep reading after the child exits. A grandchild that kept
/// the pipe open must not hold the terminal state hostage.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ExitOutcome {
    Code(i32),
    Signal(i32),
    WaitFailed(String),
}

#[derive(Debug)]
pub(crate) struct ProcessExited {
    pub id: ScriptId,
    pub pid: u32,
    pub outcome: ExitOutcome,
}

pub(crate) struct Waiter {
    pub id: ScriptId,
    pub pid: u32,
    pub registry: Arc<ProcessRegistry>,
    pub output_max_chars: usize,
    pub stop_grace_period: Option<Duration>,
    pub exit_tx: mpsc::UnboundedSender<ProcessExited>,
}

impl Waiter {
    pub(crate) fn spawn(
        self,
        mut child: Child,
        control_rx: mpsc::UnboundedReceiver<TerminationSignal>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let pump = OutputPump::start(
                &self.id,
                &mut child,
                Arc::clone(&self.registry),
                self.output_max_chars,
            );
            let outcome =
                wait_for_exit(&mut child, self.pid, control_rx, self.stop_grace_period).await;
            pump.finish(&self.id).await;

            debug!(script_id = %self.id, pid = self.pid, ?outcome, "process exited");
            let event = ProcessExited {
                id: self.id,
                pid: self.pid,
                outcome,
            };
            if self.exit_tx.send(event).is_err() {
                debug!("controller gone; dropping exit event");
            }
        })
    }
}

async fn wait_for_exit(
    child: &mut Child,
    pid: u32,
    mut control_rx: mpsc::UnboundedReceiver<TerminationSignal>,
    grace: Option<Duration>,
) -> ExitOutcome {
    let mut escalate_at: Option<Instant> = None;

    loop {
        tokio::select! {
            status = child.wait() => {
                return match status {
                    Ok(status) => exit_outcome(status),
                    Err(err) => ExitOutcome::WaitFailed(err.to_string()),
                };
            }
            Some(signal) = control_rx.recv() => {
                deliver(child, pid, signal);
                if signal == TerminationSignal::Graceful && escalate_at.is_none() {
                    escalate_at = grace.map(|grace| Instant::now() + grace);
                }
            }
            () = sleep_until(escalate_at) => {
                warn!(pid, "process ignored graceful stop; sending SIGKILL");
                deliver(child, pid, TerminationSignal::Force);
                escalate_at = None;
            }
        }
    }
}

// The child has not been reaped while we are here, so its pid still refers
// to it.
fn deliver(child: &mut Child, pid: u32, signal: TerminationSignal) {
    if let Err(err) = send_signal(pid, signal) {
        warn!(pid, ?signal, error = %err, "failed to signal process group");
        if signal == TerminationSignal::Force
            && let Err(err) = child.start_kill()
        {
            warn!(pid, error = %err, "failed to kill process");
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
fn exit_outcome(status: std::process::ExitStatus) -> ExitOutcome {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => ExitOutcome::Code(code),
        (None, Some(signal)) => ExitOutcome::Signal(signal),
        (None, None) => ExitOutcome::WaitFailed(format!("unrecognised exit status {status}")),
    }
}

#[cfg(not(unix))]
fn exit_outcome(status: std::process::ExitStatus) -> ExitOutcome {
    match status.code() {
        Some(code) => ExitOutcome::Code(code),
        None => ExitOutcome::WaitFailed(format!("unrecognised exit status {status}")),
    }
}

/// Readers for stdout and stderr feeding a single appender, so every append
/// for the script goes through the registry in the order it was read.
struct OutputPump {
    readers: Vec<JoinHandle<()>>,
    appender: JoinHandle<()>,
}

impl OutputPump {
    fn start(
        id: &ScriptId,
        child: &mut Child,
        registry: Arc<ProcessRegistry>,
        max_chars: usize,
    ) -> Self {
        let (chunk_tx, chunk_rx) = async_channel::unbounded::<String>();

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_stream(stdout, chunk_tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_stream(stderr, chunk_tx.clone())));
        }
        drop(chunk_tx);

        let id = id.clone();
        let appender = tokio::spawn(async move {
            while let Ok(text) = chunk_rx.recv().await {
                registry.append_output(&id, &text, max_chars).await;
            }
        });

        Self { readers, appender }
    }

    async fn finish(mut self, id: &ScriptId) {
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut self.appender)
            .await
            .is_err()
        {
            debug!(script_id = %id, "output still open after exit; detaching readers");
            for reader in &self.readers {
                reader.abort();
            }
            self.appender.abort();
        }
    }
}

// Read errors end capture quietly; output is best effort.
async fn read_stream<R>(mut reader: R, chunk_tx: Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_CHUNK_SIZE];
    let mut decoder = Utf8Decoder::default();

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.decode(&buf[..n]);
                if !text.is_empty() && chunk_tx.send(text).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                debug!(error = %err, "output read failed");
                break;
            }
        }
    }

    let tail = decoder.finish();
    if !tail.is_empty() {
        let _ = chunk_tx.send(tail).await;
    }
}
