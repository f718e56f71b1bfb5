//! OS-facing pieces: spawning the shell, probing liveness and delivering
//! termination signals.

use std::io;
use std::process::Stdio;

use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::config::LifecycleConfig;
use crate::script::ScriptDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    /// SIGTERM to the process group.
    Graceful,
    /// SIGKILL to the process group.
    Force,
}

/// Handle to a child owned by this manager instance.
///
/// The child itself lives in its waiter task; the handle only carries the pid
/// and a channel for asking the waiter to signal it. Signalling through the
/// waiter guarantees the pid has not been reaped (and possibly reused) yet.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    control_tx: mpsc::UnboundedSender<TerminationSignal>,
}

impl ProcessHandle {
    pub(crate) fn new(pid: u32) -> (Self, mpsc::UnboundedReceiver<TerminationSignal>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        (Self { pid, control_tx }, control_rx)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns `false` if the waiter has already finished.
    pub fn request_termination(&self, signal: TerminationSignal) -> bool {
        self.control_tx.send(signal).is_ok()
    }
}

/// Starts `script` through the configured shell with stdout and stderr piped.
///
/// The child gets its own process group so the whole tree can be signalled at
/// once, and it is not killed when the handle drops: processes are expected to
/// outlive a restart of the manager.
pub(crate) fn spawn_script(
    config: &LifecycleConfig,
    script: &ScriptDefinition,
) -> io::Result<(Child, u32)> {
    let mut command = Command::new(&config.shell);
    command
        .args(&config.shell_args)
        .arg(script.trimmed_command())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);

    if let Some(dir) = script.working_directory() {
        command.current_dir(dir);
    }

    #[cfg(unix)]
    command.process_group(0);

    let child = command.spawn()?;
    let pid = child
        .id()
        .ok_or_else(|| io::Error::other("spawned process exited before reporting a pid"))?;
    Ok((child, pid))
}

/// Non-destructive existence check. Any failure, including a permission
/// error, reads as "not alive". So does a zombie: it has exited and only
/// waits for its parent to reap it.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    let Some(raw) = to_pid_t(pid) else {
        return false;
    };
    if unsafe { libc::kill(raw, 0) } != 0 {
        return false;
    }
    !read_proc_stat(pid).is_some_and(|stat| stat.is_exited())
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

/// Identifies one incarnation of `pid`: its start time in clock ticks since
/// boot. Two reads that agree mean the pid was not recycled in between.
/// `None` where the kernel does not expose it.
pub fn start_token(pid: u32) -> Option<u64> {
    read_proc_stat(pid).map(|stat| stat.start_ticks)
}

/// True when `pid` is alive and still carries the `token` seen earlier.
pub fn is_same_process(pid: u32, token: Option<u64>) -> bool {
    is_alive(pid) && start_token(pid) == token
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcStat {
    state: char,
    start_ticks: u64,
}

impl ProcStat {
    fn is_exited(self) -> bool {
        matches!(self.state, 'Z' | 'X' | 'x')
    }
}

#[cfg(target_os = "linux")]
fn read_proc_stat(pid: u32) -> Option<ProcStat> {
    let raw = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_proc_stat(&raw)
}

#[cfg(not(target_os = "linux"))]
fn read_proc_stat(_pid: u32) -> Option<ProcStat> {
    None
}

// `comm` may itself contain spaces and parentheses, so fields are counted
// from the last ')'. State is field 3, starttime field 22.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_proc_stat(raw: &str) -> Option<ProcStat> {
    let (_, rest) = raw.rsplit_once(')')?;
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let start_ticks = fields.nth(18)?.parse().ok()?;
    Some(ProcStat { state, start_ticks })
}

/// Signals the process group led by `pid`, falling back to the lone process
/// when no such group exists.
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: TerminationSignal) -> io::Result<()> {
    let pid = to_pid_t(pid)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid pid"))?;
    let signo = match signal {
        TerminationSignal::Graceful => libc::SIGTERM,
        TerminationSignal::Force => libc::SIGKILL,
    };

    if unsafe { libc::kill(-pid, signo) } == 0 {
        return Ok(());
    }
    if unsafe { libc::kill(pid, signo) } == 0 {
        return Ok(());
    }
    Err(io::Error::last_os_error())
}

#[cfg(not(unix))]
pub fn send_signal(_pid: u32, _signal: TerminationSignal) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "signalling by pid is only supported on unix",
    ))
}

// pid 0 and negative values address groups, not a single process.
#[cfg(unix)]
fn to_pid_t(pid: u32) -> Option<libc::pid_t> {
    libc::pid_t::try_from(pid).ok().filter(|pid| *pid > 0)
}
