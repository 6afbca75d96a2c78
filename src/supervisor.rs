//! Child process supervision and idempotent shutdown
//!
//! The wrapped command runs through the platform shell with inherited stdio
//! and the allocated port in `PORT`. A dedicated task owns the
//! [`tokio::process::Child`]; everyone else talks to it through a
//! [`ChildHandle`].

use crate::error::PortlensError;
use crate::hosts::DomainMapper;
use parking_lot::Mutex;
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// Environment variable carrying the internal port to the child
pub const PORT_ENV_VAR: &str = "PORT";

/// How long shutdown waits for the child after asking it to stop
const CHILD_EXIT_TIMEOUT: Duration = Duration::from_secs(10);

/// The command line to run, as program plus arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split user-supplied words into program and arguments
    pub fn from_words(words: &[String]) -> Option<Self> {
        let (program, args) = words.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }

    fn words(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str))
    }

    /// The command line handed to the shell.
    ///
    /// A lone word is passed through untouched so `portlens app "npm run dev"`
    /// behaves like typing `npm run dev`.
    pub fn shell_line(&self, shell: ShellKind) -> String {
        if self.args.is_empty() {
            return self.program.clone();
        }
        match shell {
            ShellKind::Posix => shell_words::join(self.words()),
            ShellKind::Cmd => self.words().map(cmd_quote).collect::<Vec<_>>().join(" "),
        }
    }
}

impl fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.shell_line(ShellKind::current()))
    }
}

/// Which shell interprets the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    /// `sh -c`
    Posix,
    /// `cmd /S /C`
    Cmd,
}

impl ShellKind {
    pub fn current() -> Self {
        if cfg!(windows) {
            ShellKind::Cmd
        } else {
            ShellKind::Posix
        }
    }
}

/// cmd.exe has no single quotes: wrap words with blanks in double quotes and
/// double any embedded ones
fn cmd_quote(word: &str) -> String {
    if word.is_empty() || word.contains([' ', '\t', '"']) {
        format!("\"{}\"", word.replace('"', "\"\""))
    } else {
        word.to_string()
    }
}

/// How the child ended. `code` is `None` when it was killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub code: Option<i32>,
}

impl ChildExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Handle to the supervised child
#[derive(Debug)]
pub struct ChildHandle {
    pid: Option<u32>,
    status_rx: watch::Receiver<Option<ChildExit>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ChildHandle {
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Wait for the child to exit. Safe to call from several tasks.
    pub async fn wait(&self) -> ChildExit {
        let mut rx = self.status_rx.clone();
        // Copy out before `rx` is dropped; the borrow guard must not outlive it
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(status) => (*status).unwrap_or(ChildExit { code: None }),
            // The owner task is gone without reporting; treat as killed
            Err(_) => ChildExit { code: None },
        };
        exit
    }

    pub fn exit_status(&self) -> Option<ChildExit> {
        *self.status_rx.borrow()
    }

    /// Ask the child to stop: SIGTERM, then SIGKILL after the grace period.
    /// Only the first call has an effect.
    pub fn kill(&self) {
        if let Some(tx) = self.kill_tx.lock().take() {
            let _ = tx.send(());
        }
    }
}

/// Spawn `command` through the shell with `PORT` set and stdio inherited
pub fn execute(
    command: &LaunchCommand,
    port: u16,
    grace_period: Duration,
) -> Result<ChildHandle, PortlensError> {
    let line = command.shell_line(ShellKind::current());
    let mut cmd = shell_command(&line);
    cmd.env(PORT_ENV_VAR, port.to_string());
    cmd.stdin(Stdio::inherit());
    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::inherit());

    let child = cmd.spawn().map_err(|source| PortlensError::Spawn {
        command: line.clone(),
        source,
    })?;
    let pid = child.id();
    info!(command = %line, pid, port, "Process spawned");

    let (status_tx, status_rx) = watch::channel(None);
    let (kill_tx, kill_rx) = oneshot::channel();

    tokio::spawn(own_child(child, kill_rx, status_tx, grace_period));

    Ok(ChildHandle {
        pid,
        status_rx,
        kill_tx: Mutex::new(Some(kill_tx)),
    })
}

#[cfg(unix)]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(line);
    cmd
}

#[cfg(windows)]
fn shell_command(line: &str) -> Command {
    // `/S` strips exactly the outer quotes; `arg` would re-escape the line
    // with backslashes, which cmd.exe does not understand
    let mut cmd = Command::new("cmd");
    cmd.arg("/S").arg("/C").raw_arg(format!("\"{}\"", line));
    cmd
}

#[cfg(not(any(unix, windows)))]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(line);
    cmd
}

async fn own_child(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    status_tx: watch::Sender<Option<ChildExit>>,
    grace_period: Duration,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = kill_rx => {
            terminate(&mut child, grace_period).await;
            child.wait().await
        }
    };

    let exit = match status {
        Ok(status) => {
            debug!(?status, "Process exited");
            ChildExit {
                code: status.code(),
            }
        }
        Err(e) => {
            warn!(error = %e, "Error waiting for process");
            ChildExit { code: None }
        }
    };
    let _ = status_tx.send(Some(exit));
}

async fn terminate(child: &mut Child, grace_period: Duration) {
    if let Some(pid) = child.id() {
        info!(pid, "Sending SIGTERM to process");

        #[cfg(unix)]
        // SAFETY: pid belongs to a child we have not reaped yet
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(?status, "Process exited gracefully");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Error waiting for process to exit");
        }
        Err(_) => {
            warn!(
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
        }
    }
}

/// What started the shutdown sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownTrigger {
    /// The wrapped command exited on its own
    ChildExited(ChildExit),
    /// An interrupt or termination signal arrived
    Signal(String),
    /// Startup failed after the domain was mapped
    StartupFailed,
}

impl ShutdownTrigger {
    /// Process exit code for this trigger
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownTrigger::ChildExited(exit) => exit.code.unwrap_or(0),
            ShutdownTrigger::Signal(_) => 0,
            ShutdownTrigger::StartupFailed => 1,
        }
    }
}

/// Runs cleanup exactly once, whichever trigger fires first
pub struct Shutdown {
    fired: AtomicBool,
    mapper: Arc<DomainMapper>,
    domain: Mutex<Option<String>>,
    child: Mutex<Option<Arc<ChildHandle>>>,
}

impl Shutdown {
    pub fn new(mapper: Arc<DomainMapper>) -> Self {
        Self {
            fired: AtomicBool::new(false),
            mapper,
            domain: Mutex::new(None),
            child: Mutex::new(None),
        }
    }

    /// Register a domain that must be unmapped on shutdown
    pub fn track_domain(&self, domain: impl Into<String>) {
        *self.domain.lock() = Some(domain.into());
    }

    /// Register the child that must be stopped on shutdown
    pub fn track_child(&self, child: Arc<ChildHandle>) {
        *self.child.lock() = Some(child);
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Unmap the domain and stop the child.
    ///
    /// Returns the exit code for the first caller and `None` for every later
    /// call, which does nothing.
    pub async fn run(&self, trigger: ShutdownTrigger) -> Option<i32> {
        if self.fired.swap(true, Ordering::SeqCst) {
            debug!(?trigger, "Shutdown already in progress");
            return None;
        }
        info!(?trigger, "Shutting down");

        let domain = self.domain.lock().take();
        if let Some(domain) = domain {
            self.mapper.unmap(&domain).await;
        }

        let child = self.child.lock().take();
        if let Some(child) = child {
            if child.exit_status().is_none() {
                child.kill();
                if tokio::time::timeout(CHILD_EXIT_TIMEOUT, child.wait())
                    .await
                    .is_err()
                {
                    warn!(pid = child.id(), "Process did not exit in time");
                }
            }
        }

        Some(trigger.exit_code())
    }
}

/// Interrupt and termination signals
pub struct SignalListener {
    #[cfg(unix)]
    sigint: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
}

impl SignalListener {
    /// Install handlers; must be called before the child is spawned
    #[cfg(unix)]
    pub fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {})
    }

    /// Wait for the next signal and return its name
    #[cfg(unix)]
    pub async fn recv(&mut self) -> String {
        tokio::select! {
            _ = self.sigint.recv() => "SIGINT".to_string(),
            _ = self.sigterm.recv() => "SIGTERM".to_string(),
        }
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> String {
        let _ = tokio::signal::ctrl_c().await;
        "Ctrl-C".to_string()
    }
}
