//! `portlens doctor`: environment diagnostics
//!
//! Checks the three things a session needs: administrative rights, a free
//! proxy port and a writable hosts file. Failed checks carry a hint. When the
//! port is the only problem, the user is offered to stop whatever holds it.

use crate::hosts::{self, DomainMapper};
use std::fmt;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Windows reports HTTP.sys listeners under the System process
const SYSTEM_PID: &str = "4";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    Privileges,
    Port,
    HostsAccess,
}

/// Outcome of a single diagnostic check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub kind: CheckKind,
    pub name: String,
    pub passed: bool,
    pub hint: Option<String>,
}

impl CheckResult {
    fn pass(kind: CheckKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            passed: true,
            hint: None,
        }
    }

    fn fail(kind: CheckKind, name: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            passed: false,
            hint: Some(hint.into()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DoctorReport {
    pub checks: Vec<CheckResult>,
}

impl DoctorReport {
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    /// Repair is only offered when the port is the sole failing check
    pub fn offers_port_repair(&self) -> bool {
        !self.all_passed()
            && self
                .checks
                .iter()
                .all(|c| c.passed || c.kind == CheckKind::Port)
    }
}

impl fmt::Display for DoctorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n🩺 Portlens Diagnostic Report\n")?;
        for check in &self.checks {
            let icon = if check.passed { "✔" } else { "✖" };
            writeln!(f, "{} {}", icon, check.name)?;
            if let (false, Some(hint)) = (check.passed, &check.hint) {
                writeln!(f, "    └─ Hint: {}", hint)?;
            }
        }
        if self.all_passed() {
            write!(f, "\n✔ All systems go! Your environment is ready.")
        } else {
            write!(f, "\n✖ Some checks failed. Please resolve them to use Portlens.")
        }
    }
}

/// Run every check against the given hosts file and proxy port
pub async fn diagnose(mapper: &DomainMapper, proxy_port: u16) -> DoctorReport {
    DoctorReport {
        checks: vec![
            check_privileges(),
            check_port(proxy_port).await,
            check_hosts_access(mapper.hosts_path()),
        ],
    }
}

fn check_privileges() -> CheckResult {
    const NAME: &str = "Administrative Privileges";
    if hosts::is_elevated() {
        CheckResult::pass(CheckKind::Privileges, NAME)
    } else {
        CheckResult::fail(
            CheckKind::Privileges,
            NAME,
            "Run terminal as Admin/Sudo to bind Port 80.",
        )
    }
}

async fn check_port(port: u16) -> CheckResult {
    let name = format!("Port {} Availability", port);
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

    match TcpListener::bind(addr).await {
        Ok(listener) => {
            drop(listener);
            CheckResult::pass(CheckKind::Port, name)
        }
        Err(e) => {
            debug!(port, error = %e, "Port check failed");
            let hint = match find_occupier(port).await {
                Some(occupier) => format!("Port {} is occupied by \"{}\".", port, occupier),
                None => format!("Port {} is occupied. Stop Apache/Nginx/IIS.", port),
            };
            CheckResult::fail(CheckKind::Port, name, hint)
        }
    }
}

/// PID listening on `port`, from `netstat` on Windows and `lsof` elsewhere
async fn listening_process(port: u16) -> Option<String> {
    if cfg!(windows) {
        let netstat = command_output("netstat", &["-ano"]).await?;
        listening_pid(&netstat, port)
    } else {
        let target = format!(":{}", port);
        let pids = command_output("lsof", &["-i", target.as_str(), "-sTCP:LISTEN", "-t"]).await?;
        pids.lines()
            .map(str::trim)
            .find(|pid| !pid.is_empty())
            .map(String::from)
    }
}

/// Name of the process listening on `port`, if the platform tools can tell
async fn find_occupier(port: u16) -> Option<String> {
    let pid = listening_process(port).await?;
    if cfg!(windows) {
        if pid == SYSTEM_PID {
            return Some("System (IIS/HTTP.sys)".to_string());
        }
        let filter = format!("PID eq {}", pid);
        let tasks = command_output("tasklist", &["/FI", filter.as_str(), "/NH"]).await;
        Some(
            tasks
                .and_then(|out| out.split_whitespace().next().map(String::from))
                .unwrap_or_else(|| format!("PID {}", pid)),
        )
    } else {
        let name = command_output("ps", &["-p", pid.as_str(), "-o", "comm="]).await?;
        let name = name.trim();
        if name.is_empty() {
            Some(format!("PID {}", pid))
        } else {
            Some(name.to_string())
        }
    }
}

async fn command_output(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// PID of the LISTENING row for `port` in `netstat -ano` output
fn listening_pid(netstat: &str, port: u16) -> Option<String> {
    let suffix = format!(":{}", port);
    netstat.lines().find_map(|line| {
        let cols: Vec<&str> = line.split_whitespace().collect();
        match cols.as_slice() {
            [_proto, local, _remote, state, pid]
                if local.ends_with(&suffix) && *state == "LISTENING" =>
            {
                Some(pid.to_string())
            }
            _ => None,
        }
    })
}

fn check_hosts_access(path: &Path) -> CheckResult {
    const NAME: &str = "Hosts File Permissions";
    if can_read_write(path) {
        CheckResult::pass(CheckKind::HostsAccess, NAME)
    } else {
        CheckResult::fail(
            CheckKind::HostsAccess,
            NAME,
            format!("Cannot write to {}.", path.display()),
        )
    }
}

/// Result of the interactive port repair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    Declined,
    Cleared,
    Failed,
}

/// Ask on `output` whether to free `port`, read the answer from `input` and,
/// on `y`, run `free`. Progress is reported on `output`.
pub async fn offer_port_repair<R, W, F, Fut>(
    port: u16,
    input: &mut R,
    output: &mut W,
    free: F,
) -> io::Result<RepairOutcome>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnOnce(u16) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let prompt = format!(
        "\n🔧 Auto-Repair Available\n    Would you like Portlens to attempt to free Port {}? (y/n): ",
        port
    );
    output.write_all(prompt.as_bytes()).await?;
    output.flush().await?;

    let mut answer = String::new();
    input.read_line(&mut answer).await?;
    if !answer.trim().eq_ignore_ascii_case("y") {
        debug!(port, answer = answer.trim(), "Port repair declined");
        return Ok(RepairOutcome::Declined);
    }

    let (outcome, message) = match free(port).await {
        Ok(()) => {
            info!(port, "Port freed");
            (RepairOutcome::Cleared, format!("    ✔ Port {} has been cleared.\n", port))
        }
        Err(e) => {
            warn!(port, error = %e, "Failed to free port");
            let mut message = "    ✖ Failed to clear port automatically.\n".to_string();
            if cfg!(windows) {
                message.push_str(
                    "    └─ Note: For System (PID 4), you may need to run \"net stop http /y\" manually.\n",
                );
            }
            (RepairOutcome::Failed, message)
        }
    };
    output.write_all(message.as_bytes()).await?;
    output.flush().await?;
    Ok(outcome)
}

/// Stop whatever process listens on `port`
pub async fn free_port(port: u16) -> anyhow::Result<()> {
    let pid = listening_process(port)
        .await
        .ok_or_else(|| anyhow::anyhow!("no process found listening on port {}", port))?;

    for argv in kill_commands(&pid, cfg!(windows), hosts::is_elevated()) {
        let Some((program, args)) = argv.split_first() else {
            continue;
        };
        info!(port, pid = pid.as_str(), command = %shell_words::join(&argv), "Freeing port");
        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if !status.success() {
            anyhow::bail!("{} exited with {}", program, status);
        }
    }
    Ok(())
}

/// Commands that stop `pid`. PID 4 on Windows cannot be killed, so the web
/// publishing and HTTP services are stopped instead.
fn kill_commands(pid: &str, windows: bool, elevated: bool) -> Vec<Vec<String>> {
    let argv = |words: &[&str]| words.iter().map(|w| w.to_string()).collect::<Vec<_>>();

    if windows {
        if pid == SYSTEM_PID {
            vec![
                argv(&["net", "stop", "w3svc", "/y"]),
                argv(&["net", "stop", "http", "/y"]),
            ]
        } else {
            vec![argv(&["taskkill", "/F", "/PID", pid])]
        }
    } else if elevated {
        vec![argv(&["kill", "-9", pid])]
    } else {
        vec![argv(&["sudo", "kill", "-9", pid])]
    }
}

#[cfg(unix)]
fn can_read_write(path: &Path) -> bool {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call
    unsafe { libc::access(c_path.as_ptr(), libc::R_OK | libc::W_OK) == 0 }
}

#[cfg(not(unix))]
fn can_read_write(path: &Path) -> bool {
    std::fs::OpenOptions::new()
        .read(true)
        .append(true)
        .open(path)
        .is_ok()
}
