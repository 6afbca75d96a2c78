//! Local domain mapping through the system hosts file
//!
//! Reads happen unprivileged. Writes go through an elevated helper process:
//! `sudo tee` on Linux and macOS, an elevated PowerShell on Windows. The
//! mapping is idempotent and removal never fails the caller.

use crate::error::PortlensError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Address every mapped domain resolves to
pub const LOOPBACK_IP: &str = "127.0.0.1";

const POSIX_HOSTS_PATH: &str = "/etc/hosts";

const POSIX_HINT: &str = "Elevated privileges required to modify /etc/hosts. Try: sudo portlens";
const WINDOWS_HINT: &str = "Administrator privileges required to modify Windows hosts file.";

/// Platform-specific strategy for editing the hosts file
#[derive(Debug, Clone)]
pub enum DomainMapper {
    /// Linux and macOS: pipe into `tee`, optionally behind an elevation helper
    Posix {
        hosts_path: PathBuf,
        /// Program prefixed to `tee`, usually `sudo`. `None` runs `tee` directly.
        elevate_with: Option<String>,
    },
    /// Windows: an elevated PowerShell rewrites the file
    Windows { hosts_path: PathBuf },
}

/// What [`DomainMapper::map`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOutcome {
    /// This call appended the entry; it is ours to remove
    Added,
    /// A loopback entry was already there and is left to its owner
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Append,
    Replace,
}

impl DomainMapper {
    pub fn for_current_platform() -> Result<Self, PortlensError> {
        Self::for_os(std::env::consts::OS)
    }

    /// Select the strategy for an OS name as reported by `std::env::consts::OS`
    pub fn for_os(os: &str) -> Result<Self, PortlensError> {
        match os {
            "linux" | "macos" => Ok(DomainMapper::Posix {
                hosts_path: PathBuf::from(POSIX_HOSTS_PATH),
                elevate_with: if is_elevated() {
                    None
                } else {
                    Some("sudo".to_string())
                },
            }),
            "windows" => Ok(DomainMapper::Windows {
                hosts_path: windows_hosts_path(),
            }),
            other => Err(PortlensError::PlatformUnsupported {
                platform: other.to_string(),
            }),
        }
    }

    /// Point the mapper at a different hosts file
    pub fn with_hosts_path(self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match self {
            DomainMapper::Posix { elevate_with, .. } => DomainMapper::Posix {
                hosts_path: path,
                elevate_with,
            },
            DomainMapper::Windows { .. } => DomainMapper::Windows { hosts_path: path },
        }
    }

    /// Write without an elevation helper (POSIX only)
    pub fn without_elevation(self) -> Self {
        match self {
            DomainMapper::Posix { hosts_path, .. } => DomainMapper::Posix {
                hosts_path,
                elevate_with: None,
            },
            windows => windows,
        }
    }

    pub fn hosts_path(&self) -> &Path {
        match self {
            DomainMapper::Posix { hosts_path, .. } => hosts_path,
            DomainMapper::Windows { hosts_path } => hosts_path,
        }
    }

    fn hint(&self) -> &'static str {
        match self {
            DomainMapper::Posix { .. } => POSIX_HINT,
            DomainMapper::Windows { .. } => WINDOWS_HINT,
        }
    }

    fn line_ending(&self) -> &'static str {
        match self {
            DomainMapper::Posix { .. } => "\n",
            DomainMapper::Windows { .. } => "\r\n",
        }
    }

    fn denied(&self, message: String) -> PortlensError {
        PortlensError::PermissionDenied {
            message,
            hint: self.hint(),
        }
    }

    /// Make `domain` resolve to the loopback address.
    ///
    /// Does nothing when an active loopback entry for the domain already
    /// exists. Only an [`MapOutcome::Added`] entry should be unmapped later.
    pub async fn map(&self, domain: &str) -> Result<MapOutcome, PortlensError> {
        let path = self.hosts_path();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            self.denied(format!("Cannot read {}: {}", path.display(), e))
        })?;

        if has_entry(&content, domain) {
            debug!(domain, hosts = %path.display(), "Domain already mapped");
            return Ok(MapOutcome::AlreadyPresent);
        }

        let newline = self.line_ending();
        let mut payload = String::new();
        if !content.is_empty() && !content.ends_with('\n') {
            payload.push_str(newline);
        }
        payload.push_str(&format!("{} {}{}", LOOPBACK_IP, domain, newline));

        self.privileged_write(&payload, WriteMode::Append)
            .await
            .map_err(|e| self.denied(format!("Failed to map {}: {}", domain, e)))?;

        info!(domain, hosts = %path.display(), "Domain mapped");
        Ok(MapOutcome::Added)
    }

    /// Remove every loopback entry for `domain`.
    ///
    /// Failures are logged and swallowed: this runs during shutdown and must
    /// not stop the rest of the cleanup.
    pub async fn unmap(&self, domain: &str) {
        let path = self.hosts_path();
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) => {
                warn!(domain, hosts = %path.display(), error = %e, "Could not read hosts file for cleanup");
                return;
            }
        };

        let updated = remove_entry(&content, domain);
        if updated == content {
            debug!(domain, "No hosts entry to remove");
            return;
        }

        match self.privileged_write(&updated, WriteMode::Replace).await {
            Ok(()) => info!(domain, hosts = %path.display(), "Domain unmapped"),
            Err(e) => warn!(domain, error = %e, "Failed to remove hosts entry"),
        }
    }

    async fn privileged_write(&self, payload: &str, mode: WriteMode) -> anyhow::Result<()> {
        match self {
            DomainMapper::Posix {
                hosts_path,
                elevate_with,
            } => tee_write(hosts_path, elevate_with.as_deref(), payload, mode).await,
            DomainMapper::Windows { hosts_path } => {
                powershell_write(hosts_path, payload, mode).await
            }
        }
    }
}

async fn tee_write(
    path: &Path,
    elevate_with: Option<&str>,
    payload: &str,
    mode: WriteMode,
) -> anyhow::Result<()> {
    let mut cmd = match elevate_with {
        Some(helper) => {
            let mut cmd = Command::new(helper);
            cmd.arg("tee");
            cmd
        }
        None => Command::new("tee"),
    };
    if mode == WriteMode::Append {
        cmd.arg("-a");
    }
    cmd.arg(path);
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::inherit());

    debug!(hosts = %path.display(), ?mode, elevated = elevate_with.is_some(), "Writing hosts file");

    let mut child = cmd.spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        // The helper may exit without reading (e.g. sudo refused); the exit
        // status below is what decides success.
        let _ = stdin.write_all(payload.as_bytes()).await;
        drop(stdin);
    }

    let status = child.wait().await?;
    if !status.success() {
        anyhow::bail!("hosts writer exited with {}", status);
    }
    Ok(())
}

async fn powershell_write(path: &Path, payload: &str, mode: WriteMode) -> anyhow::Result<()> {
    let script = elevated_script(path, payload, mode);
    debug!(hosts = %path.display(), ?mode, "Writing hosts file through elevated PowerShell");

    let status = Command::new("powershell")
        .args(["-NoProfile", "-NonInteractive", "-EncodedCommand"])
        .arg(encode_powershell(&script))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .status()
        .await?;

    if !status.success() {
        anyhow::bail!("elevated PowerShell exited with {}", status);
    }
    Ok(())
}

/// Outer script: start an elevated PowerShell running the file edit, wait for
/// it and propagate its exit code
fn elevated_script(path: &Path, payload: &str, mode: WriteMode) -> String {
    let method = match mode {
        WriteMode::Append => "AppendAllText",
        WriteMode::Replace => "WriteAllText",
    };
    let inner = format!(
        "[IO.File]::{}('{}', [Text.Encoding]::UTF8.GetString([Convert]::FromBase64String('{}')))",
        method,
        path.display().to_string().replace('\'', "''"),
        BASE64.encode(payload.as_bytes()),
    );
    format!(
        "$p = Start-Process powershell -Verb RunAs -Wait -PassThru -WindowStyle Hidden \
         -ArgumentList '-NoProfile','-EncodedCommand','{}'; exit $p.ExitCode",
        encode_powershell(&inner)
    )
}

/// `-EncodedCommand` takes base64 of the UTF-16LE script text
fn encode_powershell(script: &str) -> String {
    let bytes: Vec<u8> = script
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect();
    BASE64.encode(bytes)
}

fn windows_hosts_path() -> PathBuf {
    let root = std::env::var("SystemRoot").unwrap_or_else(|_| "C:\\Windows".to_string());
    PathBuf::from(root)
        .join("System32")
        .join("drivers")
        .join("etc")
        .join("hosts")
}

/// Hostnames on an active (non-comment) hosts line, if it has any
fn line_hosts(line: &str) -> Option<(&str, Vec<&str>)> {
    let active = line.split('#').next().unwrap_or("").trim();
    let mut tokens = active.split_whitespace();
    let ip = tokens.next()?;
    let names: Vec<&str> = tokens.collect();
    if names.is_empty() {
        return None;
    }
    Some((ip, names))
}

/// True if an active line maps `domain` to the loopback address. Entries
/// pointing anywhere else (`0.0.0.0` block lists) do not count.
pub fn has_entry(content: &str, domain: &str) -> bool {
    content.lines().any(|line| match line_hosts(line) {
        Some((ip, names)) => ip == LOOPBACK_IP && names.iter().any(|n| n.eq_ignore_ascii_case(domain)),
        None => false,
    })
}

/// Drop `domain` from every loopback line; lines left without hostnames are
/// removed. All other lines are kept byte for byte.
pub fn remove_entry(content: &str, domain: &str) -> String {
    let mut out = String::with_capacity(content.len());

    for line in content.split_inclusive('\n') {
        let Some((ip, names)) = line_hosts(line) else {
            out.push_str(line);
            continue;
        };
        if ip != LOOPBACK_IP || !names.iter().any(|n| n.eq_ignore_ascii_case(domain)) {
            out.push_str(line);
            continue;
        }

        let kept: Vec<&str> = names
            .into_iter()
            .filter(|n| !n.eq_ignore_ascii_case(domain))
            .collect();
        if kept.is_empty() {
            continue;
        }

        let ending = if line.ends_with("\r\n") {
            "\r\n"
        } else if line.ends_with('\n') {
            "\n"
        } else {
            ""
        };
        out.push_str(&format!("{} {}{}", ip, kept.join(" "), ending));
    }

    out
}

/// Whether this process already runs with administrative rights
#[cfg(unix)]
pub fn is_elevated() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}

/// Whether this process already runs with administrative rights
#[cfg(windows)]
pub fn is_elevated() -> bool {
    std::process::Command::new("net")
        .arg("session")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(not(any(unix, windows)))]
pub fn is_elevated() -> bool {
    false
}
