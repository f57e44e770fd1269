//! Startup guards: elevated privilege, single-instance process lock, and
//! the kill switch that tears a running instance down.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{info, warn};

pub const LOCK_FILE: &str = "agent.pid";

const KILL_GRACE: Duration = Duration::from_secs(3);

// ── Privilege ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Elevation {
    /// Already running with the required privilege.
    Elevated,
    /// Can re-launch itself with an elevation request; the new process is
    /// authoritative and the current one must exit.
    NeedsRelaunch,
    /// No privilege and no way to self-elevate here.
    Denied,
}

pub fn check_elevation() -> Elevation {
    // Escape hatch for development and CI.
    if std::env::var("HOSTWATCH_TEST_MODE").is_ok() {
        return Elevation::Elevated;
    }

    #[cfg(windows)]
    {
        let probe = std::process::Command::new("powershell")
            .args([
                "-NoProfile",
                "-Command",
                "([Security.Principal.WindowsPrincipal][Security.Principal.WindowsIdentity]::GetCurrent()).IsInRole([Security.Principal.WindowsBuiltInRole]::Administrator)",
            ])
            .output();
        return match probe {
            Ok(out) if out.status.success() => {
                if String::from_utf8_lossy(&out.stdout).trim().eq_ignore_ascii_case("true") {
                    Elevation::Elevated
                } else {
                    Elevation::NeedsRelaunch
                }
            }
            _ => Elevation::Denied,
        };
    }

    #[cfg(unix)]
    {
        let probe = std::process::Command::new("id").arg("-u").output();
        return match probe {
            Ok(out) if String::from_utf8_lossy(&out.stdout).trim() == "0" => Elevation::Elevated,
            // There is no non-interactive self-elevation on Unix; the
            // operator has to start us as root.
            Ok(_) => Elevation::Denied,
            Err(_) => Elevation::Denied,
        };
    }

    #[cfg(not(any(windows, unix)))]
    {
        return Elevation::Denied;
    }
}

/// Spawn an elevated copy of ourselves with the same arguments. The caller
/// exits afterwards — no retry, the new process is authoritative.
pub fn relaunch_elevated() -> anyhow::Result<()> {
    #[cfg(windows)]
    {
        let exe = std::env::current_exe()?;
        let args: Vec<String> = std::env::args().skip(1).collect();
        let arg_list = args
            .iter()
            .map(|a| format!("'{}'", a.replace('\'', "''")))
            .collect::<Vec<_>>()
            .join(",");
        let script = if arg_list.is_empty() {
            format!("Start-Process -FilePath '{}' -Verb RunAs", exe.display())
        } else {
            format!(
                "Start-Process -FilePath '{}' -ArgumentList {arg_list} -Verb RunAs",
                exe.display()
            )
        };
        std::process::Command::new("powershell")
            .args(["-NoProfile", "-Command", &script])
            .spawn()?;
        return Ok(());
    }

    #[cfg(not(windows))]
    {
        anyhow::bail!("Self-elevation is not supported on this platform — run as root");
    }
}

// ── Single-instance lock ────────────────────────────────────────

/// A file holding the live instance's PID. At most one live agent per host:
/// a recorded live PID turns the newcomer away, a dead one is reclaimed.
pub struct ProcessLock {
    path: PathBuf,
}

impl ProcessLock {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(LOCK_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn acquire(&self) -> anyhow::Result<()> {
        self.acquire_with(std::process::id(), pid_alive)
    }

    fn acquire_with(&self, current: u32, alive: impl Fn(u32) -> bool) -> anyhow::Result<()> {
        if let Some(existing) = read_pid_file(&self.path) {
            if existing != current && alive(existing) {
                anyhow::bail!("Agent already running (PID: {existing})");
            }
            warn!("Stale lock file found (PID {existing}) — reclaiming");
        }
        std::fs::write(&self.path, current.to_string())
            .map_err(|e| anyhow::anyhow!("Failed to write {}: {e}", self.path.display()))?;
        Ok(())
    }

    /// Only the kill switch releases the lock. Normal loop exit leaves it in
    /// place so a crash shows up as a stale-but-detectable lock, never as an
    /// orphan with no owner.
    pub fn release(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn read_pid_file(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

pub fn pid_alive(pid: u32) -> bool {
    let mut sys = System::new();
    let pid = Pid::from_u32(pid);
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]));
    sys.process(pid).is_some()
}

// ── Kill switch ─────────────────────────────────────────────────

/// Terminate the recorded agent instance: graceful first, forced after a
/// bounded grace period. Removes the lock file. Returns `false` when no
/// instance was recorded.
pub fn kill_running_agent(dir: &Path) -> bool {
    let lock = ProcessLock::new(dir);
    let Some(pid) = read_pid_file(lock.path()) else {
        warn!("No active agent found ({LOCK_FILE} missing)");
        return false;
    };

    let sys_pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]));
    let Some(process) = sys.process(sys_pid) else {
        warn!("Process {pid} not found — cleaning up stale lock file");
        lock.release();
        return true;
    };

    info!("Stopping agent (PID: {pid})...");
    // SIGTERM where the platform has it; hard kill otherwise.
    if process.kill_with(sysinfo::Signal::Term).is_none() {
        process.kill();
    }

    let deadline = Instant::now() + KILL_GRACE;
    loop {
        std::thread::sleep(Duration::from_millis(200));
        sys.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]));
        match sys.process(sys_pid) {
            None => break,
            Some(p) => {
                if Instant::now() >= deadline {
                    p.kill();
                    break;
                }
            }
        }
    }

    info!("Agent stopped");
    lock.release();
    true
}
