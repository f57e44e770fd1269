//! `--install` / `--uninstall`: put the binary in the install directory,
//! persist config, and register/remove start-at-boot. Both paths assume the
//! elevation gate in main already passed.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::anyhow;
use tracing::{info, warn};

use crate::config::{normalize_api_url, AgentConfig};
use crate::lifecycle::kill_running_agent;

#[cfg(windows)]
pub const INSTALL_DIR: &str = r"C:\Program Files\Hostwatch";
#[cfg(not(windows))]
pub const INSTALL_DIR: &str = "/opt/hostwatch";

#[cfg(windows)]
const EXE_NAME: &str = "hostwatch.exe";
#[cfg(not(windows))]
const EXE_NAME: &str = "hostwatch";

#[cfg(windows)]
const TASK_NAME: &str = "HostwatchAgent";

#[cfg(not(windows))]
const SERVICE_NAME: &str = "hostwatch.service";
#[cfg(not(windows))]
const UNIT_PATH: &str = "/etc/systemd/system/hostwatch.service";

#[cfg(not(windows))]
const UNIT_TEMPLATE: &str = "\
[Unit]
Description=Hostwatch telemetry agent
After=network-online.target

[Service]
ExecStart=__TARGET__
Restart=on-failure
RestartSec=10

[Install]
WantedBy=multi-user.target
";

pub async fn install(url: Option<String>, key: Option<String>) -> anyhow::Result<()> {
    let (Some(url), Some(key)) = (url, key) else {
        anyhow::bail!(
            "--install requires --url and --key (the interactive setup flow supplies them otherwise)"
        );
    };
    let api_url = normalize_api_url(&url);

    info!("Installing agent to {INSTALL_DIR}...");
    let install_dir = PathBuf::from(INSTALL_DIR);
    std::fs::create_dir_all(&install_dir)
        .map_err(|e| anyhow!("Failed to create {INSTALL_DIR}: {e}"))?;

    // Stop any existing instance so its binary can be replaced.
    kill_running_agent(&install_dir);

    let target = install_dir.join(EXE_NAME);
    let current = std::env::current_exe()?;
    if current != target {
        std::fs::copy(&current, &target)
            .map_err(|e| anyhow!("Failed to copy agent to {}: {e}", target.display()))?;
        info!("Copied agent to {}", target.display());
    }

    let cfg = AgentConfig {
        api_url: api_url.clone(),
        api_key: key,
    };
    cfg.save(Some(&install_dir))?;

    // Probe the collector once. A failure is worth knowing about but must
    // not stop the installation.
    info!("Testing connection to {api_url}...");
    match reqwest::Client::new()
        .get(&api_url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
    {
        Ok(resp) => info!("Connection test status: {}", resp.status()),
        Err(e) => warn!("Could not reach {api_url}: {e} — installation continues"),
    }

    register_autostart(&target)?;
    info!("Agent installed and started");
    Ok(())
}

pub fn uninstall() -> anyhow::Result<()> {
    info!("Uninstalling agent...");

    remove_autostart();
    kill_running_agent(&PathBuf::from(INSTALL_DIR));

    info!("Persistence removed. Files remain at {INSTALL_DIR} for manual deletion.");
    Ok(())
}

// ── Start-at-boot registration ──────────────────────────────────

#[cfg(windows)]
fn register_autostart(target: &std::path::Path) -> anyhow::Result<()> {
    let tr = format!("\"{}\"", target.display());
    if !run_quiet(
        "schtasks",
        &[
            "/create", "/tn", TASK_NAME, "/tr", &tr, "/sc", "onstart", "/ru", "SYSTEM", "/rl",
            "HIGHEST", "/f",
        ],
    ) {
        anyhow::bail!("Failed to create scheduled task {TASK_NAME}");
    }
    info!("Scheduled task created");
    run_quiet("schtasks", &["/run", "/tn", TASK_NAME]);
    Ok(())
}

#[cfg(windows)]
fn remove_autostart() {
    run_quiet("schtasks", &["/end", "/tn", TASK_NAME]);
    run_quiet("schtasks", &["/delete", "/tn", TASK_NAME, "/f"]);
}

#[cfg(not(windows))]
fn register_autostart(target: &std::path::Path) -> anyhow::Result<()> {
    let unit = render_unit(target);
    std::fs::write(UNIT_PATH, unit).map_err(|e| anyhow!("Failed to write {UNIT_PATH}: {e}"))?;
    if !run_quiet("systemctl", &["daemon-reload"]) {
        anyhow::bail!("systemctl daemon-reload failed");
    }
    if !run_quiet("systemctl", &["enable", "--now", SERVICE_NAME]) {
        anyhow::bail!("Failed to enable {SERVICE_NAME}");
    }
    info!("Systemd unit installed and enabled");
    Ok(())
}

#[cfg(not(windows))]
fn remove_autostart() {
    run_quiet("systemctl", &["disable", "--now", SERVICE_NAME]);
    let _ = std::fs::remove_file(UNIT_PATH);
    run_quiet("systemctl", &["daemon-reload"]);
}

#[cfg(not(windows))]
fn render_unit(target: &std::path::Path) -> String {
    UNIT_TEMPLATE.replace("__TARGET__", &target.display().to_string())
}

fn run_quiet(cmd: &str, args: &[&str]) -> bool {
    std::process::Command::new(cmd)
        .args(args)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
