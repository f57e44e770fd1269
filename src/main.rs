mod commands;
mod config;
mod dispatch;
mod events;
mod hardware;
mod install;
mod lifecycle;
mod metrics;
mod models;
mod update;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use clap::Parser;
use tracing::{error, info, warn};

use crate::commands::CommandChannel;
use crate::config::{exe_dir, AgentConfig};
use crate::dispatch::PayloadDispatcher;
use crate::events::EventLogWatcher;
use crate::lifecycle::{
    check_elevation, kill_running_agent, relaunch_elevated, Elevation, ProcessLock,
};
use crate::metrics::Sampler;
use crate::models::{HardwareSnapshot, MachineIdentity, TelemetryPayload};
use crate::update::UpdateManager;

const BANNER: &str = r#"
  _   _           _            _       _
 | | | | ___  ___| |___      _| |_ ___| |__
 | |_| |/ _ \/ __| __\ \ /\ / / __/ __| '_ \
 |  _  | (_) \__ \ |_ \ V  V /| || (__| | | |
 |_| |_|\___/|___/\__| \_/\_/  \__\___|_| |_|
  Host Telemetry Agent
"#;

/// Cadence of the sampling/delivery loop.
const TELEMETRY_INTERVAL: Duration = Duration::from_secs(3);
/// Cadence of event log polls.
const EVENT_POLL_INTERVAL: Duration = Duration::from_secs(300);
/// Cadence at which the cached hardware inventory is re-attached.
const HARDWARE_RESEND_INTERVAL: Duration = Duration::from_secs(300);
/// Watch the Security log (logon/account events) as well.
const MONITOR_SECURITY_LOG: bool = false;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(
    name = "hostwatch",
    version,
    about = "Host telemetry agent — metrics, event logs, remote commands, self-update"
)]
struct Cli {
    /// Install the agent and register it to start at boot
    #[arg(long)]
    install: bool,
    /// Stop the agent and remove the start-at-boot registration
    #[arg(long)]
    uninstall: bool,
    /// Terminate the running agent instance (kill switch)
    #[arg(long)]
    kill: bool,
    /// Collector URL, used with --install
    #[arg(long)]
    url: Option<String>,
    /// Collector API key, used with --install
    #[arg(long)]
    key: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hostwatch=info".into()),
        )
        .compact()
        .init();

    let cli = Cli::parse();

    // ── Privilege gate ──────────────────────────────────────────
    match check_elevation() {
        Elevation::Elevated => {}
        Elevation::NeedsRelaunch => {
            info!("Not elevated — requesting elevation and handing over");
            if let Err(e) = relaunch_elevated() {
                error!("Failed to relaunch elevated: {e}");
            }
            // The elevated process is authoritative either way.
            std::process::exit(1);
        }
        Elevation::Denied => {
            error!("Elevated privileges are required. Re-run as administrator/root.");
            std::process::exit(1);
        }
    }

    if cli.kill {
        kill_running_agent(&exe_dir()?);
        return Ok(());
    }
    if cli.install {
        return install::install(cli.url, cli.key).await;
    }
    if cli.uninstall {
        return install::uninstall();
    }

    println!("{BANNER}");

    // ── Config ──────────────────────────────────────────────────
    let cfg = match AgentConfig::load(None) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{e}");
            error!("Run `hostwatch --install --url <collector> --key <api key>` first.");
            std::process::exit(1);
        }
    };

    // ── Single-instance lock ────────────────────────────────────
    let lock = ProcessLock::new(&exe_dir()?);
    if let Err(e) = lock.acquire() {
        error!("{e} — exiting.");
        std::process::exit(1);
    }

    run_agent(cfg).await
}

struct Agent {
    identity: MachineIdentity,
    sampler: Arc<Mutex<Sampler>>,
    watcher: EventLogWatcher,
    hardware: Option<HardwareSnapshot>,
    dispatcher: PayloadDispatcher,
    channel: CommandChannel,
    updater: UpdateManager,
    last_event_check: DateTime<Utc>,
    last_hardware_sent: Option<Instant>,
}

async fn run_agent(cfg: AgentConfig) -> anyhow::Result<()> {
    let identity = MachineIdentity::detect();
    info!(
        "Starting agent v{} on {} ({})",
        identity.version, identity.hostname, identity.os_info
    );

    let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;

    // The sampler is only ever locked by the loop's blocking scans and the
    // one-shot priming task; command execution shares nothing with it.
    let sampler = Arc::new(Mutex::new(Sampler::new()));
    {
        let sampler = Arc::clone(&sampler);
        tokio::task::spawn_blocking(move || {
            sampler.lock().expect("Sampler mutex poisoned").prime();
            info!("CPU priming complete");
        });
    }

    // Captured once, cached, re-attached on the resend cadence.
    let hardware = tokio::task::spawn_blocking(hardware::collect)
        .await
        .unwrap_or(None);
    if hardware.is_none() {
        warn!("Hardware inventory unavailable — field will be suppressed");
    }

    let mut agent = Agent {
        sampler,
        watcher: EventLogWatcher::new(MONITOR_SECURITY_LOG),
        hardware,
        dispatcher: PayloadDispatcher::new(http.clone(), cfg.api_url.clone(), cfg.api_key.clone()),
        channel: CommandChannel::new(&cfg.api_url, &identity.id)?,
        updater: UpdateManager::new(http, cfg.api_url.clone(), identity.version.clone()),
        identity,
        last_event_check: Utc::now() - chrono::Duration::minutes(5),
        last_hardware_sent: None,
    };

    info!(
        "Telemetry loop started — every {}s to {}",
        TELEMETRY_INTERVAL.as_secs(),
        cfg.api_url
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received — stopping agent");
                return Ok(());
            }
            _ = agent.cycle() => {}
        }
    }
}

impl Agent {
    /// One telemetry cycle: reconnect the command channel if needed, sample,
    /// assemble the payload (hardware and events on their slower cadences),
    /// deliver, then give the updater its turn.
    async fn cycle(&mut self) {
        self.channel.ensure_connected();

        let sampler = Arc::clone(&self.sampler);
        let snapshot = tokio::task::spawn_blocking(move || {
            sampler.lock().expect("Sampler mutex poisoned").sample()
        })
        .await;

        let snapshot = match snapshot {
            Ok(Some(snap)) => Some(snap),
            Ok(None) => {
                warn!("No metrics this cycle — skipping delivery");
                None
            }
            Err(e) => {
                error!("Sampler task panicked: {e}");
                None
            }
        };

        if let Some(metrics) = snapshot {
            let mut machine = self.identity.stub();

            if self.hardware.is_some()
                && should_resend(self.last_hardware_sent, HARDWARE_RESEND_INTERVAL)
            {
                machine.hardware_info = self.hardware.clone();
                let users = tokio::task::spawn_blocking(metrics::logged_in_users)
                    .await
                    .unwrap_or_default();
                machine.users = (!users.is_empty()).then_some(users);
                self.last_hardware_sent = Some(Instant::now());
            }

            let mut payload = TelemetryPayload {
                machine,
                metrics,
                events: None,
            };

            let now = Utc::now();
            if (now - self.last_event_check).num_seconds() >= EVENT_POLL_INTERVAL.as_secs() as i64
            {
                let watcher = self.watcher.clone();
                let since = self.last_event_check;
                match tokio::task::spawn_blocking(move || watcher.poll(since)).await {
                    Ok(Ok(events)) => {
                        if !events.is_empty() {
                            info!("Found {} critical event(s)", events.len());
                            payload.events = Some(events);
                        }
                        // Advances only after a complete poll; a failed poll
                        // retries the same window next interval.
                        self.last_event_check = now;
                    }
                    Ok(Err(e)) => warn!("Event log poll failed: {e}"),
                    Err(e) => error!("Event poll task panicked: {e}"),
                }
            }

            if !self.dispatcher.send("telemetry", &payload).await {
                warn!("Telemetry for this cycle was lost");
            }
        }

        // A launched swap helper means our binary is about to be replaced:
        // exit right away so the file lock is released, no cleanup.
        if self.updater.tick().await {
            std::process::exit(0);
        }

        tokio::time::sleep(TELEMETRY_INTERVAL).await;
    }
}

fn should_resend(last: Option<Instant>, interval: Duration) -> bool {
    last.map_or(true, |t| t.elapsed() >= interval)
}
