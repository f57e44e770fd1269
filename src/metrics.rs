use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::time::Instant;

use sysinfo::{Disks, Networks, ProcessesToUpdate, System};
use tracing::error;

use crate::models::{DiskDetail, MetricsSnapshot, NicInfo, ProcessEntry};

/// Process list is capped to the top entries by CPU share.
const TOP_PROCESSES: usize = 15;

const GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Holds the sysinfo handles plus the rolling state needed for rate
/// calculations. Owned exclusively by the main loop (behind a mutex); remote
/// command execution never touches it.
pub struct Sampler {
    sys: System,
    disks: Disks,
    networks: Networks,
    net_rate: NetRateState,
    primed: bool,
}

impl Sampler {
    pub fn new() -> Self {
        Self {
            sys: System::new_all(),
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
            net_rate: NetRateState::default(),
            primed: false,
        }
    }

    /// One-time warm-up so CPU readings have a baseline delta. Runs on a
    /// blocking thread at startup; until it completes, `sample()` falls back
    /// to a short blocking measurement of its own.
    pub fn prime(&mut self) {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_processes(ProcessesToUpdate::All);
        std::thread::sleep(std::time::Duration::from_millis(500));
        self.sys.refresh_cpu_usage();
        self.sys.refresh_processes(ProcessesToUpdate::All);
        self.primed = true;
    }

    /// Take a point-in-time snapshot. Sub-collector failures degrade the
    /// snapshot; a panic inside collection skips the whole cycle.
    pub fn sample(&mut self) -> Option<MetricsSnapshot> {
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.collect())) {
            Ok(snapshot) => Some(snapshot),
            Err(_) => {
                error!("Metrics collection panicked — skipping this cycle");
                None
            }
        }
    }

    fn collect(&mut self) -> MetricsSnapshot {
        // ── CPU ─────────────────────────────────────────────────
        if self.primed {
            self.sys.refresh_cpu_usage();
        } else {
            // Warm-up hasn't landed yet: take a short blocking measurement
            // so the first cycles aren't silently zero.
            self.sys.refresh_cpu_usage();
            std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
            self.sys.refresh_cpu_usage();
        }
        let cpu_usage = self.sys.global_cpu_usage().clamp(0.0, 100.0);

        // ── Memory ──────────────────────────────────────────────
        self.sys.refresh_memory();
        let total_mem = self.sys.total_memory();
        let ram_usage = if total_mem > 0 {
            (self.sys.used_memory() as f64 / total_mem as f64 * 100.0) as f32
        } else {
            0.0
        }
        .clamp(0.0, 100.0);

        // ── Processes (top N by CPU, task-manager scale) ────────
        self.sys.refresh_processes(ProcessesToUpdate::All);
        let cores = self.sys.cpus().len().max(1) as f32;
        let mut processes: Vec<ProcessEntry> = self
            .sys
            .processes()
            .values()
            .map(|p| {
                let mem_bytes = p.memory();
                ProcessEntry {
                    name: p.name().to_string_lossy().into_owned(),
                    pid: p.pid().as_u32(),
                    cpu: round1((p.cpu_usage() / cores).clamp(0.0, 100.0)),
                    mem: if total_mem > 0 {
                        round1((mem_bytes as f64 / total_mem as f64 * 100.0) as f32)
                    } else {
                        0.0
                    },
                    mem_mb: round2(mem_bytes as f64 / (1024.0 * 1024.0)),
                }
            })
            .collect();
        processes.sort_by(|a, b| b.cpu.partial_cmp(&a.cpu).unwrap_or(std::cmp::Ordering::Equal));
        processes.truncate(TOP_PROCESSES);

        // ── Disks ───────────────────────────────────────────────
        self.disks.refresh_list();
        let mut disk_details = Vec::new();
        for d in self.disks.iter() {
            let fs_type = d.file_system().to_string_lossy().into_owned();
            let total = d.total_space();
            // Optical drives and unformatted volumes report no filesystem
            // or zero capacity.
            if fs_type.is_empty() || total == 0 {
                continue;
            }
            let used = total.saturating_sub(d.available_space());
            disk_details.push(DiskDetail {
                mount: d.mount_point().display().to_string(),
                device: d.name().to_string_lossy().into_owned(),
                fs_type,
                total_gb: round2(total as f64 / GB),
                used_gb: round2(used as f64 / GB),
                percent: round1((used as f64 / total as f64 * 100.0) as f32),
            });
        }

        let root = self
            .disks
            .iter()
            .find(|d| {
                let m = d.mount_point();
                m == Path::new("/") || m == Path::new("C:\\")
            })
            .or_else(|| self.disks.iter().next());
        let (disk_total_gb, disk_free_gb) = root
            .map(|d| {
                (
                    round2(d.total_space() as f64 / GB),
                    round2(d.available_space() as f64 / GB),
                )
            })
            .unwrap_or((0.0, 0.0));

        // ── Network interfaces & throughput ─────────────────────
        self.networks.refresh_list();
        let network_interfaces = nic_inventory(&self.networks);
        let active_vpn = self
            .networks
            .iter()
            .any(|(name, _)| is_tunnel_name(name) && nic_is_up(name));

        let (mut rx_total, mut tx_total) = (0u64, 0u64);
        for (_, data) in self.networks.iter() {
            rx_total = rx_total.wrapping_add(data.total_received());
            tx_total = tx_total.wrapping_add(data.total_transmitted());
        }
        let (network_down_kb_per_sec, network_up_kb_per_sec) =
            self.net_rate.update(rx_total, tx_total, Instant::now());

        MetricsSnapshot {
            cpu_usage,
            ram_usage,
            disk_total_gb,
            disk_free_gb,
            ip_address: local_ip_address::local_ip()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "127.0.0.1".into()),
            processes,
            disk_details,
            network_interfaces,
            network_up_kb_per_sec,
            network_down_kb_per_sec,
            active_vpn,
            uptime_seconds: System::uptime(),
        }
    }
}

// ── Network rate tracking ───────────────────────────────────────

/// Previous sample's byte counters. First update yields zero rates rather
/// than an error.
#[derive(Debug, Default)]
pub struct NetRateState {
    prev: Option<NetSample>,
}

#[derive(Debug, Clone, Copy)]
struct NetSample {
    rx: u64,
    tx: u64,
    at: Instant,
}

impl NetRateState {
    /// KB/s `(down, up)` since the previous sample.
    pub fn update(&mut self, rx: u64, tx: u64, at: Instant) -> (f64, f64) {
        let rates = match self.prev {
            Some(prev) => {
                let dt = at.duration_since(prev.at).as_secs_f64();
                if dt > 0.0 {
                    (
                        round2(rx.saturating_sub(prev.rx) as f64 / dt / 1024.0),
                        round2(tx.saturating_sub(prev.tx) as f64 / dt / 1024.0),
                    )
                } else {
                    (0.0, 0.0)
                }
            }
            None => (0.0, 0.0),
        };
        self.prev = Some(NetSample { rx, tx, at });
        rates
    }
}

// ── NIC helpers (shared with the hardware inventory) ────────────

pub(crate) fn nic_inventory(networks: &Networks) -> Vec<NicInfo> {
    let mut nics = Vec::new();
    for (name, data) in networks.iter() {
        if is_loopback_name(name) {
            continue;
        }
        // Interfaces without an IPv4 address aren't interesting to the
        // dashboard.
        let Some(ip) = data
            .ip_networks()
            .iter()
            .map(|n| n.addr)
            .find(|a| a.is_ipv4())
        else {
            continue;
        };
        nics.push(NicInfo {
            interface: name.clone(),
            ip_address: ip.to_string(),
            mac: data.mac_address().to_string(),
            speed_mbps: link_speed_mbps(name),
            kind: nic_kind(name).to_string(),
            is_up: nic_is_up(name),
        });
    }
    nics
}

pub(crate) fn is_loopback_name(name: &str) -> bool {
    let n = name.to_lowercase();
    n == "lo" || n.starts_with("loop") || n.contains("loopback")
}

fn is_tunnel_name(name: &str) -> bool {
    let n = name.to_lowercase();
    n.contains("tun") || n.contains("tap") || n.contains("vpn")
}

pub(crate) fn nic_kind(name: &str) -> &'static str {
    let n = name.to_lowercase();
    if n.contains("wi-fi") || n.contains("wlan") || n.contains("wireless") {
        "Wi-Fi"
    } else {
        "Ethernet"
    }
}

#[cfg(target_os = "linux")]
fn link_speed_mbps(name: &str) -> u64 {
    // Drivers report -1 when the link speed is unknown.
    std::fs::read_to_string(format!("/sys/class/net/{name}/speed"))
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .filter(|v| *v > 0)
        .map(|v| v as u64)
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn link_speed_mbps(_name: &str) -> u64 {
    0
}

#[cfg(target_os = "linux")]
fn nic_is_up(name: &str) -> bool {
    std::fs::read_to_string(format!("/sys/class/net/{name}/operstate"))
        .map(|s| s.trim() == "up")
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn nic_is_up(_name: &str) -> bool {
    true
}

// ── Logged-in users ─────────────────────────────────────────────

/// Names of currently logged-in users via `who`/`quser`. Best effort —
/// an unavailable tool yields an empty list.
pub fn logged_in_users() -> Vec<String> {
    let output = if cfg!(windows) {
        std::process::Command::new("quser").output()
    } else {
        std::process::Command::new("who").output()
    };
    let Ok(out) = output else {
        return Vec::new();
    };

    let stdout = String::from_utf8_lossy(&out.stdout);
    // quser prints a header row; `who` does not.
    let skip = usize::from(cfg!(windows));

    let mut seen = HashSet::new();
    let mut users = Vec::new();
    for line in stdout.lines().skip(skip) {
        if let Some(first) = line.split_whitespace().next() {
            // quser marks the active session with a leading '>'
            let name = first.trim_start_matches('>').to_string();
            if !name.is_empty() && seen.insert(name.clone()) {
                users.push(name);
            }
        }
    }
    users
}

fn round1(v: f32) -> f32 {
    (v * 10.0).round() / 10.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_net_sample_yields_zero_rates() {
        let mut state = NetRateState::default();
        assert_eq!(state.update(1_000_000, 500_000, Instant::now()), (0.0, 0.0));
    }

    #[test]
    fn net_rate_is_delta_over_time_in_kb() {
        let mut state = NetRateState::default();
        let t0 = Instant::now();
        state.update(0, 0, t0);

        // 204800 bytes down, 102400 up over 2 seconds -> 100 / 50 KB/s
        let (down, up) = state.update(204_800, 102_400, t0 + Duration::from_secs(2));
        assert_eq!(down, 100.0);
        assert_eq!(up, 50.0);
    }

    #[test]
    fn counter_reset_does_not_go_negative() {
        let mut state = NetRateState::default();
        let t0 = Instant::now();
        state.update(1_000_000, 1_000_000, t0);
        let (down, up) = state.update(100, 100, t0 + Duration::from_secs(1));
        assert_eq!((down, up), (0.0, 0.0));
    }

    #[test]
    fn nic_kind_heuristic() {
        assert_eq!(nic_kind("Wi-Fi"), "Wi-Fi");
        assert_eq!(nic_kind("wlan0"), "Wi-Fi");
        assert_eq!(nic_kind("Intel Wireless-AC"), "Wi-Fi");
        assert_eq!(nic_kind("eth0"), "Ethernet");
        assert_eq!(nic_kind("enp3s0"), "Ethernet");
    }

    #[test]
    fn loopback_names_are_skipped() {
        assert!(is_loopback_name("lo"));
        assert!(is_loopback_name("Loopback Pseudo-Interface 1"));
        assert!(!is_loopback_name("eth0"));
    }

    #[test]
    fn sample_produces_bounded_percentages() {
        let mut sampler = Sampler::new();
        let snap = sampler.sample().expect("snapshot");
        assert!((0.0..=100.0).contains(&snap.cpu_usage));
        assert!((0.0..=100.0).contains(&snap.ram_usage));
        assert!(snap.processes.len() <= TOP_PROCESSES);
        // Very first sample ever: no previous counters, so exactly zero.
        assert_eq!(snap.network_up_kb_per_sec, 0.0);
        assert_eq!(snap.network_down_kb_per_sec, 0.0);
    }
}
