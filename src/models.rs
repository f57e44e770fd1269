use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Telemetry envelope ──────────────────────────────────────────

/// Body of `POST {api_url}/telemetry`.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryPayload {
    pub machine: MachineInfo,
    pub metrics: MetricsSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<EventRecord>>,
}

/// Lightweight machine stub sent every cycle so the collector can upsert
/// "last seen". `hardware_info` is attached only on the resend cadence.
#[derive(Debug, Clone, Serialize)]
pub struct MachineInfo {
    pub id: String,
    pub hostname: String,
    pub os_info: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware_info: Option<HardwareSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<String>>,
}

/// Immutable per-process identity, created once at startup.
#[derive(Debug, Clone)]
pub struct MachineIdentity {
    pub id: String,
    pub hostname: String,
    pub os_info: String,
    pub version: String,
}

impl MachineIdentity {
    pub fn detect() -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown-host".into());

        Self {
            id: hostname.clone(),
            hostname,
            os_info: sysinfo::System::long_os_version().unwrap_or_default(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }

    pub fn stub(&self) -> MachineInfo {
        MachineInfo {
            id: self.id.clone(),
            hostname: self.hostname.clone(),
            os_info: self.os_info.clone(),
            version: self.version.clone(),
            hardware_info: None,
            users: None,
        }
    }
}

// ── Per-cycle metrics ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub cpu_usage: f32,
    pub ram_usage: f32,
    pub disk_total_gb: f64,
    pub disk_free_gb: f64,
    pub ip_address: String,
    pub processes: Vec<ProcessEntry>,
    pub disk_details: Vec<DiskDetail>,
    pub network_interfaces: Vec<NicInfo>,
    /// Kilobytes per second. The unit lives in the field name on purpose.
    pub network_up_kb_per_sec: f64,
    pub network_down_kb_per_sec: f64,
    pub active_vpn: bool,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessEntry {
    pub name: String,
    pub pid: u32,
    /// 0–100% of total CPU capacity (normalized by logical core count).
    pub cpu: f32,
    pub mem: f32,
    pub mem_mb: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskDetail {
    pub mount: String,
    pub device: String,
    #[serde(rename = "type")]
    pub fs_type: String,
    pub total_gb: f64,
    pub used_gb: f64,
    pub percent: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct NicInfo {
    pub interface: String,
    pub ip_address: String,
    pub mac: String,
    pub speed_mbps: u64,
    /// "Wi-Fi" or "Ethernet" — name heuristic, not a hardware query.
    #[serde(rename = "type")]
    pub kind: String,
    pub is_up: bool,
}

// ── Static hardware inventory ───────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct HardwareSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motherboard: Option<Motherboard>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuInventory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ram: Option<RamInfo>,
    pub disks: Vec<PhysicalDisk>,
    pub network: Vec<NicInfo>,
}

impl HardwareSnapshot {
    /// A snapshot with nothing identifying must not be sent — it would
    /// overwrite the collector's last-known-good copy with placeholders.
    pub fn has_data(&self) -> bool {
        self.motherboard.is_some() || self.cpu.is_some() || self.ram.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Motherboard {
    pub manufacturer: String,
    pub product: String,
    pub serial: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CpuInventory {
    pub name: String,
    pub cores: usize,
    pub logical: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RamInfo {
    pub modules: Vec<RamModule>,
    pub slots_used: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RamModule {
    pub capacity: String,
    pub speed: String,
    pub manufacturer: String,
    pub part_number: String,
    pub form_factor: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhysicalDisk {
    pub model: String,
    pub size_gb: f64,
    pub media_type: String,
}

// ── Event log records ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub event_id: u32,
    pub source: String,
    pub message: String,
    pub severity: String,
    pub timestamp: DateTime<Utc>,
}

// ── Remote command frames ───────────────────────────────────────

/// Inbound/outbound WebSocket frames: `{"event": ..., "data": ...}`.
#[derive(Debug, Deserialize)]
pub struct WsEnvelope {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandRequest {
    pub id: Option<String>,
    pub command: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub id: String,
    pub output: String,
    pub status: CommandStatus,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Completed,
    Failed,
}

// ── Update manifest ─────────────────────────────────────────────

/// Server response for `GET /agent/check-update`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckUpdateResponse {
    pub update_available: bool,
    pub version: Option<String>,
    pub download_url: Option<String>,
    pub file_hash: Option<String>,
    pub file_size: Option<u64>,
}

/// Everything needed for one update attempt. Transient — dropped as soon as
/// the attempt finishes, successful or not.
#[derive(Debug, Clone)]
pub struct UpdateManifest {
    pub version: String,
    pub download_url: String,
    pub file_hash: String,
    pub file_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_update_response_parses_server_shape() {
        let raw = r#"{
            "updateAvailable": true,
            "version": "0.4.0",
            "downloadUrl": "/api/agent/download?v=0.4.0",
            "fileHash": "ab12",
            "fileSize": 1048576
        }"#;
        let resp: CheckUpdateResponse = serde_json::from_str(raw).unwrap();
        assert!(resp.update_available);
        assert_eq!(resp.version.as_deref(), Some("0.4.0"));
        assert_eq!(resp.file_size, Some(1_048_576));
    }

    #[test]
    fn no_update_response_has_nulls() {
        let resp: CheckUpdateResponse =
            serde_json::from_str(r#"{"updateAvailable": false}"#).unwrap();
        assert!(!resp.update_available);
        assert!(resp.version.is_none());
    }

    #[test]
    fn hardware_info_omitted_when_absent() {
        let machine = MachineInfo {
            id: "pc-1".into(),
            hostname: "pc-1".into(),
            os_info: "Linux 6.1".into(),
            version: "0.3.2".into(),
            hardware_info: None,
            users: None,
        };
        let v = serde_json::to_value(&machine).unwrap();
        assert!(v.get("hardware_info").is_none());
        assert!(v.get("users").is_none());
    }

    #[test]
    fn empty_hardware_snapshot_is_flagged() {
        let hw = HardwareSnapshot {
            motherboard: None,
            cpu: None,
            ram: None,
            disks: Vec::new(),
            network: Vec::new(),
        };
        assert!(!hw.has_data());
    }

    #[test]
    fn command_result_uses_snake_case_status() {
        let res = CommandResult {
            id: "cmd-1".into(),
            output: "[No Output]".into(),
            status: CommandStatus::Completed,
        };
        let v = serde_json::to_value(&res).unwrap();
        assert_eq!(v["status"], "completed");
    }
}
