//! Critical-event polling. Scans the OS event logs newest-first and stops at
//! the caller's checkpoint, so nothing is reported twice and nothing is
//! dropped: a failed poll leaves the checkpoint untouched and the same
//! window is retried next interval.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::models::EventRecord;

/// Power loss (41), bugcheck (1001), disk (7), NTFS (55), application
/// crash/hang (1000/1002).
pub const CRITICAL_EVENT_IDS: &[u32] = &[41, 1001, 7, 55, 1000, 1002];

/// Logon success/failure and account creation, only watched when the
/// Security log is enabled.
pub const SECURITY_EVENT_IDS: &[u32] = &[4624, 4625, 4720];

/// Bounded read per log; anything further back than this many entries within
/// one poll window is beyond what we report.
const MAX_EVENTS_PER_LOG: usize = 256;

#[derive(Debug, Clone)]
pub struct EventLogWatcher {
    logs: Vec<&'static str>,
    allow: HashSet<u32>,
}

impl EventLogWatcher {
    pub fn new(include_security: bool) -> Self {
        let mut logs = vec!["System", "Application"];
        let mut allow: HashSet<u32> = CRITICAL_EVENT_IDS.iter().copied().collect();
        if include_security {
            logs.push("Security");
            allow.extend(SECURITY_EVENT_IDS);
        }
        Self { logs, allow }
    }

    /// Return allow-listed events with `timestamp >= since`, newest first.
    /// Any log failing to read (e.g. access denied) fails the whole poll.
    pub fn poll(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<EventRecord>> {
        if !cfg!(windows) {
            // No event-log source on this platform.
            return Ok(Vec::new());
        }

        let mut events = Vec::new();
        for log in &self.logs {
            let raw = query_log(log)?;
            let entries = parse_entries(&raw)?;
            events.extend(filter_entries(entries, since, &self.allow));
        }
        Ok(events)
    }
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(rename = "Id")]
    id: i64,
    #[serde(rename = "ProviderName")]
    provider: Option<String>,
    #[serde(rename = "LevelDisplayName")]
    level: Option<String>,
    #[serde(rename = "Message")]
    message: Option<String>,
    #[serde(rename = "TimeCreated")]
    time_created: String,
}

/// Raw identifiers carry qualifier bits in the high word; only the low
/// 16 bits name the event.
fn mask_event_id(raw: i64) -> u32 {
    (raw & 0xFFFF) as u32
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Entries arrive newest-first; stop at the first one older than the
/// checkpoint, everything beyond it is older still.
fn filter_entries(
    entries: Vec<RawEntry>,
    since: DateTime<Utc>,
    allow: &HashSet<u32>,
) -> Vec<EventRecord> {
    let mut out = Vec::new();
    for e in entries {
        let Some(ts) = parse_timestamp(&e.time_created) else {
            continue;
        };
        if ts < since {
            break;
        }
        let id = mask_event_id(e.id);
        if !allow.contains(&id) {
            continue;
        }
        out.push(EventRecord {
            event_id: id,
            source: e.provider.unwrap_or_default(),
            message: e.message.unwrap_or_default(),
            severity: e.level.unwrap_or_else(|| "Unknown".into()),
            timestamp: ts,
        });
    }
    out
}

/// `ConvertTo-Json` emits a bare object for a single event and nothing at
/// all for zero events.
fn parse_entries(raw: &str) -> anyhow::Result<Vec<RawEntry>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    if let Ok(list) = serde_json::from_str::<Vec<RawEntry>>(raw) {
        return Ok(list);
    }
    let single: RawEntry = serde_json::from_str(raw)
        .map_err(|e| anyhow::anyhow!("Unexpected event log JSON: {e}"))?;
    Ok(vec![single])
}

fn query_log(log: &str) -> anyhow::Result<String> {
    let script = format!(
        "Get-WinEvent -LogName '{log}' -MaxEvents {MAX_EVENTS_PER_LOG} -ErrorAction Stop | \
         Select-Object Id, ProviderName, LevelDisplayName, Message, \
         @{{n='TimeCreated';e={{$_.TimeCreated.ToUniversalTime().ToString('o')}}}} | \
         ConvertTo-Json -Compress"
    );

    let out = std::process::Command::new("powershell")
        .args(["-NoProfile", "-Command", &script])
        .output()
        .map_err(|e| anyhow::anyhow!("Could not run powershell: {e}"))?;

    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        // An empty log is not a failure.
        if stderr.contains("No events were found") || stderr.contains("NoMatchingEventsFound") {
            return Ok(String::new());
        }
        anyhow::bail!("Reading {log} event log failed: {}", stderr.trim());
    }

    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(id: i64, ts: DateTime<Utc>) -> RawEntry {
        RawEntry {
            id,
            provider: Some("TestSource".into()),
            level: Some("Error".into()),
            message: Some("boom".into()),
            time_created: ts.to_rfc3339(),
        }
    }

    fn allow() -> HashSet<u32> {
        CRITICAL_EVENT_IDS.iter().copied().collect()
    }

    #[test]
    fn qualifier_bits_are_stripped_before_matching() {
        assert_eq!(mask_event_id(1001), 1001);
        assert_eq!(mask_event_id(0x8000_03E9), 1001);
        assert_eq!(mask_event_id(0xC000_0029), 41);
    }

    #[test]
    fn events_older_than_checkpoint_are_never_returned() {
        let now = Utc::now();
        let since = now - Duration::minutes(5);
        let entries = vec![
            entry(41, now),
            entry(1001, now - Duration::minutes(2)),
            entry(55, now - Duration::minutes(10)),
            // Newest-first scan stops above; this would otherwise match.
            entry(41, now - Duration::minutes(20)),
        ];

        let got = filter_entries(entries, since, &allow());
        assert_eq!(got.len(), 2);
        assert!(got.iter().all(|e| e.timestamp >= since));
    }

    #[test]
    fn ids_outside_the_allow_list_are_dropped() {
        let now = Utc::now();
        let entries = vec![entry(9999, now), entry(1000, now)];
        let got = filter_entries(entries, now - Duration::minutes(1), &allow());
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].event_id, 1000);
    }

    #[test]
    fn single_object_and_array_json_both_parse() {
        let one = r#"{"Id":41,"ProviderName":"Kernel-Power","LevelDisplayName":"Critical","Message":"lost power","TimeCreated":"2026-08-01T10:00:00.0000000Z"}"#;
        assert_eq!(parse_entries(one).unwrap().len(), 1);

        let many = format!("[{one},{one}]");
        assert_eq!(parse_entries(&many).unwrap().len(), 2);

        assert!(parse_entries("").unwrap().is_empty());
    }

    #[cfg(not(windows))]
    #[test]
    fn poll_is_empty_on_non_windows() {
        let watcher = EventLogWatcher::new(true);
        assert!(watcher.poll(Utc::now()).unwrap().is_empty());
    }

    #[test]
    fn security_ids_only_with_security_log() {
        let plain = EventLogWatcher::new(false);
        let secure = EventLogWatcher::new(true);
        assert!(!plain.allow.contains(&4625));
        assert!(secure.allow.contains(&4625));
        assert!(secure.logs.contains(&"Security"));
    }
}
