use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.json";

/// Collector endpoint and credentials, loaded from `config.json` next to
/// the binary. The running agent never mutates this; the only writer is the
/// install path's explicit [`AgentConfig::save`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub api_url: String,
    pub api_key: String,
}

impl AgentConfig {
    /// Load from the given directory, or the install directory by default.
    pub fn load(dir: Option<&Path>) -> anyhow::Result<Self> {
        let path = match dir {
            Some(d) => d.join(CONFIG_FILE),
            None => exe_dir()?.join(CONFIG_FILE),
        };

        let raw = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Failed to read config at {}: {e}", path.display()))?;

        let config: AgentConfig = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Malformed config at {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Persist to `config.json` in the given directory (install dir by default).
    pub fn save(&self, dir: Option<&Path>) -> anyhow::Result<PathBuf> {
        let path = match dir {
            Some(d) => d.join(CONFIG_FILE),
            None => exe_dir()?.join(CONFIG_FILE),
        };

        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, raw)
            .map_err(|e| anyhow::anyhow!("Failed to write config at {}: {e}", path.display()))?;
        Ok(path)
    }
}

/// Directory the running binary lives in. Config, lock file and update
/// artifacts are all colocated here.
pub fn exe_dir() -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe()?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow::anyhow!("Executable has no parent directory"))
}

/// Normalize an operator-supplied server URL the way the setup flow does:
/// default the scheme to https, strip a trailing slash, enforce the `/api`
/// suffix the collector routes under.
pub fn normalize_api_url(input: &str) -> String {
    let mut url = input.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        url = format!("https://{url}");
    }

    if !url.ends_with("/api") {
        if url.ends_with('/') {
            url.pop();
        }
        url.push_str("/api");
    }

    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AgentConfig {
            api_url: "https://example.com/api".into(),
            api_key: "abc123".into(),
        };
        cfg.save(Some(dir.path())).unwrap();

        let loaded = AgentConfig::load(Some(dir.path())).unwrap();
        assert_eq!(loaded.api_url, "https://example.com/api");
        assert_eq!(loaded.api_key, "abc123");
    }

    #[test]
    fn load_fails_when_config_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AgentConfig::load(Some(dir.path())).is_err());
    }

    #[test]
    fn normalize_adds_scheme_and_api_suffix() {
        assert_eq!(
            normalize_api_url("monitor.example.org"),
            "https://monitor.example.org/api"
        );
        assert_eq!(
            normalize_api_url("https://monitor.example.org/"),
            "https://monitor.example.org/api"
        );
        assert_eq!(
            normalize_api_url("http://10.0.0.5:3001/api"),
            "http://10.0.0.5:3001/api"
        );
    }
}
