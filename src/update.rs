// ─────────────────────────────────────────────────────────────────
//  update.rs — Self-update: check, download, verify, swap, rollback
//
//  The binary swap runs in a detached helper script so the running
//  process can release its own file lock. Protocol: download →
//  verify (size + SHA-256) → backup → swap → verify-started →
//  rollback on failure.
// ─────────────────────────────────────────────────────────────────

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::{info, warn};
use url::Url;

use crate::config::exe_dir;
use crate::models::{CheckUpdateResponse, UpdateManifest};

pub const UPDATE_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

const STAGED_NAME: &str = "agent_update.tmp";

pub struct UpdateManager {
    http: reqwest::Client,
    api_url: String,
    current_version: String,
    check_interval: Duration,
    last_check: Option<Instant>,
}

impl UpdateManager {
    pub fn new(http: reqwest::Client, api_url: String, current_version: String) -> Self {
        Self {
            http,
            api_url,
            current_version,
            check_interval: UPDATE_CHECK_INTERVAL,
            last_check: None,
        }
    }

    /// Runs at most once per check interval. Returns `true` only when a
    /// verified update has been staged and the swap helper launched — the
    /// caller must then exit immediately, without cleanup, so the helper
    /// can replace the binary.
    pub async fn tick(&mut self) -> bool {
        if self
            .last_check
            .is_some_and(|t| t.elapsed() < self.check_interval)
        {
            return false;
        }
        self.last_check = Some(Instant::now());

        let manifest = match self.check().await {
            Ok(Some(m)) => m,
            Ok(None) => return false,
            Err(e) => {
                warn!("Update check failed: {e}");
                return false;
            }
        };
        info!(
            "Update available: {} -> {}",
            self.current_version, manifest.version
        );

        let staged = match self.stage(&manifest).await {
            Ok(p) => p,
            Err(e) => {
                warn!("Update aborted: {e}");
                return false;
            }
        };

        match launch_swap_helper(&staged) {
            Ok(()) => {
                info!("Update helper launched — exiting so the binary can be swapped");
                true
            }
            Err(e) => {
                warn!("Failed to launch update helper: {e}");
                let _ = std::fs::remove_file(&staged);
                false
            }
        }
    }

    async fn check(&self) -> anyhow::Result<Option<UpdateManifest>> {
        let url = format!(
            "{}/agent/check-update?current_version={}",
            self.api_url, self.current_version
        );
        let resp: CheckUpdateResponse = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !resp.update_available {
            return Ok(None);
        }
        let (Some(version), Some(download_url), Some(file_hash), Some(file_size)) =
            (resp.version, resp.download_url, resp.file_hash, resp.file_size)
        else {
            anyhow::bail!("Update manifest incomplete — refusing to proceed");
        };

        Ok(Some(UpdateManifest {
            version,
            download_url: resolve_download_url(&self.api_url, &download_url)?,
            file_hash,
            file_size,
        }))
    }

    /// Stream the new binary to a temp file beside the install and verify
    /// it. Any failure leaves no artifact behind.
    async fn stage(&self, manifest: &UpdateManifest) -> anyhow::Result<PathBuf> {
        let staged = exe_dir()?.join(STAGED_NAME);

        if let Err(e) = self.download(&manifest.download_url, &staged).await {
            let _ = std::fs::remove_file(&staged);
            return Err(e);
        }
        verify_or_discard(&staged, manifest.file_size, &manifest.file_hash)?;
        Ok(staged)
    }

    async fn download(&self, url: &str, dest: &Path) -> anyhow::Result<()> {
        let mut resp = self.http.get(url).send().await?.error_for_status()?;
        let mut file = std::fs::File::create(dest)?;
        while let Some(chunk) = resp.chunk().await? {
            file.write_all(&chunk)?;
        }
        file.flush()?;
        Ok(())
    }
}

/// Both gates are hard invariants: exact byte size and SHA-256 digest.
/// A mismatch deletes the artifact — the swap is never attempted.
pub fn verify_or_discard(path: &Path, expected_size: u64, expected_hash: &str) -> anyhow::Result<()> {
    let result = verify_artifact(path, expected_size, expected_hash);
    if result.is_err() {
        let _ = std::fs::remove_file(path);
    }
    result
}

fn verify_artifact(path: &Path, expected_size: u64, expected_hash: &str) -> anyhow::Result<()> {
    let data = std::fs::read(path)?;
    if data.len() as u64 != expected_size {
        anyhow::bail!(
            "Size mismatch: expected {expected_size} bytes, got {}",
            data.len()
        );
    }
    let digest = format!("{:x}", Sha256::digest(&data));
    if !digest.eq_ignore_ascii_case(expected_hash) {
        anyhow::bail!("Hash mismatch: expected {expected_hash}, got {digest}");
    }
    Ok(())
}

fn resolve_download_url(api_url: &str, raw: &str) -> anyhow::Result<String> {
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return Ok(raw.to_string());
    }
    let base = Url::parse(api_url)?;
    Ok(base.join(raw)?.to_string())
}

// ── Swap helper ─────────────────────────────────────────────────

/// Applier script template. States: terminate, backup, swap, relaunch,
/// verify-start, rollback, cleanup. The helper runs detached so it
/// survives the agent's own exit and can replace its binary.
#[cfg(not(windows))]
const SWAP_TEMPLATE: &str = r#"#!/bin/sh
# hostwatch update applier — generated file, removes itself when done
sleep 2
# terminate: make sure the old agent released its binary
kill -9 __PID__ 2>/dev/null || true
# backup
cp -p "__TARGET__" "__BACKUP__" || exit 1
# swap
mv "__STAGED__" "__TARGET__" || exit 1
chmod +x "__TARGET__"
# relaunch
"__TARGET__" >/dev/null 2>&1 &
NEW_PID=$!
sleep 3
# verify-start
if kill -0 "$NEW_PID" 2>/dev/null; then
    # cleanup
    rm -f "__BACKUP__"
else
    # rollback
    cp -p "__BACKUP__" "__TARGET__"
    "__TARGET__" >/dev/null 2>&1 &
fi
rm -f -- "$0"
"#;

#[cfg(windows)]
const SWAP_TEMPLATE: &str = r#"# hostwatch update applier — generated file, removes itself when done
Start-Sleep -Seconds 2
# terminate: make sure the old agent released its binary
Stop-Process -Id __PID__ -Force -ErrorAction SilentlyContinue
# backup
Copy-Item -Path "__TARGET__" -Destination "__BACKUP__" -Force
# swap
Move-Item -Path "__STAGED__" -Destination "__TARGET__" -Force
# relaunch
$proc = Start-Process -FilePath "__TARGET__" -PassThru
Start-Sleep -Seconds 3
# verify-start
if ($proc -and -not $proc.HasExited) {
    # cleanup
    Remove-Item -Path "__BACKUP__" -Force
} else {
    # rollback
    Copy-Item -Path "__BACKUP__" -Destination "__TARGET__" -Force
    Start-Process -FilePath "__TARGET__"
}
Remove-Item -Path $MyInvocation.MyCommand.Path -Force
"#;

fn render_swap_script(target: &Path, staged: &Path, backup: &Path, pid: u32) -> String {
    SWAP_TEMPLATE
        .replace("__TARGET__", &target.display().to_string())
        .replace("__STAGED__", &staged.display().to_string())
        .replace("__BACKUP__", &backup.display().to_string())
        .replace("__PID__", &pid.to_string())
}

fn launch_swap_helper(staged: &Path) -> anyhow::Result<()> {
    let target = std::env::current_exe()?;
    let backup = target.with_extension("bak");
    let script = render_swap_script(&target, staged, &backup, std::process::id());

    #[cfg(windows)]
    {
        let script_path = exe_dir()?.join("apply_update.ps1");
        std::fs::write(&script_path, script)?;
        std::process::Command::new("powershell")
            .args([
                "-NoProfile",
                "-ExecutionPolicy",
                "Bypass",
                "-WindowStyle",
                "Hidden",
                "-File",
            ])
            .arg(&script_path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()?;
    }

    #[cfg(not(windows))]
    {
        use std::os::unix::fs::PermissionsExt;
        let script_path = exe_dir()?.join("apply_update.sh");
        std::fs::write(&script_path, script)?;
        std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))?;
        std::process::Command::new("sh")
            .arg(&script_path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged_file(content: &[u8]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STAGED_NAME);
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn matching_artifact_passes_both_gates() {
        let content = b"new agent binary";
        let (_dir, path) = staged_file(content);
        let hash = format!("{:x}", Sha256::digest(content));

        verify_or_discard(&path, content.len() as u64, &hash).unwrap();
        assert!(path.exists());

        // Digest casing from the server must not matter.
        verify_or_discard(&path, content.len() as u64, &hash.to_uppercase()).unwrap();
    }

    #[test]
    fn hash_mismatch_removes_the_artifact() {
        let content = b"new agent binary";
        let (_dir, path) = staged_file(content);

        let err = verify_or_discard(
            &path,
            content.len() as u64,
            "deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef",
        )
        .unwrap_err();
        assert!(err.to_string().contains("Hash mismatch"));
        assert!(!path.exists());
    }

    #[test]
    fn size_mismatch_removes_the_artifact() {
        let content = b"truncated download";
        let (_dir, path) = staged_file(content);
        let hash = format!("{:x}", Sha256::digest(content));

        let err = verify_or_discard(&path, content.len() as u64 + 1, &hash).unwrap_err();
        assert!(err.to_string().contains("Size mismatch"));
        assert!(!path.exists());
    }

    #[test]
    fn relative_download_urls_resolve_against_the_origin() {
        assert_eq!(
            resolve_download_url("https://monitor.example.org/api", "/api/agent/download?v=1.0")
                .unwrap(),
            "https://monitor.example.org/api/agent/download?v=1.0"
        );
        assert_eq!(
            resolve_download_url("https://a.example/api", "https://cdn.example/agent.bin").unwrap(),
            "https://cdn.example/agent.bin"
        );
    }

    #[test]
    fn swap_script_has_no_unfilled_placeholders() {
        let script = render_swap_script(
            Path::new("/opt/hostwatch/hostwatch"),
            Path::new("/opt/hostwatch/agent_update.tmp"),
            Path::new("/opt/hostwatch/hostwatch.bak"),
            4242,
        );
        assert!(!script.contains("__"));
        assert!(script.contains("4242"));
        assert!(script.contains("agent_update.tmp"));
    }

    #[tokio::test]
    async fn tick_respects_the_check_interval() {
        let mut mgr = UpdateManager::new(
            reqwest::Client::new(),
            "https://unreachable.invalid/api".into(),
            "0.3.2".into(),
        );
        mgr.last_check = Some(Instant::now());
        // Inside the interval: no network traffic, immediate false.
        assert!(!mgr.tick().await);
    }
}
