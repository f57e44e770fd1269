// ─────────────────────────────────────────────────────────────────
//  commands.rs — Persistent duplex channel to the collector
//
//  Receives `exec_command` frames, runs each command on its own task
//  with a hard timeout, and reports `command_result` frames back.
//  Reconnection happens at most once per main-loop cycle.
// ─────────────────────────────────────────────────────────────────

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};
use url::Url;

use crate::models::{CommandRequest, CommandResult, CommandStatus, WsEnvelope};

/// Hard cap on remote command runtime.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

pub struct CommandChannel {
    endpoint: String,
    connected: Arc<AtomicBool>,
    connecting: Arc<AtomicBool>,
}

impl CommandChannel {
    pub fn new(api_url: &str, machine_id: &str) -> anyhow::Result<Self> {
        Ok(Self {
            endpoint: channel_url(api_url, machine_id)?,
            connected: Arc::new(AtomicBool::new(false)),
            connecting: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Called once per main-loop cycle. Spawns at most one connection task;
    /// a lost connection is noticed here and retried on the next cycle —
    /// never in a tight loop.
    pub fn ensure_connected(&self) {
        if self.connected.load(Ordering::Relaxed) || self.connecting.swap(true, Ordering::AcqRel) {
            return;
        }

        let endpoint = self.endpoint.clone();
        let connected = self.connected.clone();
        let connecting = self.connecting.clone();
        tokio::spawn(async move {
            match run_connection(&endpoint, &connected).await {
                Ok(()) => warn!("Command channel closed — reconnecting next cycle"),
                Err(e) => warn!("Command channel error: {e} — reconnecting next cycle"),
            }
            connected.store(false, Ordering::Relaxed);
            connecting.store(false, Ordering::Release);
        });
    }
}

/// The socket lives at the collector's origin (not under `/api`), tagged
/// with our role and machine id as connection metadata.
fn channel_url(api_url: &str, machine_id: &str) -> anyhow::Result<String> {
    let mut url = Url::parse(api_url)?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => anyhow::bail!("Cannot derive websocket endpoint from scheme {other}"),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("Cannot derive websocket endpoint from {api_url}"))?;
    url.set_path("/");
    url.query_pairs_mut()
        .clear()
        .append_pair("role", "agent")
        .append_pair("id", machine_id);
    Ok(url.to_string())
}

async fn run_connection(endpoint: &str, connected: &Arc<AtomicBool>) -> anyhow::Result<()> {
    let (ws, _response) = connect_async(endpoint).await?;
    info!("Command channel connected");
    connected.store(true, Ordering::Relaxed);

    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::channel::<CommandResult>(16);

    loop {
        tokio::select! {
            Some(result) = rx.recv() => {
                let frame = serde_json::json!({ "event": "command_result", "data": result });
                write.send(Message::Text(frame.to_string())).await?;
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => dispatch_frame(&text, tx.clone()),
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }
        }
    }
}

/// Parse an inbound frame and, for a well-formed `exec_command`, run it on
/// its own task so the sampling loop is never blocked. Frames missing id or
/// command are dropped silently.
fn dispatch_frame(text: &str, tx: mpsc::Sender<CommandResult>) {
    let Ok(envelope) = serde_json::from_str::<WsEnvelope>(text) else {
        return;
    };
    if envelope.event != "exec_command" {
        return;
    }
    let Ok(request) = serde_json::from_value::<CommandRequest>(envelope.data) else {
        return;
    };
    let (Some(id), Some(command)) = (request.id, request.command) else {
        return;
    };

    tokio::spawn(async move {
        let result = execute(id, command, COMMAND_TIMEOUT).await;
        let _ = tx.send(result).await;
    });
}

async fn execute(id: String, command: String, timeout: Duration) -> CommandResult {
    info!("Executing remote command (ID: {id})");

    let mut cmd = shell_command(&command);
    cmd.stdin(Stdio::null()).kill_on_drop(true);

    let (output, status) = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(out)) => {
            let mut merged = String::from_utf8_lossy(&out.stdout).into_owned();
            merged.push_str(&String::from_utf8_lossy(&out.stderr));
            let status = if out.status.success() {
                CommandStatus::Completed
            } else {
                CommandStatus::Failed
            };
            (merged, status)
        }
        Ok(Err(e)) => (
            format!("[Error] Execution failed: {e}"),
            CommandStatus::Failed,
        ),
        Err(_) => (
            format!(
                "[Error] Command timed out after {} seconds.",
                timeout.as_secs()
            ),
            CommandStatus::Failed,
        ),
    };

    let output = if output.trim().is_empty() {
        "[No Output]".to_string()
    } else {
        output
    };

    CommandResult { id, output, status }
}

fn shell_command(command: &str) -> tokio::process::Command {
    if cfg!(windows) {
        let mut c = tokio::process::Command::new("cmd");
        c.args(["/C", command]);
        c
    } else {
        let mut c = tokio::process::Command::new("sh");
        c.args(["-c", command]);
        c
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_url_targets_origin_with_agent_metadata() {
        let url = channel_url("https://monitor.example.org/api", "pc-1").unwrap();
        assert_eq!(url, "wss://monitor.example.org/?role=agent&id=pc-1");

        let url = channel_url("http://10.0.0.5:3001/api", "lab pc").unwrap();
        assert_eq!(url, "ws://10.0.0.5:3001/?role=agent&id=lab+pc");
    }

    #[tokio::test]
    async fn execute_merges_output_and_reports_completed() {
        let result = execute("c1".into(), "echo hello".into(), Duration::from_secs(5)).await;
        assert_eq!(result.id, "c1");
        assert_eq!(result.status, CommandStatus::Completed);
        assert!(result.output.contains("hello"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn empty_output_gets_a_placeholder() {
        let result = execute("c2".into(), "true".into(), Duration::from_secs(5)).await;
        assert_eq!(result.output, "[No Output]");
        assert_eq!(result.status, CommandStatus::Completed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_reports_failed_status() {
        let result = execute("c3".into(), "exit 3".into(), Duration::from_secs(5)).await;
        assert_eq!(result.status, CommandStatus::Failed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runaway_command_hits_the_timeout() {
        let result = execute("c4".into(), "sleep 30".into(), Duration::from_millis(300)).await;
        assert_eq!(result.status, CommandStatus::Failed);
        assert!(result.output.contains("timed out"));
    }

    #[tokio::test]
    async fn well_formed_frame_produces_a_result() {
        let (tx, mut rx) = mpsc::channel(4);
        dispatch_frame(
            r#"{"event":"exec_command","data":{"id":"c5","command":"echo ok"}}"#,
            tx,
        );
        let result = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("command should finish")
            .expect("result expected");
        assert_eq!(result.id, "c5");
    }

    #[tokio::test]
    async fn malformed_frames_are_silently_ignored() {
        let (tx, mut rx) = mpsc::channel(4);
        dispatch_frame("not json", tx.clone());
        dispatch_frame(r#"{"event":"exec_command","data":{"command":"echo x"}}"#, tx.clone());
        dispatch_frame(r#"{"event":"exec_command","data":{"id":"c6"}}"#, tx.clone());
        dispatch_frame(r#"{"event":"something_else","data":{}}"#, tx);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }
}
