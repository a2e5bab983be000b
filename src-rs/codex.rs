use crate::error::GatewayError;
use crate::util::{command_exists, truncate_text};
use log::debug;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// A `codex exec` invocation: prompt on stdin, images attached, last message
/// written to a file.
#[derive(Debug, Clone)]
pub struct CodexExec {
    pub bin: String,
    pub model: Option<String>,
    pub prompt: String,
    pub images: Vec<PathBuf>,
    pub timeout: Duration,
}

pub fn resolve_codex_executable(override_bin: Option<&str>) -> Option<String> {
    if let Some(bin) = override_bin {
        let trimmed = bin.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }
    if let Ok(bin) = env::var("SKETCH_LOOP_CODEX") {
        if !bin.trim().is_empty() {
            return Some(bin.trim().to_string());
        }
    }
    if command_exists("codex") {
        return Some("codex".to_string());
    }
    None
}

impl CodexExec {
    /// Runs the command to completion. The child is killed if it outlives
    /// `timeout` or if this future is dropped first.
    pub async fn run(&self) -> Result<String, GatewayError> {
        let scratch = tempfile::tempdir().map_err(|err| GatewayError::Io(err.to_string()))?;
        let report_path = scratch.path().join("last-message.txt");
        let command_label = format!("{} exec", self.bin);

        let mut cmd = Command::new(&self.bin);
        cmd.arg("exec").arg("--output-last-message").arg(&report_path);
        for image in &self.images {
            cmd.arg("--image").arg(image);
        }
        if let Some(model) = &self.model {
            cmd.arg("--model").arg(model);
        }
        cmd.arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!(
            "running {command_label} with {} image(s)",
            self.images.len()
        );

        let mut child = cmd.spawn().map_err(|err| GatewayError::Spawn {
            command: command_label.clone(),
            reason: err.to_string(),
        })?;
        let stdin = child.stdin.take();

        let timeout = self.timeout.max(Duration::from_secs(1));
        let finished = tokio::time::timeout(timeout, async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(self.prompt.as_bytes()).await.map_err(|err| {
                    GatewayError::Io(format!("failed to send prompt to codex exec: {err}"))
                })?;
            }
            // both pipes are drained while waiting
            child
                .wait_with_output()
                .await
                .map_err(|err| GatewayError::Io(format!("failed to read codex exec output: {err}")))
        })
        .await;
        let output = match finished {
            Ok(output) => output?,
            Err(_) => {
                return Err(GatewayError::Timeout {
                    command: command_label,
                    after: timeout,
                })
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(GatewayError::Exit {
                command: command_label,
                code: output.status.code().unwrap_or(1),
                stderr: truncate_text(stderr.trim(), 2400),
            });
        }

        let reply = read_report(&report_path)
            .unwrap_or_else(|| String::from_utf8_lossy(&output.stdout).to_string());
        if reply.trim().is_empty() {
            return Err(GatewayError::EmptyReply);
        }
        Ok(reply)
    }
}

fn read_report(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .filter(|text| !text.trim().is_empty())
}
