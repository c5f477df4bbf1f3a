use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use watchpost_common::error::CheckError;
use watchpost_common::traits::NotificationTransport;

use crate::format::mask_url;

/// Delivers notifications through the `apprise` CLI.
///
/// Runs `<program> <base_args...> -b <body> <url>`; by default
/// `uvx apprise -b <body> <url>`. The child is killed if the send future is
/// dropped, so a caller-side timeout also stops the process.
pub struct AppriseTransport {
    program: String,
    base_args: Vec<String>,
}

impl AppriseTransport {
    pub fn new(program: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            base_args,
        }
    }
}

impl Default for AppriseTransport {
    fn default() -> Self {
        Self::new("uvx", vec!["apprise".to_string()])
    }
}

#[async_trait]
impl NotificationTransport for AppriseTransport {
    async fn send(&self, destination_url: &str, body: &str) -> Result<(), CheckError> {
        let masked = mask_url(destination_url);

        let output = Command::new(&self.program)
            .args(&self.base_args)
            .arg("-b")
            .arg(body)
            .arg(destination_url)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                CheckError::transport(masked.clone(), format!("failed to start {}: {}", self.program, e))
            })?;

        if output.status.success() {
            tracing::debug!(destination = %masked, "Notification delivered");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = match stderr.trim() {
            "" => format!("apprise exited with {}", output.status),
            trimmed => trimmed.to_string(),
        };
        Err(CheckError::transport(masked, reason))
    }
}
