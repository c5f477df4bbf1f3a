use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use watchpost_common::error::CheckError;
use watchpost_common::traits::SelectorRecovery;
use watchpost_common::types::CssSelectors;

use crate::css::validate_selector;

/// Re-derives selectors by running an external command.
///
/// The page URL is appended as the last argument. The command must print a
/// JSON object `{"item": .., "title": .., "link": ..}` on stdout.
pub struct CommandRecovery {
    program: String,
    args: Vec<String>,
}

impl CommandRecovery {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from a whitespace-separated command line. `None` if it is blank.
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }
}

#[async_trait]
impl SelectorRecovery for CommandRecovery {
    async fn recover(&self, url: &str) -> Result<CssSelectors, CheckError> {
        tracing::info!(url, program = %self.program, "Running selector recovery");

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(url)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CheckError::recovery(url, format!("failed to start {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = match stderr.trim() {
                "" => format!("{} exited with {}", self.program, output.status),
                trimmed => trimmed.to_string(),
            };
            return Err(CheckError::recovery(url, reason));
        }

        parse_selectors(&String::from_utf8_lossy(&output.stdout))
            .map_err(|reason| CheckError::recovery(url, reason))
    }
}

/// Recovery used when no command is configured.
pub struct DisabledRecovery;

#[async_trait]
impl SelectorRecovery for DisabledRecovery {
    async fn recover(&self, url: &str) -> Result<CssSelectors, CheckError> {
        Err(CheckError::recovery(url, "no recovery command configured"))
    }
}

/// Parse and validate the selector JSON printed by a recovery command.
pub fn parse_selectors(stdout: &str) -> Result<CssSelectors, String> {
    let selectors: CssSelectors = serde_json::from_str(stdout.trim())
        .map_err(|e| format!("invalid recovery output: {e}"))?;

    for (field, value) in [
        ("item", &selectors.item),
        ("title", &selectors.title),
        ("link", &selectors.link),
    ] {
        if value.trim().is_empty() {
            return Err(format!("recovered {field} selector is empty"));
        }
        validate_selector(value)?;
    }

    Ok(selectors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_command_line() {
        assert!(CommandRecovery::from_command_line("   ").is_none());

        let recovery = CommandRecovery::from_command_line("node identify.js --fast").unwrap();
        assert_eq!(recovery.program, "node");
        assert_eq!(recovery.args, vec!["identify.js", "--fast"]);
    }

    #[test]
    fn test_parse_selectors() {
        let selectors =
            parse_selectors(r#" {"item": "li.post", "title": "h3", "link": "a.permalink"} "#).unwrap();
        assert_eq!(selectors.item, "li.post");
        assert_eq!(selectors.link, "a.permalink");

        assert!(parse_selectors("not json").is_err());
        assert!(parse_selectors(r#"{"item": "li", "title": "", "link": "a"}"#).is_err());
        assert!(parse_selectors(r#"{"item": "li[", "title": "h3", "link": "a"}"#).is_err());
    }

    #[tokio::test]
    async fn test_disabled_recovery_fails() {
        let err = DisabledRecovery.recover("https://example.com").await.unwrap_err();
        assert!(matches!(err, CheckError::Recovery { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_recovery_reads_stdout() {
        let script = r#"[ "$1" = https://example.com/news ] && echo '{"item":"article","title":"h2","link":"a"}'"#;
        let recovery = CommandRecovery::new(
            "sh",
            vec!["-c".to_string(), script.to_string(), "sh".to_string()],
        );

        let selectors = recovery.recover("https://example.com/news").await.unwrap();
        assert_eq!(selectors.item, "article");
        assert_eq!(selectors.title, "h2");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_recovery_failure_carries_stderr() {
        let recovery = CommandRecovery::new(
            "sh",
            vec!["-c".to_string(), "echo 'browser missing' >&2; exit 1".to_string(), "sh".to_string()],
        );

        let err = recovery.recover("https://example.com").await.unwrap_err();
        assert!(err.to_string().contains("browser missing"));
    }
}
