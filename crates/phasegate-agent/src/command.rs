use crate::agent::{Agent, AgentContext, AgentDescriptor};
use async_trait::async_trait;
use phasegate_core::{Finding, PhasegateError, PhasegateResult};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Agent backed by an external program.
///
/// The [`AgentContext`] is written as JSON to the program's stdin. The
/// program must print a JSON array of findings on stdout (empty output means
/// no findings) and exit with status 0. Anything else is an execution error.
pub struct CommandAgent {
    descriptor: AgentDescriptor,
    program: String,
    args: Vec<String>,
}

impl CommandAgent {
    /// Agent running `program` with `args`.
    pub fn new(descriptor: AgentDescriptor, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            descriptor,
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl Agent for CommandAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, ctx: &AgentContext) -> PhasegateResult<Vec<Finding>> {
        let input = serde_json::to_vec(ctx)?;

        tracing::info!(
            agent = %self.descriptor.id,
            program = %self.program,
            work_item = %ctx.work_item_id,
            phase = %ctx.phase,
            "Spawning agent process"
        );

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PhasegateError::Execution(format!(
                    "Failed to spawn agent '{}' ({}): {e}",
                    self.descriptor.id, self.program
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A program that ignores its input may close stdin early.
            if let Err(e) = stdin.write_all(&input).await {
                tracing::debug!(agent = %self.descriptor.id, error = %e, "Agent closed stdin");
            }
        }

        let output = child.wait_with_output().await.map_err(|e| {
            PhasegateError::Execution(format!("Agent '{}' failed: {e}", self.descriptor.id))
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Err(PhasegateError::Execution(format!(
                "Agent '{}' exited with code {}: {}",
                self.descriptor.id,
                output.status.code().unwrap_or(-1),
                truncate_output(stderr.trim_end(), 500)
            )));
        }

        parse_findings(&self.descriptor.id, &stdout)
    }
}

fn parse_findings(agent: &str, stdout: &str) -> PhasegateResult<Vec<Finding>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(trimmed).map_err(|e| {
        PhasegateError::Execution(format!(
            "Agent '{agent}' produced malformed output ({e}): {}",
            truncate_output(trimmed, 200)
        ))
    })
}

/// Longest prefix of `text` within `max_bytes` that ends on a char boundary.
fn truncate_output(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use phasegate_core::{CapabilitySet, Severity};
    use uuid::Uuid;

    fn ctx() -> AgentContext {
        AgentContext {
            work_item_id: Uuid::new_v4(),
            title: "Add login".into(),
            description: "OAuth flow".into(),
            phase: "review".into(),
            phase_index: 0,
            attempt: 1,
            capabilities: CapabilitySet::new(),
            prior_findings: vec![],
        }
    }

    fn sh(id: &str, script: &str) -> CommandAgent {
        CommandAgent::new(
            AgentDescriptor::new(id, CapabilitySet::new()),
            "sh",
            vec!["-c".to_string(), script.to_string()],
        )
    }

    #[test]
    fn test_parse_empty_output_is_clean() {
        assert!(parse_findings("a", "  \n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_malformed_output_is_execution_error() {
        let err = parse_findings("a", "LGTM!").unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_truncate_output_stops_on_char_boundary() {
        let text = format!("a{}", "é".repeat(300));
        let cut = truncate_output(&text, 500);
        assert_eq!(cut.len(), 499);
        assert!(cut.ends_with('é'));
        assert_eq!(truncate_output("short", 500), "short");
    }

    #[test]
    fn test_parse_malformed_multibyte_output() {
        let stdout = format!("a{}", "ü".repeat(150));
        let err = parse_findings("a", &stdout).unwrap_err();
        assert!(err.to_string().contains("malformed output"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_with_multibyte_stderr() {
        let agent = sh(
            "accented",
            r#"cat >/dev/null; { printf 'a'; i=0; while [ $i -lt 300 ]; do printf 'é'; i=$((i+1)); done; } >&2; exit 1"#,
        );
        let err = agent.invoke(&ctx()).await.unwrap_err();
        assert!(matches!(err, PhasegateError::Execution(_)));
        assert!(err.to_string().contains("code 1"));
    }

    #[tokio::test]
    async fn test_command_agent_reports_findings() {
        let agent = sh(
            "reviewer",
            r#"cat >/dev/null; echo '[{"severity":"HIGH","message":"no tests"}]'"#,
        );
        let findings = agent.invoke(&ctx()).await.unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::High);
    }

    #[tokio::test]
    async fn test_command_agent_receives_context_on_stdin() {
        let agent = sh(
            "echoer",
            r#"grep -q '"phase":"review"' && echo '[]' || exit 3"#,
        );
        assert!(agent.invoke(&ctx()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_command_agent_nonzero_exit_is_execution_error() {
        let agent = sh("broken", "echo boom >&2; exit 7");
        let err = agent.invoke(&ctx()).await.unwrap_err();
        assert!(matches!(err, PhasegateError::Execution(_)));
        assert!(err.to_string().contains("code 7"));
    }

    #[tokio::test]
    async fn test_missing_program_is_execution_error() {
        let agent = CommandAgent::new(
            AgentDescriptor::new("ghost", CapabilitySet::new()),
            "/nonexistent/phasegate-agent",
            vec![],
        );
        let err = agent.invoke(&ctx()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
