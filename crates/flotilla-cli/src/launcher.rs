//! Process-based agent launcher.
//!
//! Runs the configured agent program with the invocation prompt as its
//! final argument, the item's working tree as the process cwd, and
//! `FLOTILLA_OUTPUT_FILE` pointing at the expected artifact. Agent-side
//! failures (non-zero exit, timeout, missing artifact) come back as failed
//! [`AgentResult`]s; only spawn problems are errors.
//!
//! Token accounting: the agent reports usage as a JSON object on the last
//! non-empty stdout line, e.g. `{"input_tokens": 120, "output_tokens": 80}`.
//! A missing or unparsable line simply means no usage is recorded.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use flotilla_core::traits::{AgentInvocation, AgentLauncher, AgentResult, AgentTokenUsage};

const OUTPUT_FILE_ENV: &str = "FLOTILLA_OUTPUT_FILE";

#[derive(Debug, Deserialize)]
struct UsageLine {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Launches agent processes via a configured command line.
pub struct CommandAgentLauncher {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandAgentLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    fn parse_usage(stdout: &str) -> Option<AgentTokenUsage> {
        let line = stdout.lines().rev().find(|l| !l.trim().is_empty())?;
        let usage: UsageLine = serde_json::from_str(line.trim()).ok()?;
        Some(AgentTokenUsage {
            input: usage.input_tokens,
            output: usage.output_tokens,
        })
    }
}

#[async_trait]
impl AgentLauncher for CommandAgentLauncher {
    async fn launch_agent(
        &self,
        invocation: &AgentInvocation,
        workdir: &Path,
    ) -> Result<AgentResult> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(&invocation.prompt)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(output_file) = &invocation.output_file {
            command.env(OUTPUT_FILE_ENV, output_file);
        }

        debug!(purpose = %invocation.purpose, program = %self.program, "launching agent");
        let child = command
            .spawn()
            .with_context(|| format!("could not spawn agent program '{}'", self.program))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output.context("agent process could not be awaited")?,
            Err(_) => {
                warn!(
                    purpose = %invocation.purpose,
                    timeout_secs = self.timeout.as_secs(),
                    "agent timed out"
                );
                return Ok(AgentResult {
                    success: false,
                    exit_code: -1,
                    timed_out: true,
                    output_exists: false,
                    token_usage: None,
                    error: Some(format!(
                        "agent timed out after {}s",
                        self.timeout.as_secs()
                    )),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);
        let success = output.status.success();

        let output_exists = match &invocation.output_file {
            Some(file) => workdir.join(file).exists(),
            None => true,
        };

        Ok(AgentResult {
            success,
            exit_code,
            timed_out: false,
            output_exists,
            token_usage: Self::parse_usage(&stdout),
            error: if success {
                None
            } else {
                // Keep only the tail of stderr; agent logs can be huge.
                let skip = stderr.chars().count().saturating_sub(500);
                let tail: String = stderr.chars().skip(skip).collect();
                Some(format!("agent exited with code {exit_code}: {}", tail.trim()))
            },
        })
    }
}
