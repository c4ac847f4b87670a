//! Job processor that runs an external command
//!
//! The job is written to the command's stdin as JSON. The command's stdout
//! is parsed as the result data (empty output means `null`) and a non-zero
//! exit becomes a job failure carrying its stderr.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use futures_util::future::{join, BoxFuture};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use trackrelay_dispatch::{Job, JobProcessor};

use crate::config::CommandConfig;
use crate::error::{WorkerError, WorkerResult};

/// Longest stderr excerpt carried into a failure message
const MAX_STDERR_CHARS: usize = 2000;

#[derive(Debug, Clone)]
pub struct CommandProcessor {
    inner: Arc<CommandSpec>,
}

#[derive(Debug)]
struct CommandSpec {
    program: String,
    args: Vec<String>,
    working_dir: PathBuf,
}

impl CommandProcessor {
    pub fn new(command: &CommandConfig, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(CommandSpec {
                program: command.program.clone(),
                args: command.args.clone(),
                working_dir: working_dir.into(),
            }),
        }
    }

    pub fn program(&self) -> &str {
        &self.inner.program
    }
}

impl CommandSpec {
    async fn run(&self, job: Job<Value>) -> WorkerResult<Value> {
        let input = serde_json::to_vec(&job)?;

        // kill_on_drop: a job cut off by the loop's timeout must not leave
        // the command running
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .env("TRACKRELAY_JOB_ID", &job.id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WorkerError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // Fed while output is collected so a command that writes as it
        // reads cannot fill its stdout pipe and stall
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A command that ignores its input may close stdin early
                if let Err(e) = stdin.write_all(&input).await {
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        return Err(e);
                    }
                }
            }
            Ok(())
        };

        let (fed, output) = join(feed, child.wait_with_output()).await;
        let output = output?;
        fed?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorkerError::CommandFailed {
                code: output.status.code(),
                stderr: tail(&stderr, MAX_STDERR_CHARS).to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(stdout)?)
    }
}

/// The last `max` characters of `text`
fn tail(text: &str, max: usize) -> &str {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max {
        return trimmed;
    }
    let skip = trimmed
        .char_indices()
        .nth(count - max)
        .map(|(index, _)| index)
        .unwrap_or(0);
    &trimmed[skip..]
}

impl JobProcessor<Value, Value> for CommandProcessor {
    fn process(&self, job: Job<Value>) -> BoxFuture<'static, anyhow::Result<Value>> {
        let spec = Arc::clone(&self.inner);
        Box::pin(async move {
            spec.run(job).await.map_err(|err| {
                err.log();
                anyhow::Error::new(err)
            })
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::time::Duration;

    fn shell(script: &str) -> CommandProcessor {
        let command = CommandConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        };
        CommandProcessor::new(&command, std::env::temp_dir())
    }

    #[tokio::test]
    async fn test_job_json_goes_to_stdin() {
        let job = Job::new(json!({"url": "https://soundcloud.com/a/b"})).with_priority(2);
        let echoed = shell("cat").inner.run(job.clone()).await.unwrap();

        assert_eq!(echoed["id"], json!(job.id));
        assert_eq!(echoed["payload"]["url"], "https://soundcloud.com/a/b");
        assert_eq!(echoed["priority"], 2);
    }

    #[tokio::test]
    async fn test_large_job_streams_through_echoing_command() {
        let blob = "x".repeat(1024 * 1024 + 1);
        let job = Job::new(json!({ "blob": blob.clone() }));

        let echoed = tokio::time::timeout(Duration::from_secs(30), shell("cat").inner.run(job))
            .await
            .expect("command stalled on a large job")
            .unwrap();
        assert_eq!(echoed["payload"]["blob"].as_str().map(str::len), Some(blob.len()));
    }

    #[tokio::test]
    async fn test_job_id_is_in_environment() {
        let job = Job::new(json!({}));
        let value = shell(r#"cat >/dev/null; printf '"%s"' "$TRACKRELAY_JOB_ID""#)
            .inner
            .run(job.clone())
            .await
            .unwrap();
        assert_eq!(value, json!(job.id));
    }

    #[tokio::test]
    async fn test_empty_output_is_null() {
        let value = shell("cat >/dev/null").inner.run(Job::new(json!({}))).await.unwrap();
        assert_eq!(value, Value::Null);
    }

    #[tokio::test]
    async fn test_non_zero_exit_carries_stderr() {
        let err = shell("echo FILE_TOO_LARGE >&2; exit 3")
            .inner
            .run(Job::new(json!({})))
            .await
            .unwrap_err();
        assert_matches!(
            err,
            WorkerError::CommandFailed { code: Some(3), ref stderr } if stderr == "FILE_TOO_LARGE"
        );
    }

    #[tokio::test]
    async fn test_invalid_output() {
        let err = shell("echo not-json")
            .inner
            .run(Job::new(json!({})))
            .await
            .unwrap_err();
        assert_matches!(err, WorkerError::InvalidOutput(_));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let command = CommandConfig {
            program: "/nonexistent/trackrelay-fetch".to_string(),
            args: Vec::new(),
        };
        let processor = CommandProcessor::new(&command, std::env::temp_dir());
        let err = processor.process(Job::new(json!({}))).await.unwrap_err();
        assert!(err.to_string().contains("failed to start"));
    }

    #[test]
    fn test_tail_keeps_the_end() {
        assert_eq!(tail("  short  ", 10), "short");
        assert_eq!(tail("abcdefgh", 3), "fgh");
        assert_eq!(tail("ééééé", 2), "éé");
    }
}
