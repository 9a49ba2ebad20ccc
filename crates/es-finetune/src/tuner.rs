//! The fine-tuning seam and its trainer-command implementation.

use async_trait::async_trait;
use es_types::{FineTuneError, TrainerConfig};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use crate::request::FineTuneRequest;

/// Lines of trainer stderr kept in an [`FineTuneError::ExitStatus`].
const STDERR_TAIL_LINES: usize = 20;

/// Runs one fine-tuning job and returns its evaluation score.
///
/// Implementations write the model to `request.save_path`. They are never
/// retried: an error fails the trial.
#[async_trait]
pub trait FineTuner: Send + Sync {
    async fn finetune(&self, request: &FineTuneRequest) -> Result<f64, FineTuneError>;
}

/// Launches an external trainer program per request.
///
/// The request is passed as flags after the configured arguments. The last
/// non-empty line on stdout must be the score.
#[derive(Debug, Clone)]
pub struct CommandFineTuner {
    program: String,
    args: Vec<String>,
}

impl CommandFineTuner {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(config: &TrainerConfig) -> Self {
        Self::new(config.program.clone(), config.args.iter().cloned())
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

/// Score from trainer stdout: the last non-empty line.
pub fn parse_score(stdout: &str) -> Result<f64, FineTuneError> {
    let last = stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .ok_or_else(|| FineTuneError::InvalidScore {
            output: "<empty>".to_string(),
        })?;
    last.parse::<f64>().map_err(|_| FineTuneError::InvalidScore {
        output: last.to_string(),
    })
}

#[async_trait]
impl FineTuner for CommandFineTuner {
    async fn finetune(&self, request: &FineTuneRequest) -> Result<f64, FineTuneError> {
        tokio::fs::create_dir_all(&request.save_path)
            .await
            .map_err(|e| FineTuneError::ArtifactWrite {
                path: request.save_path.display().to_string(),
                message: e.to_string(),
            })?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .args(request.cli_args())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        debug!("Launching {:?}", command);

        let output = command
            .output()
            .await
            .map_err(|e| FineTuneError::LaunchFailed {
                program: self.program.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(FineTuneError::ExitStatus {
                code: output.status.code(),
                stderr: tail(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL_LINES),
            });
        }

        let score = parse_score(&String::from_utf8_lossy(&output.stdout))?;
        info!(
            "Fine-tuned {} into {} (score {:.6})",
            request.model_id,
            request.save_path.display(),
            score
        );
        Ok(score)
    }
}
