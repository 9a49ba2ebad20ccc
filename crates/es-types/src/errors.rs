use thiserror::Error;

/// Main error type for the EmbedSweep system
#[derive(Error, Debug)]
pub enum SweepError {
    #[error("Study error: {0}")]
    Study(#[from] StudyError),

    #[error("Fine-tune error: {0}")]
    FineTune(#[from] FineTuneError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Study and journal errors
#[derive(Error, Debug)]
pub enum StudyError {
    #[error("Study already exists: {name}")]
    DuplicatedStudy { name: String },

    #[error("Study not found: {name}")]
    StudyNotFound { name: String },

    #[error("Trial not found: {trial_id}")]
    TrialNotFound { trial_id: usize },

    #[error("Trial {trial_id} is already finished and cannot be modified")]
    TrialFinished { trial_id: usize },

    #[error("Invalid distribution for parameter {name}: {message}")]
    InvalidDistribution { name: String, message: String },

    #[error("Parameter {name} was already suggested with a different distribution")]
    IncompatibleDistribution { name: String },

    #[error("Journal corrupted at line {line}: {message}")]
    JournalCorrupted { line: usize, message: String },

    #[error("Failed to acquire journal lock {path}: {message}")]
    LockFailed { path: String, message: String },
}

/// Errors raised by the external fine-tuning routine
#[derive(Error, Debug)]
pub enum FineTuneError {
    #[error("Failed to launch trainer {program}: {message}")]
    LaunchFailed { program: String, message: String },

    #[error("Trainer exited with status {code:?}: {stderr}")]
    ExitStatus { code: Option<i32>, stderr: String },

    #[error("Trainer produced no usable score: {output}")]
    InvalidScore { output: String },

    #[error("Failed to write artifact {path}: {message}")]
    ArtifactWrite { path: String, message: String },

    #[error("Failed to read artifact {path}: {message}")]
    ArtifactRead { path: String, message: String },
}

/// Execution platform errors
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Function {function} timed out after {timeout_secs} seconds")]
    Timeout { function: String, timeout_secs: u64 },

    #[error("Function {function} crashed: {message}")]
    Crashed { function: String, message: String },

    #[error("No mount covers container path {path}")]
    MountNotFound { path: String },

    #[error("Failed to commit volume {volume}: {message}")]
    VolumeCommit { volume: String, message: String },

    #[error("Invalid function configuration for {function}: {message}")]
    InvalidFunction { function: String, message: String },
}

/// Result type alias for EmbedSweep operations
pub type SweepResult<T> = Result<T, SweepError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::SweepError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::SweepError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::SweepError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = StudyError::DuplicatedStudy {
            name: "sentence-transformers-ft study".to_string(),
        };

        assert!(error.to_string().contains("already exists"));
        assert!(error.to_string().contains("sentence-transformers-ft study"));
    }

    #[test]
    fn test_error_conversion() {
        let platform_error = PlatformError::Timeout {
            function: "run_worker".to_string(),
            timeout_secs: 15000,
        };
        let sweep_error: SweepError = platform_error.into();

        match sweep_error {
            SweepError::Platform(PlatformError::Timeout { timeout_secs, .. }) => {
                assert_eq!(timeout_secs, 15000)
            }
            _ => panic!("Expected Platform error"),
        }
    }

    #[test]
    fn test_macros() {
        let validation_err = validation_error!("Invalid value: {}", 42);
        assert!(matches!(validation_err, SweepError::Validation(_)));
        let internal_err = internal_error!("Something went wrong");
        assert!(matches!(internal_err, SweepError::Internal(_)));
        let config_err = config_error!("Missing required field: {}", "study_name");
        assert_eq!(
            config_err.to_string(),
            "Configuration error: Missing required field: study_name"
        );
    }
}
