//! CLI error handling with user-friendly messages.
//!
//! Every command returns `Result<(), CliError>`; `main` turns the error into
//! a message on stderr and an exit code.

use std::fmt;
use std::process;

use imagepipe::config::ConfigFileError;
use imagepipe::pipeline::PipelineBuildError;
use imagepipe::producer::PipelineError;
use imagepipe::request::RequestError;

/// CLI-specific errors with user-friendly messages.
#[derive(Debug)]
pub enum CliError {
    /// Failed to initialize logging
    LoggingInit(String),
    /// Configuration error
    Config(String),
    /// The async runtime could not be started
    Runtime(std::io::Error),
    /// Failed to assemble the pipeline
    PipelineCreation(PipelineBuildError),
    /// The argument is not a loadable image URI
    InvalidUri(RequestError),
    /// The request failed inside the pipeline
    Request(PipelineError),
    /// The request ended without a result
    Cancelled,
    /// Some requests of a batch failed
    PartialFailure { failed: usize, total: usize },
    /// Failed to write output file
    FileWrite { path: String, error: std::io::Error },
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) | CliError::InvalidUri(_) => 2,
            CliError::Request(_) | CliError::Cancelled | CliError::PartialFailure { .. } => 3,
            _ => 1,
        }
    }

    /// Exit the process with an appropriate error message and code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        match self {
            CliError::Config(_) => {
                eprintln!();
                eprintln!(
                    "Check {} or run 'imagepipe config init' to write the defaults.",
                    imagepipe::config::config_file_path().display()
                );
            }
            CliError::InvalidUri(_) => {
                eprintln!();
                eprintln!("Supported sources: http(s)://, file://, data: URIs and absolute paths.");
            }
            _ => {}
        }

        process::exit(self.exit_code())
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::LoggingInit(msg) => write!(f, "Failed to initialize logging: {}", msg),
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::Runtime(e) => write!(f, "Failed to start async runtime: {}", e),
            CliError::PipelineCreation(e) => write!(f, "Failed to create pipeline: {}", e),
            CliError::InvalidUri(e) => write!(f, "{}", e),
            CliError::Request(e) => write!(f, "Request failed: {}", e),
            CliError::Cancelled => write!(f, "Request was cancelled"),
            CliError::PartialFailure { failed, total } => {
                write!(f, "{} of {} requests failed", failed, total)
            }
            CliError::FileWrite { path, error } => {
                write!(f, "Failed to write file '{}': {}", path, error)
            }
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Runtime(e) => Some(e),
            CliError::PipelineCreation(e) => Some(e),
            CliError::InvalidUri(e) => Some(e),
            CliError::Request(e) => Some(e),
            CliError::FileWrite { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl From<ConfigFileError> for CliError {
    fn from(e: ConfigFileError) -> Self {
        CliError::Config(e.to_string())
    }
}

impl From<PipelineBuildError> for CliError {
    fn from(e: PipelineBuildError) -> Self {
        CliError::PipelineCreation(e)
    }
}

impl From<RequestError> for CliError {
    fn from(e: RequestError) -> Self {
        CliError::InvalidUri(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_separate_usage_from_request_failures() {
        assert_eq!(CliError::Config("bad".into()).exit_code(), 2);
        assert_eq!(CliError::Cancelled.exit_code(), 3);
        assert_eq!(CliError::LoggingInit("x".into()).exit_code(), 1);
    }

    #[test]
    fn test_invalid_uri_message_names_the_input() {
        let err: CliError = imagepipe::ImageRequest::from_uri("nope://x").unwrap_err().into();
        assert!(err.to_string().contains("nope"));
    }
}
