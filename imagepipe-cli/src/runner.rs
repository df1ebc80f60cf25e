//! CLI runner for common setup.
//!
//! Loads the config file, starts logging and owns the tokio runtime the
//! pipeline runs on, so command handlers only deal with their own work.

use tokio::runtime::Runtime;
use tracing::info;

use imagepipe::config::{ConfigFile, ImagePipelineConfig};
use imagepipe::logging::{init_logging, LoggingGuard};
use imagepipe::ImagePipeline;

use crate::error::CliError;

/// Runner that manages CLI lifecycle and common operations.
pub struct CliRunner {
    // Field order matters: the runtime shuts down before logging flushes.
    runtime: Runtime,
    config: ConfigFile,
    _logging_guard: LoggingGuard,
}

impl CliRunner {
    /// Loads the config file (defaults when absent) and initializes logging.
    pub fn new() -> Result<Self, CliError> {
        let config = ConfigFile::load()?;

        let logging_guard = init_logging(&config.logging.directory, &config.logging.file)
            .map_err(|e| CliError::LoggingInit(e.to_string()))?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("imagepipe")
            .build()
            .map_err(CliError::Runtime)?;

        Ok(Self {
            runtime,
            config,
            _logging_guard: logging_guard,
        })
    }

    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    /// Log startup information for a command.
    pub fn log_startup(&self, command: &str) {
        info!("imagepipe v{}", imagepipe::VERSION);
        info!("imagepipe CLI: {} command", command);
    }

    /// Builds a pipeline from the loaded config on the runner's runtime.
    pub fn create_pipeline(&self) -> Result<ImagePipeline, CliError> {
        let config = ImagePipelineConfig::from_config_file(&self.config);
        let pipeline = ImagePipeline::with_runtime(config, self.runtime.handle().clone())?;
        info!(
            cache_dir = %self.config.cache.directory.display(),
            "Pipeline created"
        );
        Ok(pipeline)
    }

    /// Runs `future` to completion on the runner's runtime.
    pub fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}
