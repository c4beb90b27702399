pub use app_error::{AppError, AppResult};
pub use config::{
    global_config, DispatcherConfig, DownstreamConfig, PipelineConfig, RelayConfig, RetryConfig,
    SourceConfig, SyntheticConfig, GLOBAL_CONFIG,
};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod config;
mod shutdown;
mod tracing_config;
