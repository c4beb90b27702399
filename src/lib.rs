mod dispatch;
mod downstream;
mod offset;
mod pipeline;
mod record;
mod service;
mod source;

pub use dispatch::{BoundedDispatcher, DeadLetterQueue, RetryDecision, RetryPolicy};
pub use downstream::{DownstreamClient, HttpDownstream};
pub use offset::{OffsetTracker, Resolution};
pub use pipeline::{Pipeline, PipelineHandle, PipelineState};
pub use record::{DeadLetter, Outcome, Record};
pub use service::{
    global_config, setup_local_tracing, setup_tracing, AppError, AppResult, DispatcherConfig,
    DownstreamConfig, PipelineConfig, RelayConfig, RetryConfig, Shutdown, SourceConfig,
    SyntheticConfig, GLOBAL_CONFIG,
};
pub use source::{spawn_synthetic_feeder, ChannelSource, RecordSource, SourceEvent};
