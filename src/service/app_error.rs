// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSend(String),

    #[error("config file error: {0}")]
    ConfigFile(#[from] config::ConfigError),

    /// broker-facing errors, surfaced from poll/commit on the record source
    #[error("broker error: {0}")]
    Broker(String),

    #[error("offset commit failed {0} consecutive times")]
    CommitFailed(u32),

    /// downstream client construction or invocation plumbing errors;
    /// per-call failures are represented as `Outcome`, not as this error
    #[error("downstream error: {0}")]
    Downstream(String),
}
