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

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::dispatch::BoundedDispatcher;
use crate::downstream::DownstreamClient;
use crate::offset::OffsetTracker;
use crate::service::PipelineConfig;
use crate::source::{RecordSource, SourceEvent};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// Wires source -> dispatcher -> offset tracker and owns the lifecycle.
///
/// Records are submitted in per-partition offset order; completions may
/// land out of order and the tracker reconciles. Watermarks are flushed to
/// the source on a timer. A shutdown request drains in-flight work up to
/// the grace period before the final flush.
pub struct Pipeline<S, C> {
    config: PipelineConfig,
    source: S,
    dispatcher: Arc<BoundedDispatcher<C>>,
    tracker: Arc<OffsetTracker>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
    state_tx: watch::Sender<PipelineState>,
    /// highest offset committed to the source, per partition
    committed: HashMap<i32, i64>,
    consecutive_commit_failures: u32,
}

/// Control handle for a running pipeline.
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    shutdown_tx: mpsc::Sender<()>,
    state_rx: watch::Receiver<PipelineState>,
}

impl PipelineHandle {
    /// Requests a drain; returns once the request is delivered, not once
    /// the pipeline stopped. Use `wait_for(PipelineState::Stopped)` for that.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }

    pub fn state(&self) -> PipelineState {
        *self.state_rx.borrow()
    }

    pub async fn wait_for(&mut self, state: PipelineState) {
        let _ = self.state_rx.wait_for(|current| *current == state).await;
    }
}

enum Tick {
    Shutdown,
    Commit,
    Polled(AppResult<SourceEvent>),
}

impl<S: RecordSource, C: DownstreamClient> Pipeline<S, C> {
    pub fn new(
        config: PipelineConfig,
        source: S,
        dispatcher: Arc<BoundedDispatcher<C>>,
        tracker: Arc<OffsetTracker>,
        notify_shutdown: broadcast::Sender<()>,
    ) -> (Self, PipelineHandle) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(PipelineState::Starting);

        let pipeline = Pipeline {
            config,
            source,
            dispatcher,
            tracker,
            notify_shutdown,
            shutdown_rx,
            state_tx,
            committed: HashMap::new(),
            consecutive_commit_failures: 0,
        };
        let handle = PipelineHandle {
            shutdown_tx,
            state_rx,
        };
        (pipeline, handle)
    }

    /// Runs until a shutdown request or a fatal error, then drains. Commit
    /// failures past the configured threshold are fatal; the process is
    /// expected to restart and resume from the broker-stored offsets.
    pub async fn run(mut self) -> AppResult<()> {
        self.state_tx.send_replace(PipelineState::Running);
        info!("pipeline running");

        let poll_wait = Duration::from_millis(self.config.poll_max_wait_ms);
        let poll_backoff = Duration::from_millis(self.config.poll_backoff_ms);
        let mut commit_timer =
            time::interval(Duration::from_millis(self.config.commit_interval_ms));
        commit_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        commit_timer.tick().await;

        let result = 'running: loop {
            let tick = tokio::select! {
                _ = self.shutdown_rx.recv() => Tick::Shutdown,
                _ = commit_timer.tick() => Tick::Commit,
                polled = self.source.poll(poll_wait) => Tick::Polled(polled),
            };

            match tick {
                Tick::Shutdown => break Ok(()),
                Tick::Commit => {
                    if let Err(err) = self.flush_watermarks().await {
                        break Err(err);
                    }
                }
                Tick::Polled(Ok(SourceEvent::Batch(records))) => {
                    // submit backpressures; a shutdown request must still get
                    // through while the dispatcher is saturated
                    for record in records {
                        tokio::select! {
                            submitted = self.dispatcher.submit(record) => {
                                if let Err(err) = submitted {
                                    break 'running Err(err);
                                }
                            }
                            _ = self.shutdown_rx.recv() => break 'running Ok(()),
                        }
                    }
                }
                Tick::Polled(Ok(SourceEvent::Revoked(partitions))) => {
                    self.handle_revoked(partitions);
                }
                Tick::Polled(Ok(SourceEvent::Idle)) => {}
                Tick::Polled(Err(err)) => {
                    warn!("poll failed, backing off: {err}");
                    time::sleep(poll_backoff).await;
                }
            }
        };

        self.drain().await;
        result
    }

    /// Commits each partition's watermark if it moved since the last flush.
    async fn flush_watermarks(&mut self) -> AppResult<()> {
        for partition in self.tracker.partitions() {
            let Some(watermark) = self.tracker.watermark(partition) else {
                continue;
            };
            if watermark < 0 {
                continue;
            }
            let already_committed = self.committed.get(&partition).copied().unwrap_or(-1);
            if watermark <= already_committed {
                continue;
            }

            match self.source.commit(partition, watermark).await {
                Ok(()) => {
                    self.committed.insert(partition, watermark);
                    self.consecutive_commit_failures = 0;
                }
                Err(err) => {
                    self.consecutive_commit_failures += 1;
                    warn!(
                        "commit of partition {} offset {} failed ({} consecutive): {}",
                        partition, watermark, self.consecutive_commit_failures, err
                    );
                    if self.consecutive_commit_failures >= self.config.max_commit_failures {
                        return Err(AppError::CommitFailed(self.consecutive_commit_failures));
                    }
                    // back off and let the next tick retry the whole flush
                    time::sleep(Duration::from_millis(self.config.poll_backoff_ms)).await;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Ownership of these partitions is moving away; their uncommitted
    /// watermark progress is discarded rather than committed.
    fn handle_revoked(&mut self, partitions: Vec<i32>) {
        for partition in partitions {
            info!("partition {partition} revoked, discarding uncommitted progress");
            self.tracker.revoke(partition);
            self.committed.remove(&partition);
        }
    }

    async fn drain(&mut self) {
        self.state_tx.send_replace(PipelineState::Draining);
        info!("pipeline draining");

        // cancels pending retry waits; in-flight downstream calls finish
        // within the grace period
        let _ = self.notify_shutdown.send(());

        let grace = Duration::from_millis(self.config.shutdown_grace_ms);
        if !self.dispatcher.drain(grace).await {
            warn!(
                "grace period elapsed with {} records still in flight, abandoning them",
                self.dispatcher.in_flight()
            );
        }

        if let Err(err) = self.flush_watermarks().await {
            error!("final watermark flush failed: {err}");
        }

        self.state_tx.send_replace(PipelineState::Stopped);
        info!("pipeline stopped");
    }
}
