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

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, watch, OwnedSemaphorePermit, Semaphore};
use tokio::time;
use tracing::{debug, error};

use crate::dispatch::{DeadLetterQueue, RetryDecision, RetryPolicy};
use crate::downstream::DownstreamClient;
use crate::offset::{OffsetTracker, Resolution};
use crate::record::{DeadLetter, Outcome, Record};
use crate::service::DispatcherConfig;
use crate::{AppError, AppResult, Shutdown};

/// Concurrency-limited dispatch of records to the downstream client.
///
/// `submit` backpressures the caller once the global or per-partition
/// in-flight limit is reached; it never drops a record. Every accepted
/// record produces exactly one completion report to the offset tracker.
#[derive(Debug)]
pub struct BoundedDispatcher<C> {
    client: C,
    retry_policy: Arc<RetryPolicy>,
    tracker: Arc<OffsetTracker>,
    dead_letters: DeadLetterQueue,
    global_slots: Arc<Semaphore>,
    /// kept across rebalances: tasks from before a revoke hold permits here,
    /// so a re-assigned partition cannot exceed its limit while they drain
    partition_slots: DashMap<i32, Arc<Semaphore>>,
    per_partition_limit: usize,
    in_flight_tx: Arc<watch::Sender<usize>>,
    in_flight_rx: watch::Receiver<usize>,
    notify_shutdown: broadcast::Sender<()>,
}

impl<C: DownstreamClient> BoundedDispatcher<C> {
    pub fn new(
        config: &DispatcherConfig,
        client: C,
        retry_policy: RetryPolicy,
        tracker: Arc<OffsetTracker>,
        dead_letters: DeadLetterQueue,
        notify_shutdown: broadcast::Sender<()>,
    ) -> Self {
        let (in_flight_tx, in_flight_rx) = watch::channel(0usize);
        BoundedDispatcher {
            client,
            retry_policy: Arc::new(retry_policy),
            tracker,
            dead_letters,
            global_slots: Arc::new(Semaphore::new(config.max_concurrency)),
            partition_slots: DashMap::new(),
            per_partition_limit: config.per_partition_limit,
            in_flight_tx: Arc::new(in_flight_tx),
            in_flight_rx,
            notify_shutdown,
        }
    }

    /// Reserves one global and one per-partition concurrency slot, awaiting
    /// until both free up, then launches the dispatch task for `record`.
    pub async fn submit(&self, record: Record) -> AppResult<()> {
        let global_permit = self
            .global_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::IllegalState("dispatcher semaphore closed".to_string()))?;

        let partition_semaphore = self
            .partition_slots
            .entry(record.partition)
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_partition_limit)))
            .clone();
        let partition_permit = partition_semaphore
            .acquire_owned()
            .await
            .map_err(|_| AppError::IllegalState("partition semaphore closed".to_string()))?;

        let generation = self.tracker.begin(record.partition, record.offset);
        self.in_flight_tx.send_modify(|count| *count += 1);

        let task = DispatchTask {
            record,
            generation,
            enqueued_at: time::Instant::now(),
            client: self.client.clone(),
            retry_policy: self.retry_policy.clone(),
            tracker: self.tracker.clone(),
            dead_letters: self.dead_letters.clone(),
            in_flight_tx: self.in_flight_tx.clone(),
            shutdown: Shutdown::subscribe(&self.notify_shutdown),
        };
        tokio::spawn(task.run(global_permit, partition_permit));

        Ok(())
    }

    /// Waits for all in-flight dispatch tasks to reach a terminal state, up
    /// to `grace`. Returns whether the dispatcher fully drained.
    pub async fn drain(&self, grace: Duration) -> bool {
        let mut in_flight = self.in_flight_rx.clone();
        let drained = matches!(
            time::timeout(grace, in_flight.wait_for(|count| *count == 0)).await,
            Ok(Ok(_))
        );
        drained
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight_rx.borrow()
    }
}

/// One accepted record, driven to a terminal resolution on its own task.
struct DispatchTask<C> {
    record: Record,
    /// partition ownership generation at submit time; a completion from
    /// before a rebalance must not count against the re-assigned partition
    generation: u64,
    enqueued_at: time::Instant,
    client: C,
    retry_policy: Arc<RetryPolicy>,
    tracker: Arc<OffsetTracker>,
    dead_letters: DeadLetterQueue,
    in_flight_tx: Arc<watch::Sender<usize>>,
    shutdown: Shutdown,
}

impl<C: DownstreamClient> DispatchTask<C> {
    async fn run(
        mut self,
        _global_permit: OwnedSemaphorePermit,
        _partition_permit: OwnedSemaphorePermit,
    ) {
        let mut attempt: u32 = 0;
        let resolution = loop {
            let failure = match self.client.invoke(&self.record).await {
                Outcome::Success => break Resolution::Completed,
                failure => failure,
            };

            match self.retry_policy.decide(attempt, &failure) {
                RetryDecision::RetryAfter(delay) => {
                    debug!(
                        "record {} attempt {} failed, retrying in {:?}",
                        self.record, attempt, delay
                    );
                    tokio::select! {
                        _ = time::sleep(delay) => attempt += 1,
                        _ = self.shutdown.recv() => {
                            debug!("shutdown cancelled retry wait for record {}", self.record);
                            break Resolution::Abandoned;
                        }
                    }
                }
                RetryDecision::GiveUp => {
                    let reason = match failure {
                        Outcome::RetryableFailure(reason) => format!("retries exhausted: {reason}"),
                        Outcome::FatalFailure(reason) => reason,
                        Outcome::Success => unreachable!("success is terminal"),
                    };
                    let letter = DeadLetter {
                        record: self.record.clone(),
                        reason,
                        attempts: attempt + 1,
                    };
                    match self.dead_letters.push(letter).await {
                        Ok(()) => break Resolution::DeadLettered,
                        Err(err) => {
                            error!("could not dead-letter record {}: {}", self.record, err);
                            break Resolution::Abandoned;
                        }
                    }
                }
            }
        };

        debug!(
            "record {} resolved as {:?} after {:?}",
            self.record,
            resolution,
            self.enqueued_at.elapsed()
        );
        self.tracker.complete(
            self.record.partition,
            self.record.offset,
            self.generation,
            resolution,
        );
        self.in_flight_tx.send_modify(|count| *count -= 1);
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;

    use super::*;
    use crate::service::RetryConfig;

    /// Downstream stub that holds each call open until released and records
    /// the peak number of simultaneous invocations.
    #[derive(Clone)]
    struct GatedClient {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        gate: Arc<Semaphore>,
    }

    impl GatedClient {
        fn new() -> Self {
            GatedClient {
                active: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
                gate: Arc::new(Semaphore::new(0)),
            }
        }
    }

    impl DownstreamClient for GatedClient {
        fn invoke(&self, _record: &Record) -> impl Future<Output = Outcome> + Send {
            let active = self.active.clone();
            let peak = self.peak.clone();
            let gate = self.gate.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                let _permit = gate.acquire().await.unwrap();
                active.fetch_sub(1, Ordering::SeqCst);
                Outcome::Success
            }
        }
    }

    /// Downstream stub returning a fixed outcome.
    #[derive(Clone)]
    struct FixedClient {
        outcome: Outcome,
        calls: Arc<AtomicUsize>,
    }

    impl FixedClient {
        fn new(outcome: Outcome) -> Self {
            FixedClient {
                outcome,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl DownstreamClient for FixedClient {
        fn invoke(&self, _record: &Record) -> impl Future<Output = Outcome> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(self.outcome.clone())
        }
    }

    fn record(partition: i32, offset: i64) -> Record {
        Record::new(partition, offset, Bytes::new(), Bytes::new(), 0)
    }

    fn dispatcher<C: DownstreamClient>(
        config: DispatcherConfig,
        client: C,
    ) -> (
        BoundedDispatcher<C>,
        Arc<OffsetTracker>,
        async_channel::Receiver<DeadLetter>,
    ) {
        let retry_config = RetryConfig {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 5,
        };
        let tracker = Arc::new(OffsetTracker::new());
        let (dead_letters, dead_letter_rx) = DeadLetterQueue::bounded(16);
        let (notify_shutdown, _) = broadcast::channel(1);
        let dispatcher = BoundedDispatcher::new(
            &config,
            client,
            RetryPolicy::with_seed(&retry_config, 42),
            tracker.clone(),
            dead_letters,
            notify_shutdown,
        );
        (dispatcher, tracker, dead_letter_rx)
    }

    #[tokio::test]
    async fn test_global_concurrency_bound_is_respected() {
        let client = GatedClient::new();
        let (dispatcher, _tracker, _dlq) = dispatcher(
            DispatcherConfig {
                max_concurrency: 3,
                per_partition_limit: 3,
                dead_letter_capacity: 16,
            },
            client.clone(),
        );
        let dispatcher = Arc::new(dispatcher);

        // submit from a separate task so backpressure does not block the test
        let submitter = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                for offset in 0..10 {
                    dispatcher.submit(record(offset as i32 % 2, offset)).await.unwrap();
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.active.load(Ordering::SeqCst), 3);
        assert_eq!(dispatcher.in_flight(), 3);

        client.gate.add_permits(100);
        submitter.await.unwrap();
        assert!(dispatcher.drain(Duration::from_secs(1)).await);
        assert!(client.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_per_partition_limit_is_respected() {
        let client = GatedClient::new();
        let (dispatcher, _tracker, _dlq) = dispatcher(
            DispatcherConfig {
                max_concurrency: 8,
                per_partition_limit: 1,
                dead_letter_capacity: 16,
            },
            client.clone(),
        );
        let dispatcher = Arc::new(dispatcher);

        let submitter = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                for offset in 0..4 {
                    dispatcher.submit(record(0, offset)).await.unwrap();
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        // a single partition admits one task at a time
        assert_eq!(client.active.load(Ordering::SeqCst), 1);

        client.gate.add_permits(100);
        submitter.await.unwrap();
        assert!(dispatcher.drain(Duration::from_secs(1)).await);
        assert_eq!(client.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_partition_limit_holds_across_reassignment() {
        let client = GatedClient::new();
        let (dispatcher, tracker, _dlq) = dispatcher(
            DispatcherConfig {
                max_concurrency: 8,
                per_partition_limit: 1,
                dead_letter_capacity: 16,
            },
            client.clone(),
        );
        let dispatcher = Arc::new(dispatcher);

        dispatcher.submit(record(0, 0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // ownership moves away and straight back while the task is running
        tracker.revoke(0);
        let submitter = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher.submit(record(0, 1)).await.unwrap();
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        // the pre-revoke task still counts against the partition limit
        assert_eq!(client.active.load(Ordering::SeqCst), 1);

        client.gate.add_permits(100);
        submitter.await.unwrap();
        assert!(dispatcher.drain(Duration::from_secs(1)).await);
        assert_eq!(client.peak.load(Ordering::SeqCst), 1);
        // the pre-revoke completion was stale and did not resolve offset 0
        assert_eq!(tracker.watermark(0), Some(1));
    }

    #[tokio::test]
    async fn test_success_advances_watermark() {
        let client = FixedClient::new(Outcome::Success);
        let (dispatcher, tracker, _dlq) = dispatcher(
            DispatcherConfig {
                max_concurrency: 4,
                per_partition_limit: 4,
                dead_letter_capacity: 16,
            },
            client,
        );

        for offset in 0..3 {
            dispatcher.submit(record(0, offset)).await.unwrap();
        }
        assert!(dispatcher.drain(Duration::from_secs(1)).await);
        assert_eq!(tracker.watermark(0), Some(2));
    }

    #[tokio::test]
    async fn test_fatal_failure_is_dead_lettered_exactly_once() {
        let client = FixedClient::new(Outcome::FatalFailure("400".to_string()));
        let (dispatcher, tracker, dead_letter_rx) = dispatcher(
            DispatcherConfig {
                max_concurrency: 4,
                per_partition_limit: 4,
                dead_letter_capacity: 16,
            },
            client.clone(),
        );

        dispatcher.submit(record(0, 0)).await.unwrap();
        assert!(dispatcher.drain(Duration::from_secs(1)).await);

        let letter = dead_letter_rx.recv().await.unwrap();
        assert_eq!(letter.record.offset, 0);
        assert_eq!(letter.attempts, 1);
        assert!(dead_letter_rx.is_empty());
        // fatal records are never retried
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        // dead-lettered offsets resolve the watermark
        assert_eq!(tracker.watermark(0), Some(0));
    }

    #[tokio::test]
    async fn test_retries_exhausted_is_dead_lettered() {
        let client = FixedClient::new(Outcome::RetryableFailure("503".to_string()));
        let (dispatcher, _tracker, dead_letter_rx) = dispatcher(
            DispatcherConfig {
                max_concurrency: 4,
                per_partition_limit: 4,
                dead_letter_capacity: 16,
            },
            client.clone(),
        );

        dispatcher.submit(record(0, 0)).await.unwrap();
        assert!(dispatcher.drain(Duration::from_secs(5)).await);

        let letter = dead_letter_rx.recv().await.unwrap();
        // max_attempts = 2: failed attempts 0 and 1 retried, attempt 2 gives up
        assert_eq!(letter.attempts, 3);
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
        assert!(letter.reason.starts_with("retries exhausted"));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_retry_wait() {
        let retry_config = RetryConfig {
            max_attempts: 5,
            base_delay_ms: 60_000,
            max_delay_ms: 60_000,
        };
        let tracker = Arc::new(OffsetTracker::new());
        let (dead_letters, dead_letter_rx) = DeadLetterQueue::bounded(16);
        let (notify_shutdown, _) = broadcast::channel(1);
        let dispatcher = BoundedDispatcher::new(
            &DispatcherConfig {
                max_concurrency: 4,
                per_partition_limit: 4,
                dead_letter_capacity: 16,
            },
            FixedClient::new(Outcome::RetryableFailure("503".to_string())),
            RetryPolicy::with_seed(&retry_config, 42),
            tracker.clone(),
            dead_letters,
            notify_shutdown.clone(),
        );

        dispatcher.submit(record(0, 0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // the task is now sleeping out a 60s retry delay
        notify_shutdown.send(()).unwrap();
        assert!(dispatcher.drain(Duration::from_secs(1)).await);

        // abandoned, not dead-lettered, and the watermark did not move
        assert!(dead_letter_rx.is_empty());
        assert_eq!(tracker.watermark(0), Some(-1));
    }
}
