use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info};

use crate::record::Record;
use crate::service::SyntheticConfig;
use crate::{AppError, AppResult};

/// One result of polling the record source.
#[derive(Debug)]
pub enum SourceEvent {
    /// records in per-partition offset order
    Batch(Vec<Record>),
    /// partition ownership is moving away; stop dispatching and discard
    /// uncommitted watermark progress for these partitions
    Revoked(Vec<i32>),
    /// nothing arrived within the poll wait
    Idle,
}

/// Seam over the broker. Within a partition, `poll` yields records in offset
/// order under an at-least-once delivery contract. `poll` must be
/// cancel-safe: a poll future dropped mid-await may not lose records.
pub trait RecordSource: Send + 'static {
    fn poll(&mut self, max_wait: Duration) -> impl Future<Output = AppResult<SourceEvent>> + Send;

    /// Persist `offset` as the highest processed offset for `partition`;
    /// after a restart, consumption resumes at `offset + 1`.
    fn commit(&mut self, partition: i32, offset: i64)
        -> impl Future<Output = AppResult<()>> + Send;
}

/// In-memory `RecordSource` backed by an mpsc channel. Used by the demo
/// binary and by tests; a real deployment plugs a broker-backed source in
/// at the same seam.
#[derive(Debug)]
pub struct ChannelSource {
    events: mpsc::Receiver<SourceEvent>,
    committed: Arc<DashMap<i32, i64>>,
}

impl ChannelSource {
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<SourceEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        let source = ChannelSource {
            events: rx,
            committed: Arc::new(DashMap::new()),
        };
        (source, tx)
    }

    /// Commit log, keyed by partition. Shared handle for inspection.
    pub fn committed(&self) -> Arc<DashMap<i32, i64>> {
        self.committed.clone()
    }
}

impl RecordSource for ChannelSource {
    fn poll(&mut self, max_wait: Duration) -> impl Future<Output = AppResult<SourceEvent>> + Send {
        async move {
            match time::timeout(max_wait, self.events.recv()).await {
                Ok(Some(event)) => Ok(event),
                Ok(None) => Err(AppError::Broker("record source channel closed".to_string())),
                Err(_) => Ok(SourceEvent::Idle),
            }
        }
    }

    fn commit(
        &mut self,
        partition: i32,
        offset: i64,
    ) -> impl Future<Output = AppResult<()>> + Send {
        debug!("committing partition {} offset {}", partition, offset);
        self.committed.insert(partition, offset);
        std::future::ready(Ok(()))
    }
}

/// Feeds synthetic quote records into a `ChannelSource` for the demo
/// binary. Exits when the source side of the channel goes away.
pub fn spawn_synthetic_feeder(
    sender: mpsc::Sender<SourceEvent>,
    config: SyntheticConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let symbols = ["AAPL", "AMZN", "GOOG", "MSFT", "NVDA"];
        let mut next_offsets: HashMap<i32, i64> = HashMap::new();
        let mut interval = time::interval(Duration::from_millis(config.batch_interval_ms));
        let mut round = 0usize;

        loop {
            interval.tick().await;

            let mut batch = Vec::with_capacity(config.records_per_batch);
            for _ in 0..config.records_per_batch {
                let symbol = symbols[round % symbols.len()];
                let partition = (round % config.partitions.max(1) as usize) as i32;
                let offset = next_offsets.entry(partition).or_insert(0);
                let payload = serde_json::json!({
                    "symbol": symbol,
                    "price": 100 + (round % 42),
                });
                batch.push(Record::new(
                    partition,
                    *offset,
                    Bytes::copy_from_slice(symbol.as_bytes()),
                    Bytes::from(payload.to_string()),
                    chrono::Utc::now().timestamp_millis(),
                ));
                *offset += 1;
                round += 1;
            }

            if sender.send(SourceEvent::Batch(batch)).await.is_err() {
                info!("record channel closed, synthetic feeder exiting");
                break;
            }
        }
    })
}
