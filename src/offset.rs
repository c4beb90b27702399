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

use std::collections::BTreeSet;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

/// How a dispatched record reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// downstream accepted the record
    Completed,
    /// permanently failed and pushed onto the dead-letter channel; counts
    /// as resolved because the record is observable on the side channel
    DeadLettered,
    /// shutdown interrupted the record before a terminal outcome; the
    /// watermark must not advance past it, the broker redelivers on restart
    Abandoned,
}

#[derive(Debug)]
struct PartitionState {
    /// ownership generation this state belongs to; bumped by `revoke`
    generation: u64,
    in_flight: BTreeSet<i64>,
    /// resolved offsets above the watermark, not yet contiguous with it
    resolved: BTreeSet<i64>,
    /// highest offset K such that all offsets <= K are resolved
    watermark: i64,
}

/// Tracks the highest safely-committable offset per partition.
///
/// Completions may arrive out of order; the watermark only advances over
/// contiguous resolved runs, so it never passes an offset that is still in
/// flight or was abandoned. Each `begin` hands back the partition's current
/// ownership generation; a completion carrying a stale generation belongs to
/// a task that outlived a revocation and is dropped, even if the partition
/// has since been reassigned.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: DashMap<i32, Mutex<PartitionState>>,
    /// next ownership generation per partition; survives revocation
    generations: DashMap<i32, u64>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `offset` in flight and returns the partition's current
    /// ownership generation. The first offset seen for a partition (or for
    /// its re-assignment after a revoke) seeds the watermark one below it.
    pub fn begin(&self, partition: i32, offset: i64) -> u64 {
        let generation = self
            .generations
            .get(&partition)
            .map(|entry| *entry)
            .unwrap_or(0);
        let state = self.partitions.entry(partition).or_insert_with(|| {
            Mutex::new(PartitionState {
                generation,
                in_flight: BTreeSet::new(),
                resolved: BTreeSet::new(),
                watermark: offset - 1,
            })
        });
        state.lock().in_flight.insert(offset);
        generation
    }

    /// Resolves `offset`. Exactly one call per `begin`, carrying the
    /// generation that `begin` returned. Completions from before a revoke
    /// are dropped on the floor, since the partition's ownership has moved.
    pub fn complete(&self, partition: i32, offset: i64, generation: u64, resolution: Resolution) {
        let Some(state) = self.partitions.get(&partition) else {
            debug!(
                "completion for revoked partition {} offset {} ignored",
                partition, offset
            );
            return;
        };
        let mut guard = state.lock();
        let state = &mut *guard;
        if state.generation != generation {
            debug!(
                "stale completion for partition {} offset {} (generation {} != {}) ignored",
                partition, offset, generation, state.generation
            );
            return;
        }
        state.in_flight.remove(&offset);
        if resolution == Resolution::Abandoned {
            return;
        }
        state.resolved.insert(offset);
        loop {
            let next = state.watermark + 1;
            if !state.resolved.remove(&next) {
                break;
            }
            state.watermark = next;
        }
    }

    /// Safe commit point for `partition`; None for an untracked partition.
    /// A value below the first seen offset means nothing is committable yet.
    pub fn watermark(&self, partition: i32) -> Option<i64> {
        let state = self.partitions.get(&partition)?;
        let watermark = state.lock().watermark;
        Some(watermark)
    }

    /// Drops all state for `partition`; uncommitted progress is discarded.
    /// Bumps the ownership generation so in-flight completions from before
    /// the revoke cannot touch a later re-assignment of the partition.
    pub fn revoke(&self, partition: i32) {
        if self.partitions.remove(&partition).is_some() {
            debug!("discarded watermark state for revoked partition {partition}");
        }
        *self.generations.entry(partition).or_insert(0) += 1;
    }

    pub fn partitions(&self) -> Vec<i32> {
        self.partitions.iter().map(|entry| *entry.key()).collect()
    }

    pub fn in_flight_count(&self, partition: i32) -> usize {
        self.partitions
            .get(&partition)
            .map(|state| state.lock().in_flight.len())
            .unwrap_or(0)
    }
}
