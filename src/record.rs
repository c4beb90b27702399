use std::fmt::{Display, Formatter};

use bytes::Bytes;

/// A single record as read from the broker. Immutable once polled; offsets
/// are non-negative and monotonically increasing within a partition.
#[derive(Debug, Clone)]
pub struct Record {
    pub partition: i32,
    pub offset: i64,
    pub key: Bytes,
    pub value: Bytes,
    pub timestamp: i64,
}

impl Record {
    pub fn new(
        partition: i32,
        offset: i64,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        timestamp: i64,
    ) -> Self {
        Record {
            partition,
            offset,
            key: key.into(),
            value: value.into(),
            timestamp,
        }
    }
}

impl Display for Record {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.partition, self.offset)
    }
}

/// Terminal classification of one downstream invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// timeout, connection refused, 5xx-equivalent; eligible for retry
    RetryableFailure(String),
    /// malformed record, 4xx-equivalent; never retried
    FatalFailure(String),
}

impl Outcome {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Outcome::FatalFailure(_))
    }
}

/// A record whose processing failed permanently, reported exactly once on
/// the dead-letter channel instead of blocking its partition.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub record: Record,
    pub reason: String,
    /// total invocation attempts before giving up
    pub attempts: u32,
}
