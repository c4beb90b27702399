use async_channel::{Receiver, Sender};
use tracing::warn;

use crate::record::DeadLetter;
use crate::{AppError, AppResult};

/// Bounded side channel for permanently failed records. The receiver is
/// handed to the embedder; a full channel backpressures the dispatch task
/// that is pushing rather than dropping the letter.
#[derive(Debug, Clone)]
pub struct DeadLetterQueue {
    sender: Sender<DeadLetter>,
}

impl DeadLetterQueue {
    pub fn bounded(capacity: usize) -> (Self, Receiver<DeadLetter>) {
        let (sender, receiver) = async_channel::bounded(capacity);
        (DeadLetterQueue { sender }, receiver)
    }

    pub async fn push(&self, letter: DeadLetter) -> AppResult<()> {
        warn!(
            "dead-lettering record {} after {} attempts: {}",
            letter.record, letter.attempts, letter.reason
        );
        self.sender
            .send(letter)
            .await
            .map_err(|err| AppError::ChannelSend(format!("dead letter channel: {err}")))
    }
}
