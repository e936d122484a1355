//! Mix destination: the local microphone and the AI output summed into one sink
//!
//! The render thread publishes one block per quantum. Consumers (a WAV
//! recorder, a level meter) subscribe and receive every block from then on;
//! a consumer that falls behind loses the oldest blocks.

use std::sync::Arc;

use tokio::sync::broadcast;

/// Blocks retained for slow subscribers
const MIX_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct MixDestination {
    tx: broadcast::Sender<Arc<[f32]>>,
    sample_rate: u32,
}

impl MixDestination {
    pub fn new(sample_rate: u32) -> Self {
        let (tx, _) = broadcast::channel(MIX_CHANNEL_CAPACITY);
        Self { tx, sample_rate }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Receive mixed mono blocks published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<[f32]>> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub(crate) fn publish(&self, block: &[f32]) {
        if self.tx.receiver_count() == 0 {
            return;
        }
        let _ = self.tx.send(Arc::from(block));
    }
}
