//! One-way message port from the real-time thread to the event loop.
//!
//! The producer half lives inside an audio callback; the consumer half is
//! drained by an async task. The ring is bounded and the producer never
//! waits: when it is full the newest message is dropped and counted.

use crate::units::BLOCK_SIZE;
use rtrb::{Consumer, Producer, RingBuffer};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default ring capacity (in messages) for unit ports.
pub const DEFAULT_PORT_CAPACITY: usize = 256;

/// Messages posted by audio units.
///
/// Fixed-size so posting never allocates on the real-time thread.
#[derive(Debug, Clone, Copy)]
pub enum UnitMessage {
    /// One render block of encoded samples; only the first `len` are valid.
    Pcm16 {
        /// Sample storage.
        samples: [i16; BLOCK_SIZE],
        /// Number of valid samples.
        len: usize,
    },
    /// Smoothed RMS level in `[0, 1]`.
    Volume(f32),
}

impl UnitMessage {
    /// Build a PCM16 message from up to [`BLOCK_SIZE`] samples.
    pub fn pcm16(block: &[i16]) -> Self {
        let len = block.len().min(BLOCK_SIZE);
        let mut samples = [0i16; BLOCK_SIZE];
        samples[..len].copy_from_slice(&block[..len]);
        Self::Pcm16 { samples, len }
    }
}

/// Producer half, owned by the real-time side.
pub struct UnitPort {
    producer: Producer<UnitMessage>,
    dropped: Arc<AtomicU64>,
}

impl UnitPort {
    /// Post a message without blocking. Returns `false` if the ring was full.
    #[inline]
    pub fn post(&mut self, message: UnitMessage) -> bool {
        match self.producer.push(message) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

impl std::fmt::Debug for UnitPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitPort")
            .field("slots", &self.producer.slots())
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish()
    }
}

/// Consumer half, drained on the event loop.
pub struct PortReceiver {
    consumer: Consumer<UnitMessage>,
    dropped: Arc<AtomicU64>,
    reported: u64,
}

impl PortReceiver {
    /// Pop the oldest pending message, if any.
    pub fn try_recv(&mut self) -> Option<UnitMessage> {
        self.consumer.pop().ok()
    }

    /// Total messages dropped because the ring was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drops since the previous call, for periodic reporting.
    pub fn take_new_drops(&mut self) -> u64 {
        let total = self.dropped();
        let fresh = total - self.reported;
        self.reported = total;
        fresh
    }
}

impl std::fmt::Debug for PortReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortReceiver")
            .field("pending", &self.consumer.slots())
            .field("dropped", &self.dropped())
            .finish()
    }
}

/// Create a bounded port with room for `capacity` messages.
pub fn port(capacity: usize) -> (UnitPort, PortReceiver) {
    let (producer, consumer) = RingBuffer::new(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        UnitPort { producer, dropped: dropped.clone() },
        PortReceiver { consumer, dropped, reported: 0 },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_ring_drops_newest() {
        let (mut tx, mut rx) = port(2);
        assert!(tx.post(UnitMessage::Volume(0.1)));
        assert!(tx.post(UnitMessage::Volume(0.2)));
        assert!(!tx.post(UnitMessage::Volume(0.3)));

        assert!(matches!(rx.try_recv(), Some(UnitMessage::Volume(v)) if v == 0.1));
        assert!(matches!(rx.try_recv(), Some(UnitMessage::Volume(v)) if v == 0.2));
        assert!(rx.try_recv().is_none());
        assert_eq!(rx.take_new_drops(), 1);
        assert_eq!(rx.take_new_drops(), 0);
    }

    #[test]
    fn test_pcm16_message_truncates_to_block() {
        let samples = vec![7i16; BLOCK_SIZE + 10];
        match UnitMessage::pcm16(&samples) {
            UnitMessage::Pcm16 { len, samples } => {
                assert_eq!(len, BLOCK_SIZE);
                assert!(samples.iter().all(|s| *s == 7));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
