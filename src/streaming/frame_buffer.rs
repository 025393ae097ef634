//! Ring buffer for audio frames with bounded memory
//!
//! Holds frames while the connection is down. Frames keep arriving on a fixed
//! cadence whether or not the socket is up, so when the buffer is full the
//! oldest frame is evicted instead of stalling the producer.
//!
//! # Memory Footprint
//!
//! At 16kHz mono PCM16 with 100ms frames:
//! - Frame size: 1600 samples × 2 bytes = 3,200 bytes
//! - 100 frames (10 seconds): 320 KB

use std::collections::VecDeque;

/// One fixed-format chunk of audio: mono PCM16 little-endian bytes
///
/// Immutable once produced; moved (never shared) from producer to buffer to
/// socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pcm: Vec<u8>,
}

impl AudioFrame {
    /// Wrap raw PCM16LE bytes
    pub fn new(pcm: Vec<u8>) -> Self {
        Self { pcm }
    }

    /// Build a frame from PCM16 samples
    pub fn from_samples(samples: &[i16]) -> Self {
        Self {
            pcm: samples.iter().flat_map(|&s| s.to_le_bytes()).collect(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.pcm
    }

    pub fn len_bytes(&self) -> usize {
        self.pcm.len()
    }

    /// Duration of this frame in milliseconds
    pub fn duration_ms(&self, sample_rate: u32) -> u64 {
        if sample_rate == 0 {
            return 0;
        }
        (self.pcm.len() as u64 / 2 * 1000) / sample_rate as u64
    }
}

/// Fixed-capacity, drop-oldest ring of audio frames
///
/// Thread-safety: This struct is NOT internally synchronized. The owning
/// connection keeps it behind its own lock.
#[derive(Debug)]
pub struct FrameRingBuffer {
    frames: VecDeque<AudioFrame>,
    capacity: usize,
    dropped: u64,
}

impl FrameRingBuffer {
    /// Create a buffer holding at most `capacity` frames (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Add a frame, evicting the oldest one if full. O(1), never fails.
    pub fn add(&mut self, frame: AudioFrame) {
        if self.frames.len() >= self.capacity {
            self.frames.pop_front();
            self.dropped += 1;
            if self.dropped == 1 || self.dropped % 50 == 0 {
                log::debug!(
                    "FrameRingBuffer: full ({} frames), {} oldest frames dropped so far",
                    self.capacity,
                    self.dropped
                );
            }
        }
        self.frames.push_back(frame);
    }

    /// Remove and return all held frames, oldest first
    pub fn flush(&mut self) -> Vec<AudioFrame> {
        self.frames.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total frames evicted since creation
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Approximate memory usage in bytes
    pub fn memory_bytes(&self) -> usize {
        self.frames.iter().map(|f| f.len_bytes()).sum()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8) -> AudioFrame {
        AudioFrame::new(vec![tag; 4])
    }

    #[test]
    fn test_add_and_len() {
        let mut buffer = FrameRingBuffer::new(10);
        assert!(buffer.is_empty());

        buffer.add(frame(1));
        buffer.add(frame(2));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.dropped(), 0);
    }

    #[test]
    fn test_drop_oldest_keeps_most_recent() {
        let mut buffer = FrameRingBuffer::new(3);
        for tag in [b'A', b'B', b'C', b'D', b'E'] {
            buffer.add(frame(tag));
        }

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.dropped(), 2);
        assert_eq!(buffer.flush(), vec![frame(b'C'), frame(b'D'), frame(b'E')]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_flush_preserves_order_and_empties() {
        let mut buffer = FrameRingBuffer::new(100);
        for tag in 0..20u8 {
            buffer.add(frame(tag));
        }

        let frames = buffer.flush();
        assert_eq!(frames.len(), 20);
        for (i, f) in frames.iter().enumerate() {
            assert_eq!(f.as_bytes()[0], i as u8);
        }
        assert!(buffer.flush().is_empty());
    }

    #[test]
    fn test_capacity_is_fixed() {
        let mut buffer = FrameRingBuffer::new(5);
        for tag in 0..500u16 {
            buffer.add(frame(tag as u8));
            assert!(buffer.len() <= 5);
        }
        assert_eq!(buffer.capacity(), 5);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut buffer = FrameRingBuffer::new(0);
        buffer.add(frame(1));
        buffer.add(frame(2));
        assert_eq!(buffer.flush(), vec![frame(2)]);
    }

    #[test]
    fn test_frame_from_samples_is_little_endian() {
        let f = AudioFrame::from_samples(&[0x1234, 0x5678]);
        assert_eq!(f.as_bytes(), &[0x34, 0x12, 0x78, 0x56]);
    }

    #[test]
    fn test_frame_duration_and_memory() {
        // 100ms at 16kHz = 1600 samples
        let f = AudioFrame::from_samples(&[0i16; 1600]);
        assert_eq!(f.duration_ms(16000), 100);
        assert_eq!(f.duration_ms(0), 0);

        let mut buffer = FrameRingBuffer::new(10);
        buffer.add(f.clone());
        buffer.add(f);
        assert_eq!(buffer.memory_bytes(), 6400);
    }
}
