use std::collections::VecDeque;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::models::audio_models::AudioFrame;
use crate::models::error::{RecordingError, Result};
use crate::models::health::BufferUsageInfo;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FrameBufferConfig {
    /// Initial capacity in frames (default: 250, five seconds of 20 ms frames).
    pub capacity: usize,

    /// Capacity never grows beyond `capacity × growth_ceiling`.
    pub growth_ceiling: usize,

    /// Fraction of capacity kept after an overflow, new frame included.
    pub retain_ratio: f64,

    pub growth_factor: f64,
}

impl Default for FrameBufferConfig {
    fn default() -> Self {
        Self {
            capacity: 250,
            growth_ceiling: 4,
            retain_ratio: 0.8,
            growth_factor: 1.5,
        }
    }
}

impl FrameBufferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(RecordingError::Configuration("frame buffer capacity must be positive".into()));
        }
        if self.growth_ceiling == 0 {
            return Err(RecordingError::Configuration("growth ceiling must be at least 1".into()));
        }
        if !(self.retain_ratio > 0.0 && self.retain_ratio <= 1.0) {
            return Err(RecordingError::Configuration(format!(
                "retain ratio must be in (0, 1]: {}",
                self.retain_ratio
            )));
        }
        if self.growth_factor < 1.0 {
            return Err(RecordingError::Configuration(format!(
                "growth factor must be at least 1: {}",
                self.growth_factor
            )));
        }
        Ok(())
    }
}

/// Bounded FIFO of frames between ingress and the recorder.
///
/// Overflow drops the oldest frames. When a push finds the buffer full, the
/// oldest frames are discarded until the buffer, including the new frame, holds
/// `floor(retain_ratio × capacity)` frames. Every second overflow without an
/// intervening drain grows the capacity by `growth_factor`, up to the ceiling.
///
/// Not synchronized; wrap in `parking_lot::Mutex` for cross-thread access.
#[derive(Debug)]
pub struct FrameBuffer {
    frames: VecDeque<AudioFrame>,
    config: FrameBufferConfig,
    capacity: usize,
    consecutive_overflows: u32,
    overflow_count: u64,
    dropped_frames: u64,
}

impl FrameBuffer {
    pub fn new(config: FrameBufferConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            config,
            capacity,
            consecutive_overflows: 0,
            overflow_count: 0,
            dropped_frames: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(FrameBufferConfig {
            capacity,
            ..Default::default()
        })
    }

    /// Appends a frame. Returns how many old frames were dropped to make room.
    pub fn push(&mut self, frame: AudioFrame) -> usize {
        let mut dropped = 0;

        if self.frames.len() >= self.capacity {
            let retained = ((self.capacity as f64 * self.config.retain_ratio).floor() as usize).max(1);
            while self.frames.len() >= retained {
                self.frames.pop_front();
                dropped += 1;
            }

            self.overflow_count += 1;
            self.dropped_frames += dropped as u64;
            self.consecutive_overflows += 1;
            warn!(
                "Frame buffer overflow: dropped {} oldest frames (capacity {})",
                dropped, self.capacity
            );

            if self.consecutive_overflows % 2 == 0 {
                self.grow();
            }
        }

        self.frames.push_back(frame);
        dropped
    }

    pub fn pop(&mut self) -> Option<AudioFrame> {
        let frame = self.frames.pop_front();
        if self.frames.is_empty() {
            self.consecutive_overflows = 0;
        }
        frame
    }

    /// Removes and returns every buffered frame, oldest first.
    pub fn drain(&mut self) -> Vec<AudioFrame> {
        self.consecutive_overflows = 0;
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

    pub fn max_capacity(&self) -> usize {
        self.config.capacity.max(1) * self.config.growth_ceiling.max(1)
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow_count
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    pub fn usage(&self) -> BufferUsageInfo {
        BufferUsageInfo {
            current_size: self.frames.len(),
            max_size: self.capacity,
            overflow_count: self.overflow_count,
        }
    }

    /// Empties the buffer and restores the initial capacity. Counters are kept.
    pub fn clear(&mut self) {
        self.frames.clear();
        self.capacity = self.config.capacity.max(1);
        self.consecutive_overflows = 0;
    }

    fn grow(&mut self) {
        let ceiling = self.max_capacity();
        if self.capacity >= ceiling {
            return;
        }
        let grown = (self.capacity as f64 * self.config.growth_factor).ceil() as usize;
        let grown = grown.clamp(self.capacity + 1, ceiling);
        debug!("Frame buffer capacity {} -> {}", self.capacity, grown);
        self.capacity = grown;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::audio_models::{AudioFormat, AudioSource};
    use chrono::Utc;

    fn frame(seq: u32) -> AudioFrame {
        AudioFrame::new(
            vec![0u8; 4],
            AudioFormat::pcm(8000, 1, 16),
            Utc::now(),
            AudioSource::RtpIncoming,
            seq,
        )
    }

    fn sequences(frames: &[AudioFrame]) -> Vec<u32> {
        frames.iter().map(|f| f.sequence_number()).collect()
    }

    #[test]
    fn fifo_order() {
        let mut buf = FrameBuffer::with_capacity(10);
        for seq in 1..=3 {
            assert_eq!(buf.push(frame(seq)), 0);
        }

        assert_eq!(buf.len(), 3);
        assert_eq!(buf.pop().map(|f| f.sequence_number()), Some(1));
        assert_eq!(sequences(&buf.drain()), vec![2, 3]);
        assert!(buf.is_empty());
        assert!(buf.pop().is_none());
    }

    #[test]
    fn overflow_drops_oldest_down_to_retained_share() {
        let mut buf = FrameBuffer::with_capacity(10);
        for seq in 1..=10 {
            buf.push(frame(seq));
        }

        let dropped = buf.push(frame(11));
        assert_eq!(dropped, 3);
        assert_eq!(buf.len(), 8);
        assert_eq!(sequences(&buf.drain()), vec![4, 5, 6, 7, 8, 9, 10, 11]);
        assert_eq!(buf.overflow_count(), 1);
        assert_eq!(buf.dropped_frames(), 3);
    }

    #[test]
    fn every_second_overflow_grows_capacity() {
        let mut buf = FrameBuffer::with_capacity(10);
        for seq in 1..=10 {
            buf.push(frame(seq));
        }
        buf.push(frame(11));
        assert_eq!(buf.capacity(), 10);

        for seq in 12..=13 {
            buf.push(frame(seq));
        }
        // Second consecutive overflow.
        buf.push(frame(14));
        assert_eq!(buf.capacity(), 15);
    }

    #[test]
    fn sustained_overflow_stays_bounded() {
        let mut buf = FrameBuffer::with_capacity(10);
        let ceiling = buf.max_capacity();
        assert_eq!(ceiling, 40);

        for seq in 0..2000 {
            let before = buf.capacity();
            if buf.push(frame(seq)) > 0 {
                assert!(buf.len() <= (before as f64 * 0.8).floor() as usize);
            }
            assert!(buf.len() <= buf.capacity());
            assert!(buf.capacity() <= ceiling);
        }
        assert_eq!(buf.capacity(), ceiling);
    }

    #[test]
    fn drain_resets_growth_streak() {
        let mut buf = FrameBuffer::with_capacity(4);
        for seq in 0..5 {
            buf.push(frame(seq));
        }
        assert_eq!(buf.overflow_count(), 1);
        buf.drain();

        for seq in 0..5 {
            buf.push(frame(seq));
        }
        assert_eq!(buf.overflow_count(), 2);
        assert_eq!(buf.capacity(), 4);
    }

    #[test]
    fn usage_reports_current_capacity() {
        let mut buf = FrameBuffer::with_capacity(8);
        buf.push(frame(1));
        buf.push(frame(2));

        let usage = buf.usage();
        assert_eq!(usage.current_size, 2);
        assert_eq!(usage.max_size, 8);
        approx::assert_abs_diff_eq!(usage.usage_percent(), 25.0);
    }

    #[test]
    fn clear_restores_initial_capacity() {
        let mut buf = FrameBuffer::with_capacity(2);
        for seq in 0..20 {
            buf.push(frame(seq));
        }
        assert!(buf.capacity() > 2);

        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 2);
        assert!(buf.overflow_count() > 0);
    }

    #[test]
    fn config_validation() {
        assert!(FrameBufferConfig::default().validate().is_ok());
        let bad = FrameBufferConfig {
            retain_ratio: 1.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
