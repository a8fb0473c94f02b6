//! Buffer analysis helpers

use crate::buffer::AudioBuffer;
use serde::{Deserialize, Serialize};

/// Samples at or below this magnitude count as silence
pub const DEFAULT_SILENCE_THRESHOLD: f32 = 0.005;

/// Where audible content begins and ends within a buffer, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SoundBounds {
    pub start: f64,
    pub end: f64,
}

impl SoundBounds {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Find the first and last samples above `threshold` across all channels.
///
/// A buffer with no sample above the threshold reports its full extent.
pub fn detect_sound_bounds(buffer: &AudioBuffer, threshold: f32) -> SoundBounds {
    let length = buffer.length();
    let mut first = length;
    let mut last = 0;

    for channel in buffer.channels() {
        if let Some(i) = channel.iter().position(|s| s.abs() > threshold) {
            first = first.min(i);
        }
        if let Some(i) = channel.iter().rposition(|s| s.abs() > threshold) {
            last = last.max(i + 1);
        }
    }

    let sample_rate = buffer.sample_rate();
    if first >= last {
        return SoundBounds {
            start: 0.0,
            end: buffer.duration(),
        };
    }
    SoundBounds {
        start: first as f64 / sample_rate,
        end: last as f64 / sample_rate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_trims_leading_and_trailing_silence() {
        let mut samples = vec![0.0_f32; 1000];
        for s in &mut samples[100..900] {
            *s = 0.5;
        }
        let buffer = AudioBuffer::from_channels(vec![samples], 1000.0);
        let bounds = detect_sound_bounds(&buffer, DEFAULT_SILENCE_THRESHOLD);
        assert_relative_eq!(bounds.start, 0.1);
        assert_relative_eq!(bounds.end, 0.9);
        assert_relative_eq!(bounds.duration(), 0.8);
    }

    #[test]
    fn test_bounds_span_all_channels() {
        let mut left = vec![0.0_f32; 100];
        let mut right = vec![0.0_f32; 100];
        left[20] = -0.3;
        right[70] = 0.3;
        let buffer = AudioBuffer::from_channels(vec![left, right], 100.0);
        let bounds = detect_sound_bounds(&buffer, DEFAULT_SILENCE_THRESHOLD);
        assert_relative_eq!(bounds.start, 0.2);
        assert_relative_eq!(bounds.end, 0.71);
    }

    #[test]
    fn test_silent_buffer_keeps_full_extent() {
        let buffer = AudioBuffer::silent(500, 1000.0);
        let bounds = detect_sound_bounds(&buffer, DEFAULT_SILENCE_THRESHOLD);
        assert_relative_eq!(bounds.start, 0.0);
        assert_relative_eq!(bounds.end, 0.5);
    }
}
