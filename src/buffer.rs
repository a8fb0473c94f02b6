//! Decoded audio buffers
//!
//! [`AudioBuffer`] is the immutable result of a decode, shared by reference
//! between every clip that plays it. [`WrappedAudioBuffer`] is the write-once
//! slot that clips hold from load time until the decode lands.

use crate::property::{ListenerId, Property};
use std::rc::Rc;

#[derive(Debug)]
struct BufferData {
    sample_rate: f64,
    channels: Vec<Vec<f32>>,
}

/// Immutable decoded sample data. Clones share the same samples.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    data: Rc<BufferData>,
}

impl PartialEq for AudioBuffer {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }
}

impl AudioBuffer {
    /// Build a buffer from per-channel sample data.
    ///
    /// All channels must have the same length.
    pub fn from_channels(channels: Vec<Vec<f32>>, sample_rate: f64) -> Self {
        debug_assert!(!channels.is_empty(), "buffer needs at least one channel");
        debug_assert!(
            channels.windows(2).all(|w| w[0].len() == w[1].len()),
            "channel lengths differ"
        );
        debug_assert!(sample_rate > 0.0, "sample rate must be positive");
        Self {
            data: Rc::new(BufferData {
                sample_rate,
                channels,
            }),
        }
    }

    /// Build a buffer from interleaved frames.
    pub fn from_interleaved(samples: &[f32], num_channels: usize, sample_rate: f64) -> Self {
        let num_channels = num_channels.max(1);
        let frames = samples.len() / num_channels;
        let mut channels = vec![Vec::with_capacity(frames); num_channels];
        for frame in samples.chunks_exact(num_channels) {
            for (channel, &sample) in channels.iter_mut().zip(frame) {
                channel.push(sample);
            }
        }
        Self::from_channels(channels, sample_rate)
    }

    /// A mono buffer of silence.
    pub fn silent(length: usize, sample_rate: f64) -> Self {
        Self::from_channels(vec![vec![0.0; length]], sample_rate)
    }

    pub fn sample_rate(&self) -> f64 {
        self.data.sample_rate
    }

    pub fn number_of_channels(&self) -> usize {
        self.data.channels.len()
    }

    /// Length in sample frames
    pub fn length(&self) -> usize {
        self.data.channels.first().map_or(0, Vec::len)
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        self.length() as f64 / self.data.sample_rate
    }

    pub fn channel_data(&self, channel: usize) -> &[f32] {
        &self.data.channels[channel]
    }

    pub fn channels(&self) -> impl Iterator<Item = &[f32]> {
        self.data.channels.iter().map(Vec::as_slice)
    }

    pub fn ptr_eq(&self, other: &AudioBuffer) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }
}

/// A write-once holder for a buffer that is decoded after construction.
///
/// Starts empty; [`WrappedAudioBuffer::set`] fills it exactly once and
/// notifies observers of the ready transition.
#[derive(Clone)]
pub struct WrappedAudioBuffer {
    buffer: Property<Option<AudioBuffer>>,
}

impl Default for WrappedAudioBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WrappedAudioBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappedAudioBuffer")
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl WrappedAudioBuffer {
    /// An empty wrapper
    pub fn new() -> Self {
        Self {
            buffer: Property::new(None),
        }
    }

    /// A wrapper that is already ready
    pub fn ready(buffer: AudioBuffer) -> Self {
        Self {
            buffer: Property::new(Some(buffer)),
        }
    }

    /// Fill the wrapper. A second write is a programmer error and is ignored.
    pub fn set(&self, buffer: AudioBuffer) {
        let already_set = self.is_ready();
        debug_assert!(!already_set, "wrapped audio buffer is write-once");
        if already_set {
            return;
        }
        self.buffer.set(Some(buffer));
    }

    pub fn get(&self) -> Option<AudioBuffer> {
        self.buffer.get()
    }

    pub fn is_ready(&self) -> bool {
        self.buffer.get().is_some()
    }

    /// Invoke `listener` once the buffer is ready (immediately if it already is).
    ///
    /// Returns the listener id when a subscription was left in place.
    pub fn when_ready(&self, listener: impl Fn(&AudioBuffer) + 'static) -> Option<ListenerId> {
        if let Some(buffer) = self.get() {
            listener(&buffer);
            return None;
        }
        Some(self.buffer.lazy_link(move |new, _| {
            if let Some(buffer) = new {
                listener(buffer);
            }
        }))
    }

    pub fn unlink(&self, id: ListenerId) -> bool {
        self.buffer.unlink(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::cell::Cell;

    #[test]
    fn test_buffer_geometry() {
        let buffer = AudioBuffer::from_channels(vec![vec![0.0; 22050], vec![0.0; 22050]], 44100.0);
        assert_eq!(buffer.number_of_channels(), 2);
        assert_eq!(buffer.length(), 22050);
        assert_relative_eq!(buffer.duration(), 0.5);
    }

    #[test]
    fn test_from_interleaved() {
        let buffer = AudioBuffer::from_interleaved(&[0.1, -0.1, 0.2, -0.2], 2, 8000.0);
        assert_eq!(buffer.channel_data(0), &[0.1, 0.2]);
        assert_eq!(buffer.channel_data(1), &[-0.1, -0.2]);
    }

    #[test]
    fn test_clones_share_samples() {
        let a = AudioBuffer::silent(10, 8000.0);
        let b = a.clone();
        assert!(a.ptr_eq(&b));
        assert_ne!(a, AudioBuffer::silent(10, 8000.0));
    }

    #[test]
    fn test_wrapped_buffer_ready_transition() {
        let wrapped = WrappedAudioBuffer::new();
        let fired = Rc::new(Cell::new(0));
        let f = Rc::clone(&fired);
        let id = wrapped.when_ready(move |_| f.set(f.get() + 1));
        assert!(id.is_some());
        assert!(!wrapped.is_ready());

        wrapped.set(AudioBuffer::silent(4, 8000.0));
        assert!(wrapped.is_ready());
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_when_ready_on_ready_buffer_fires_now() {
        let wrapped = WrappedAudioBuffer::ready(AudioBuffer::silent(4, 8000.0));
        let fired = Rc::new(Cell::new(false));
        let f = Rc::clone(&fired);
        assert!(wrapped.when_ready(move |_| f.set(true)).is_none());
        assert!(fired.get());
    }

    #[test]
    #[should_panic(expected = "write-once")]
    fn test_wrapped_buffer_is_write_once() {
        let wrapped = WrappedAudioBuffer::new();
        wrapped.set(AudioBuffer::silent(4, 8000.0));
        wrapped.set(AudioBuffer::silent(4, 8000.0));
    }
}
