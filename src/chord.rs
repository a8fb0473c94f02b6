//! Sound Clip Chord
//!
//! Plays one buffer at several playback rates at once, producing a chord
//! from a single recorded note. Each note is its own [`SoundClip`] feeding
//! the chord's output gain. Notes can optionally be staggered into an
//! arpeggio.

use crate::buffer::WrappedAudioBuffer;
use crate::clip::{SoundClip, SoundClipOptions, DEFAULT_STOP_DELAY};
use crate::context::AudioContext;
use crate::generator::{GeneratorCore, GeneratorOptions, SoundGenerator};
use crate::player::SoundPlayer;
use serde::{Deserialize, Serialize};
use std::rc::Rc;
use tracing::trace;

/// Playback-rate ratios of a major triad
pub fn major_triad() -> Vec<f64> {
    vec![1.0, libm::pow(2.0, 4.0 / 12.0), libm::pow(2.0, 7.0 / 12.0)]
}

/// Options for [`SoundClipChord`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoundClipChordOptions {
    /// One note per entry, relative to the recorded pitch
    pub chord_playback_rates: Vec<f64>,
    /// Stagger note starts instead of striking them together
    pub arpeggiate: bool,
    /// Delay between successive arpeggiated notes, in seconds
    pub arpeggiate_time: f64,
    pub trim_silence: bool,
    #[serde(flatten)]
    pub generator: GeneratorOptions,
}

impl Default for SoundClipChordOptions {
    fn default() -> Self {
        Self {
            chord_playback_rates: major_triad(),
            arpeggiate: false,
            arpeggiate_time: 0.1,
            trim_silence: true,
            generator: GeneratorOptions::default(),
        }
    }
}

/// A chord of one buffer played at several rates.
pub struct SoundClipChord {
    core: Rc<GeneratorCore>,
    notes: Vec<SoundClip>,
    arpeggiate: bool,
    arpeggiate_time: f64,
}

impl SoundClipChord {
    pub fn new(context: &AudioContext, buffer: WrappedAudioBuffer, options: SoundClipChordOptions) -> Self {
        let core = GeneratorCore::new(context, options.generator);
        let notes = options
            .chord_playback_rates
            .iter()
            .map(|&rate| {
                let note = SoundClip::new(
                    context,
                    buffer.clone(),
                    SoundClipOptions {
                        initial_playback_rate: rate,
                        trim_silence: options.trim_silence,
                        ..Default::default()
                    },
                );
                note.connect(core.gain_node());
                note
            })
            .collect();

        Self {
            core,
            notes,
            arpeggiate: options.arpeggiate,
            arpeggiate_time: options.arpeggiate_time,
        }
    }

    /// Strike the chord `delay` seconds from now.
    pub fn play(&self, delay: f64) {
        if !self.core.is_fully_enabled() {
            return;
        }
        trace!(notes = self.notes.len(), arpeggiate = self.arpeggiate, "chord");
        for (index, note) in self.notes.iter().enumerate() {
            let offset = if self.arpeggiate {
                self.arpeggiate_time * index as f64
            } else {
                0.0
            };
            note.play(delay + offset);
        }
    }

    pub fn stop(&self, delay: f64) {
        for note in &self.notes {
            note.stop(delay);
        }
    }

    pub fn is_playing(&self) -> bool {
        self.notes.iter().any(SoundClip::is_playing)
    }

    pub fn notes(&self) -> &[SoundClip] {
        &self.notes
    }
}

impl SoundGenerator for SoundClipChord {
    fn core(&self) -> &Rc<GeneratorCore> {
        &self.core
    }

    fn dispose(&self) {
        for note in &self.notes {
            note.dispose();
        }
        self.core.dispose();
    }
}

impl SoundPlayer for SoundClipChord {
    fn play(&self) {
        SoundClipChord::play(self, 0.0);
    }

    fn stop(&self) {
        SoundClipChord::stop(self, DEFAULT_STOP_DELAY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::tests::padded_buffer;
    use crate::context::ParamName;
    use crate::property::Property;
    use approx::assert_relative_eq;

    fn chord(ctx: &AudioContext, arpeggiate: bool) -> SoundClipChord {
        SoundClipChord::new(
            ctx,
            WrappedAudioBuffer::ready(padded_buffer()),
            SoundClipChordOptions {
                arpeggiate,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_notes_play_at_chord_rates() {
        let ctx = AudioContext::new_running(44100.0);
        let c = chord(&ctx, false);
        c.play(0.0);
        assert!(c.is_playing());

        let rates: Vec<f64> = c
            .notes()
            .iter()
            .map(|note| {
                let source = note.active_sources()[0];
                ctx.param(source, ParamName::PlaybackRate).value()
            })
            .collect();
        for (rate, expected) in rates.iter().zip(major_triad()) {
            assert_relative_eq!(*rate, expected, epsilon = 1e-12);
        }
        for note in c.notes() {
            assert!(note.is_connected_to(c.core().gain_node()));
        }
    }

    #[test]
    fn test_arpeggio_staggers_starts() {
        let ctx = AudioContext::new_running(44100.0);
        let c = chord(&ctx, true);
        c.play(0.0);
        let stops: Vec<f64> = c
            .notes()
            .iter()
            .map(|note| ctx.source_stop_time(note.active_sources()[0]).unwrap())
            .collect();
        // Start time recovered from each trimmed stop time
        for (i, (stop, rate)) in stops.iter().zip(major_triad()).enumerate() {
            assert_relative_eq!(stop - 0.8 / rate, 0.1 * i as f64, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_disabled_chord_is_silent() {
        let ctx = AudioContext::new_running(44100.0);
        let c = chord(&ctx, false);
        c.add_enable_control(Property::new(false));
        c.play(0.0);
        assert!(!c.is_playing());
    }

    #[test]
    fn test_stop_silences_every_note() {
        let ctx = AudioContext::new_running(44100.0);
        let c = chord(&ctx, false);
        c.play(0.0);
        c.stop(0.0);
        assert!(!c.is_playing());
    }
}
