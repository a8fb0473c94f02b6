//! Pitched Pop Generator
//!
//! Short percussive "pop" sounds at a chosen pitch. A fixed pool of
//! oscillator voices runs for the lifetime of the generator, silent until a
//! pop opens its envelope, so rapid successive pops never cut each other off.
//!
//! ```text
//!   osc[0] ─► env[0] ─┐
//!   osc[1] ─► env[1] ─┼─► compressor ─► output gain
//!   ...               │
//!   osc[n] ─► env[n] ─┘
//! ```

use crate::bin_mapper::ValueRange;
use crate::context::{AudioContext, NodeId, OscillatorType, ParamName};
use crate::generator::{GeneratorCore, GeneratorOptions, SoundGenerator};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::rc::Rc;
use tracing::trace;

/// Default pop length, in seconds
pub const DEFAULT_POP_DURATION: f64 = 0.02;

/// Rise time of the pop envelope, in seconds
const ATTACK_TIME: f64 = 0.005;

/// Lowest pop pitch, in Hz; the glide is exponential and cannot start at zero
const MIN_POP_FREQUENCY: f64 = 1.0;

/// Options for [`PitchedPopGenerator`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PitchedPopGeneratorOptions {
    /// Frequencies that relative pitches 0 and 1 map to, in Hz
    pub pitch_range: ValueRange,
    /// Number of pooled voices
    pub number_of_pop_generators: usize,
    pub waveform: OscillatorType,
    #[serde(flatten)]
    pub generator: GeneratorOptions,
}

impl Default for PitchedPopGeneratorOptions {
    fn default() -> Self {
        Self {
            pitch_range: ValueRange::new(400.0, 1200.0),
            number_of_pop_generators: 8,
            waveform: OscillatorType::Sine,
            generator: GeneratorOptions::default(),
        }
    }
}

/// One pooled oscillator and its envelope gain
#[derive(Debug, Clone, Copy)]
struct PopVoice {
    oscillator: NodeId,
    envelope: NodeId,
}

/// Generator of short pitched pops drawn from a voice pool.
pub struct PitchedPopGenerator {
    core: Rc<GeneratorCore>,
    pitch_range: ValueRange,
    voices: Vec<PopVoice>,
    compressor: NodeId,
    next_voice: Cell<usize>,
}

impl PitchedPopGenerator {
    pub fn new(context: &AudioContext, options: PitchedPopGeneratorOptions) -> Self {
        debug_assert!(
            options.number_of_pop_generators > 0,
            "pop generator pool must not be empty"
        );
        let core = GeneratorCore::new(context, options.generator);
        let now = context.current_time();

        let compressor = context.create_dynamics_compressor();
        context.connect(compressor, core.gain_node());

        let voices = (0..options.number_of_pop_generators)
            .map(|_| {
                let oscillator = context.create_oscillator();
                context.set_oscillator_type(oscillator, options.waveform);
                let envelope = context.create_gain();
                context
                    .param(envelope, ParamName::Gain)
                    .set_value_at_time(0.0, now);
                context.connect(oscillator, envelope);
                context.connect(envelope, compressor);
                context.start_source(oscillator, now, 0.0);
                PopVoice {
                    oscillator,
                    envelope,
                }
            })
            .collect();

        Self {
            core,
            pitch_range: options.pitch_range,
            voices,
            compressor,
            next_voice: Cell::new(0),
        }
    }

    /// Play a pop. `relative_pitch` in [0, 1] maps linearly onto the pitch
    /// range. Nothing happens while the generator is not fully enabled.
    pub fn play_pop(&self, relative_pitch: f64, duration: f64) {
        debug_assert!(
            (0.0..=1.0).contains(&relative_pitch),
            "relative pitch must be in [0, 1]"
        );
        debug_assert!(duration > 0.0, "pop duration must be positive");
        if !self.core.is_fully_enabled() || self.voices.is_empty() {
            return;
        }

        let index = self.next_voice.get();
        self.next_voice.set((index + 1) % self.voices.len());
        let voice = self.voices[index];

        let frequency = (self.pitch_range.min
            + self.pitch_range.length() * relative_pitch.clamp(0.0, 1.0))
        .max(MIN_POP_FREQUENCY);
        trace!(voice = index, frequency, duration, "pop");

        let context = self.core.context();
        let now = context.current_time();

        let pitch = context.param(voice.oscillator, ParamName::Frequency);
        pitch.cancel_scheduled_values(now);
        pitch.set_value_at_time(frequency / 2.0, now);
        pitch.exponential_ramp_to_value_at_time(frequency * 2.0, now + duration);

        let envelope = context.param(voice.envelope, ParamName::Gain);
        envelope.cancel_scheduled_values(now);
        envelope.set_value_at_time(0.0, now);
        envelope.linear_ramp_to_value_at_time(1.0, now + ATTACK_TIME);
        envelope.set_target_at_time(0.0, now + ATTACK_TIME, duration / 4.0);
    }

    pub fn number_of_voices(&self) -> usize {
        self.voices.len()
    }

    /// The voice the next pop will use
    pub fn next_voice_index(&self) -> usize {
        self.next_voice.get()
    }

    pub fn voice_oscillator(&self, index: usize) -> Option<NodeId> {
        self.voices.get(index).map(|v| v.oscillator)
    }

    pub fn voice_envelope(&self, index: usize) -> Option<NodeId> {
        self.voices.get(index).map(|v| v.envelope)
    }

    pub fn compressor_node(&self) -> NodeId {
        self.compressor
    }
}

impl SoundGenerator for PitchedPopGenerator {
    fn core(&self) -> &Rc<GeneratorCore> {
        &self.core
    }

    fn dispose(&self) {
        let context = self.core.context();
        for voice in &self.voices {
            context.stop_source(voice.oscillator, context.current_time());
            context.remove_node(voice.oscillator);
            context.remove_node(voice.envelope);
        }
        context.remove_node(self.compressor);
        self.core.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::Property;
    use approx::assert_relative_eq;

    fn pops(ctx: &AudioContext, voices: usize) -> PitchedPopGenerator {
        PitchedPopGenerator::new(
            ctx,
            PitchedPopGeneratorOptions {
                number_of_pop_generators: voices,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_pool_is_created_and_running() {
        let ctx = AudioContext::new_running(44100.0);
        let g = pops(&ctx, 4);
        assert_eq!(g.number_of_voices(), 4);
        assert_eq!(ctx.active_source_count(), 4);
        for i in 0..4 {
            let envelope = g.voice_envelope(i).unwrap();
            assert!(ctx.is_connected(envelope, g.compressor_node()));
            assert_relative_eq!(ctx.param(envelope, ParamName::Gain).value(), 0.0);
        }
        assert!(ctx.is_connected(g.compressor_node(), g.core().gain_node()));
    }

    #[test]
    fn test_voices_are_allocated_round_robin() {
        let ctx = AudioContext::new_running(44100.0);
        let g = pops(&ctx, 3);
        for expected in [1, 2, 0, 1] {
            g.play_pop(0.5, DEFAULT_POP_DURATION);
            assert_eq!(g.next_voice_index(), expected);
        }
    }

    #[test]
    fn test_pop_glides_from_half_to_double_pitch() {
        let ctx = AudioContext::new_running(44100.0);
        let g = pops(&ctx, 2);
        ctx.advance(1.0);
        g.play_pop(0.5, 0.1);

        let osc = g.voice_oscillator(0).unwrap();
        let pitch = ctx.param(osc, ParamName::Frequency);
        assert_relative_eq!(pitch.value_at(1.0), 400.0, epsilon = 1e-9);
        assert_relative_eq!(pitch.value_at(1.05), 800.0, epsilon = 1e-6);
        assert_relative_eq!(pitch.value_at(1.1), 1600.0, epsilon = 1e-6);
    }

    #[test]
    fn test_pitch_range_from_zero_glides_from_floor() {
        let ctx = AudioContext::new_running(44100.0);
        let g = PitchedPopGenerator::new(
            &ctx,
            PitchedPopGeneratorOptions {
                pitch_range: ValueRange::new(0.0, 1000.0),
                number_of_pop_generators: 1,
                ..Default::default()
            },
        );
        ctx.advance(1.0);
        g.play_pop(0.0, 0.1);

        let pitch = ctx.param(g.voice_oscillator(0).unwrap(), ParamName::Frequency);
        assert_relative_eq!(pitch.value_at(1.0), 0.5, epsilon = 1e-9);
        assert_relative_eq!(pitch.value_at(1.1), 2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_pop_envelope_is_percussive() {
        let ctx = AudioContext::new_running(44100.0);
        let g = pops(&ctx, 2);
        g.play_pop(0.0, DEFAULT_POP_DURATION);

        let envelope = ctx.param(g.voice_envelope(0).unwrap(), ParamName::Gain);
        assert_relative_eq!(envelope.value_at(0.0), 0.0);
        assert_relative_eq!(envelope.value_at(ATTACK_TIME), 1.0, epsilon = 1e-9);
        assert!(envelope.value_at(ATTACK_TIME + DEFAULT_POP_DURATION) < 0.02);
    }

    #[test]
    fn test_disabled_generator_does_not_pop() {
        let ctx = AudioContext::new_running(44100.0);
        let g = pops(&ctx, 2);
        let gate = Property::new(false);
        g.add_enable_control(gate.clone());
        g.play_pop(0.5, DEFAULT_POP_DURATION);
        assert_eq!(g.next_voice_index(), 0);

        gate.set(true);
        g.play_pop(0.5, DEFAULT_POP_DURATION);
        assert_eq!(g.next_voice_index(), 1);
    }

    #[test]
    fn test_dispose_releases_the_pool() {
        let ctx = AudioContext::new_running(44100.0);
        let g = pops(&ctx, 3);
        let osc = g.voice_oscillator(0).unwrap();
        g.dispose();
        assert!(!ctx.contains_node(osc));
        assert!(!ctx.contains_node(g.compressor_node()));
    }
}
