//! Fourier Tone Generator
//!
//! An additive tone: one sine oscillator per harmonic of a fundamental, each
//! through its own gain set to that harmonic's amplitude. Like every
//! platform oscillator the partials are single-use, so they are rebuilt on
//! each `play`.

use crate::context::{AudioContext, NodeId, OscillatorType, ParamName};
use crate::generator::{GeneratorCore, GeneratorOptions, SoundGenerator};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Options for [`FourierToneGenerator`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FourierToneOptions {
    pub fundamental_frequency: f64,
    /// Amplitude of harmonic `n + 1` at index `n`
    pub harmonic_amplitudes: Vec<f64>,
    #[serde(flatten)]
    pub generator: GeneratorOptions,
}

impl Default for FourierToneOptions {
    fn default() -> Self {
        Self {
            fundamental_frequency: 220.0,
            harmonic_amplitudes: vec![1.0],
            generator: GeneratorOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Partial {
    oscillator: NodeId,
    gain: NodeId,
}

/// Additive tone generator.
pub struct FourierToneGenerator {
    core: Rc<GeneratorCore>,
    fundamental: Cell<f64>,
    amplitudes: RefCell<Vec<f64>>,
    partials: RefCell<Vec<Partial>>,
}

impl FourierToneGenerator {
    pub fn new(context: &AudioContext, options: FourierToneOptions) -> Self {
        Self {
            core: GeneratorCore::new(context, options.generator),
            fundamental: Cell::new(options.fundamental_frequency),
            amplitudes: RefCell::new(options.harmonic_amplitudes),
            partials: RefCell::new(Vec::new()),
        }
    }

    pub fn play(&self) {
        if self.is_playing() {
            return;
        }
        let context = self.core.context();
        let now = context.current_time();
        let fundamental = self.fundamental.get();
        let partials = self
            .amplitudes
            .borrow()
            .iter()
            .enumerate()
            .map(|(index, &amplitude)| {
                let oscillator = context.create_oscillator();
                context.set_oscillator_type(oscillator, OscillatorType::Sine);
                context
                    .param(oscillator, ParamName::Frequency)
                    .set_value_at_time(fundamental * (index + 1) as f64, now);
                let gain = context.create_gain();
                context
                    .param(gain, ParamName::Gain)
                    .set_value_at_time(amplitude, now);
                context.connect(oscillator, gain);
                context.connect(gain, self.core.gain_node());
                context.start_source(oscillator, now, 0.0);
                Partial { oscillator, gain }
            })
            .collect();
        *self.partials.borrow_mut() = partials;
    }

    pub fn stop(&self) {
        let context = self.core.context();
        let now = context.current_time();
        for partial in self.partials.borrow_mut().drain(..) {
            context.stop_source(partial.oscillator, now);
            context.remove_node(partial.oscillator);
            context.remove_node(partial.gain);
        }
    }

    pub fn is_playing(&self) -> bool {
        !self.partials.borrow().is_empty()
    }

    pub fn fundamental_frequency(&self) -> f64 {
        self.fundamental.get()
    }

    /// Retune every partial of a live tone.
    pub fn set_fundamental_frequency(&self, frequency: f64, time_constant: f64) {
        self.fundamental.set(frequency);
        let context = self.core.context();
        let now = context.current_time();
        for (index, partial) in self.partials.borrow().iter().enumerate() {
            let param = context.param(partial.oscillator, ParamName::Frequency);
            param.hold_current_value();
            param.set_target_at_time(frequency * (index + 1) as f64, now, time_constant);
        }
    }

    pub fn harmonic_amplitudes(&self) -> Vec<f64> {
        self.amplitudes.borrow().clone()
    }

    /// Set the amplitude of a harmonic (0 is the fundamental). Unknown
    /// harmonics are ignored.
    pub fn set_harmonic_amplitude(&self, harmonic: usize, amplitude: f64) {
        let mut amplitudes = self.amplitudes.borrow_mut();
        let Some(slot) = amplitudes.get_mut(harmonic) else {
            return;
        };
        *slot = amplitude;
        if let Some(partial) = self.partials.borrow().get(harmonic) {
            let context = self.core.context();
            let param = context.param(partial.gain, ParamName::Gain);
            let now = context.current_time();
            param.cancel_scheduled_values(now);
            param.set_value_at_time(amplitude, now);
        }
    }

    pub fn partial_oscillators(&self) -> Vec<NodeId> {
        self.partials.borrow().iter().map(|p| p.oscillator).collect()
    }
}

impl SoundGenerator for FourierToneGenerator {
    fn core(&self) -> &Rc<GeneratorCore> {
        &self.core
    }

    fn dispose(&self) {
        self.stop();
        self.core.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn square_ish(ctx: &AudioContext) -> FourierToneGenerator {
        FourierToneGenerator::new(
            ctx,
            FourierToneOptions {
                fundamental_frequency: 100.0,
                harmonic_amplitudes: vec![1.0, 0.0, 1.0 / 3.0],
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_one_partial_per_harmonic() {
        let ctx = AudioContext::new_running(44100.0);
        let tone = square_ish(&ctx);
        tone.play();
        let oscillators = tone.partial_oscillators();
        assert_eq!(oscillators.len(), 3);
        for (i, osc) in oscillators.iter().enumerate() {
            assert_relative_eq!(
                ctx.param(*osc, ParamName::Frequency).value(),
                100.0 * (i + 1) as f64
            );
        }
    }

    #[test]
    fn test_stop_discards_partials() {
        let ctx = AudioContext::new_running(44100.0);
        let tone = square_ish(&ctx);
        tone.play();
        let first = tone.partial_oscillators();
        tone.stop();
        assert!(!tone.is_playing());
        assert!(first.iter().all(|osc| !ctx.contains_node(*osc)));

        tone.play();
        assert_ne!(tone.partial_oscillators(), first);
    }

    #[test]
    fn test_live_retune_and_amplitude() {
        let ctx = AudioContext::new_running(44100.0);
        let tone = square_ish(&ctx);
        tone.play();
        tone.set_fundamental_frequency(200.0, 0.0);
        let oscillators = tone.partial_oscillators();
        assert_relative_eq!(ctx.param(oscillators[2], ParamName::Frequency).value(), 600.0);

        tone.set_harmonic_amplitude(1, 0.5);
        tone.set_harmonic_amplitude(10, 0.5);
        assert_eq!(tone.harmonic_amplitudes(), vec![1.0, 0.5, 1.0 / 3.0]);
    }
}
