//! Oscillator Sound Generator
//!
//! A single tone. Platform oscillators cannot be restarted, so each `play`
//! creates a fresh oscillator and each `stop` discards it.

use crate::context::{AudioContext, NodeId, OscillatorType, ParamName};
use crate::generator::{GeneratorCore, GeneratorOptions, SoundGenerator, DEFAULT_TIME_CONSTANT};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::rc::Rc;

/// Default glide for live frequency changes
pub const DEFAULT_FREQUENCY_TIME_CONSTANT: f64 = DEFAULT_TIME_CONSTANT;

/// Options for [`OscillatorSoundGenerator`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OscillatorOptions {
    pub initial_frequency: f64,
    pub initial_type: OscillatorType,
    #[serde(flatten)]
    pub generator: GeneratorOptions,
}

impl Default for OscillatorOptions {
    fn default() -> Self {
        Self {
            initial_frequency: 440.0,
            initial_type: OscillatorType::Sine,
            generator: GeneratorOptions::default(),
        }
    }
}

/// A generator producing one oscillator tone.
pub struct OscillatorSoundGenerator {
    core: Rc<GeneratorCore>,
    frequency: Cell<f64>,
    waveform: Cell<OscillatorType>,
    oscillator: Cell<Option<NodeId>>,
}

impl OscillatorSoundGenerator {
    pub fn new(context: &AudioContext, options: OscillatorOptions) -> Self {
        Self {
            core: GeneratorCore::new(context, options.generator),
            frequency: Cell::new(options.initial_frequency),
            waveform: Cell::new(options.initial_type),
            oscillator: Cell::new(None),
        }
    }

    /// Start the tone. Does nothing if it is already playing.
    pub fn play(&self) {
        if self.oscillator.get().is_some() {
            return;
        }
        let context = self.core.context();
        let now = context.current_time();
        let oscillator = context.create_oscillator();
        context.set_oscillator_type(oscillator, self.waveform.get());
        context
            .param(oscillator, ParamName::Frequency)
            .set_value_at_time(self.frequency.get(), now);
        context.connect(oscillator, self.core.gain_node());
        context.start_source(oscillator, now, 0.0);
        self.oscillator.set(Some(oscillator));
    }

    pub fn stop(&self) {
        if let Some(oscillator) = self.oscillator.take() {
            let context = self.core.context();
            context.stop_source(oscillator, context.current_time());
            context.remove_node(oscillator);
        }
    }

    pub fn is_playing(&self) -> bool {
        self.oscillator.get().is_some()
    }

    pub fn frequency(&self) -> f64 {
        self.frequency.get()
    }

    /// Change the frequency, gliding a live tone with the given time constant.
    pub fn set_frequency(&self, frequency: f64, time_constant: f64) {
        self.frequency.set(frequency);
        if let Some(oscillator) = self.oscillator.get() {
            let context = self.core.context();
            let param = context.param(oscillator, ParamName::Frequency);
            param.hold_current_value();
            param.set_target_at_time(frequency, context.current_time(), time_constant);
        }
    }

    pub fn waveform(&self) -> OscillatorType {
        self.waveform.get()
    }

    pub fn set_waveform(&self, waveform: OscillatorType) {
        self.waveform.set(waveform);
        if let Some(oscillator) = self.oscillator.get() {
            self.core.context().set_oscillator_type(oscillator, waveform);
        }
    }

    pub fn oscillator_node(&self) -> Option<NodeId> {
        self.oscillator.get()
    }
}

impl SoundGenerator for OscillatorSoundGenerator {
    fn core(&self) -> &Rc<GeneratorCore> {
        &self.core
    }

    fn dispose(&self) {
        self.stop();
        self.core.dispose();
    }
}
