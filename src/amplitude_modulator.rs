//! Amplitude Modulator
//!
//! A pass-through gain stage that can wobble the level of whatever runs
//! through it. Enabling creates a low-frequency oscillator driving the gain;
//! disabling removes it and returns the stage to unity. The oscillator exists
//! exactly while the modulator is enabled.

use crate::context::{AudioContext, NodeId, OscillatorType, ParamName};
use crate::property::{ListenerId, Property};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use tracing::trace;

/// Glide applied to live frequency and depth changes, in seconds
const PARAMETER_TIME_CONSTANT: f64 = 0.015;

/// Options for [`AmplitudeModulator`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AmplitudeModulatorOptions {
    pub initially_enabled: bool,
    /// Modulation rate, in Hz
    pub frequency: f64,
    /// Modulation depth in [0, 1]; 1 swings the gain all the way to zero
    pub depth: f64,
    pub waveform: OscillatorType,
}

impl Default for AmplitudeModulatorOptions {
    fn default() -> Self {
        Self {
            initially_enabled: true,
            frequency: 5.0,
            depth: 1.0,
            waveform: OscillatorType::Sine,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Lfo {
    oscillator: NodeId,
    attenuator: NodeId,
}

struct ModulatorInner {
    context: AudioContext,
    gain: NodeId,
    lfo: RefCell<Option<Lfo>>,
    frequency: Cell<f64>,
    depth: Cell<f64>,
    waveform: Cell<OscillatorType>,
    enabled: Property<bool>,
    enabled_link: Cell<Option<ListenerId>>,
}

impl ModulatorInner {
    fn create_lfo(&self) {
        debug_assert!(self.lfo.borrow().is_none(), "LFO already exists");
        let context = &self.context;
        let now = context.current_time();

        let oscillator = context.create_oscillator();
        context.set_oscillator_type(oscillator, self.waveform.get());
        context
            .param(oscillator, ParamName::Frequency)
            .set_value_at_time(self.frequency.get(), now);

        let attenuator = context.create_gain();
        context
            .param(attenuator, ParamName::Gain)
            .set_value_at_time(self.depth.get() / 2.0, now);
        context.connect(oscillator, attenuator);
        context.connect_param(attenuator, self.gain, ParamName::Gain);

        let gain = context.param(self.gain, ParamName::Gain);
        gain.cancel_scheduled_values(now);
        gain.set_value_at_time(1.0 - self.depth.get() / 2.0, now);

        context.start_source(oscillator, now, 0.0);
        *self.lfo.borrow_mut() = Some(Lfo {
            oscillator,
            attenuator,
        });
        trace!(frequency = self.frequency.get(), depth = self.depth.get(), "LFO created");
    }

    fn remove_lfo(&self) {
        let Some(lfo) = self.lfo.borrow_mut().take() else {
            return;
        };
        let context = &self.context;
        let now = context.current_time();
        context.stop_source(lfo.oscillator, now);
        context.remove_node(lfo.oscillator);
        context.remove_node(lfo.attenuator);

        let gain = context.param(self.gain, ParamName::Gain);
        gain.cancel_scheduled_values(now);
        gain.set_value_at_time(1.0, now);
        trace!("LFO removed");
    }
}

/// Pass-through stage with optional LFO amplitude modulation.
#[derive(Clone)]
pub struct AmplitudeModulator {
    inner: Rc<ModulatorInner>,
}

impl AmplitudeModulator {
    pub fn new(context: &AudioContext, options: AmplitudeModulatorOptions) -> Self {
        let gain = context.create_gain();
        context
            .param(gain, ParamName::Gain)
            .set_value_at_time(1.0, context.current_time());

        let inner = Rc::new_cyclic(|weak: &Weak<ModulatorInner>| {
            let enabled = Property::new(options.initially_enabled);
            let weak = weak.clone();
            let link = enabled.lazy_link(move |enabled, _| {
                if let Some(inner) = weak.upgrade() {
                    if *enabled {
                        inner.create_lfo();
                    } else {
                        inner.remove_lfo();
                    }
                }
            });
            ModulatorInner {
                context: context.clone(),
                gain,
                lfo: RefCell::new(None),
                frequency: Cell::new(options.frequency),
                depth: Cell::new(options.depth),
                waveform: Cell::new(options.waveform),
                enabled,
                enabled_link: Cell::new(Some(link)),
            }
        });
        if options.initially_enabled {
            inner.create_lfo();
        }
        Self { inner }
    }

    /// Where upstream audio is connected
    pub fn input(&self) -> NodeId {
        self.inner.gain
    }

    pub fn output(&self) -> NodeId {
        self.inner.gain
    }

    pub fn connect(&self, destination: NodeId) {
        self.inner.context.connect(self.inner.gain, destination);
    }

    pub fn disconnect(&self, destination: NodeId) {
        self.inner.context.disconnect(self.inner.gain, destination);
    }

    /// Observable enable flag. Setting it adds or removes the LFO.
    pub fn enabled_property(&self) -> Property<bool> {
        self.inner.enabled.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.get()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.set(enabled);
    }

    pub fn has_lfo(&self) -> bool {
        self.inner.lfo.borrow().is_some()
    }

    pub fn frequency(&self) -> f64 {
        self.inner.frequency.get()
    }

    pub fn set_frequency(&self, frequency: f64) {
        self.inner.frequency.set(frequency);
        if let Some(lfo) = *self.inner.lfo.borrow() {
            let context = &self.inner.context;
            let param = context.param(lfo.oscillator, ParamName::Frequency);
            param.hold_current_value();
            param.set_target_at_time(frequency, context.current_time(), PARAMETER_TIME_CONSTANT);
        }
    }

    pub fn depth(&self) -> f64 {
        self.inner.depth.get()
    }

    pub fn set_depth(&self, depth: f64) {
        debug_assert!((0.0..=1.0).contains(&depth), "depth must be in [0, 1]");
        self.inner.depth.set(depth);
        if let Some(lfo) = *self.inner.lfo.borrow() {
            let context = &self.inner.context;
            let now = context.current_time();
            let attenuator = context.param(lfo.attenuator, ParamName::Gain);
            attenuator.hold_current_value();
            attenuator.set_target_at_time(depth / 2.0, now, PARAMETER_TIME_CONSTANT);
            let gain = context.param(self.inner.gain, ParamName::Gain);
            gain.hold_current_value();
            gain.set_target_at_time(1.0 - depth / 2.0, now, PARAMETER_TIME_CONSTANT);
        }
    }

    pub fn waveform(&self) -> OscillatorType {
        self.inner.waveform.get()
    }

    pub fn set_waveform(&self, waveform: OscillatorType) {
        self.inner.waveform.set(waveform);
        if let Some(lfo) = *self.inner.lfo.borrow() {
            self.inner.context.set_oscillator_type(lfo.oscillator, waveform);
        }
    }

    pub fn lfo_oscillator(&self) -> Option<NodeId> {
        self.inner.lfo.borrow().map(|lfo| lfo.oscillator)
    }

    pub fn dispose(&self) {
        if let Some(link) = self.inner.enabled_link.take() {
            self.inner.enabled.unlink(link);
        }
        self.inner.remove_lfo();
    }
}
