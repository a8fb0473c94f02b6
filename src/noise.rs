//! Noise Generator
//!
//! A looping pre-computed noise buffer, optionally filtered and
//! amplitude-modulated by a low-frequency oscillator.
//!
//! ```text
//!   noise source ─► [high-pass] ─► [low-pass] ─► [band-pass] ─► lfo gain ─► generator gain
//!                                                                  ▲
//!                                              lfo ─► depth gain ──┘ (gain param)
//! ```

use crate::buffer::AudioBuffer;
use crate::clip::{fade_out, DEFERRED_PLAY_DELAY};
use crate::context::{AudioContext, FilterType, NodeId, OscillatorType, ParamName};
use crate::deferred::DeferredStart;
use crate::generator::{GeneratorCore, GeneratorOptions, SoundGenerator};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tracing::debug;

/// Length of the pre-computed noise buffer, in seconds
pub const NOISE_BUFFER_DURATION: f64 = 2.0;

/// Spectral shape of the noise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseType {
    White,
    #[default]
    Pink,
    Brown,
}

/// Options for [`NoiseGenerator`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseGeneratorOptions {
    pub noise_type: NoiseType,
    pub low_pass_cutoff_frequency: Option<f64>,
    pub high_pass_cutoff_frequency: Option<f64>,
    pub band_pass_center_frequency: Option<f64>,
    pub band_pass_q: f64,
    pub lfo_initially_enabled: bool,
    pub lfo_frequency: f64,
    /// 0 is no modulation, 1 swings the level all the way to silence
    pub lfo_depth: f64,
    pub lfo_type: OscillatorType,
    /// Fixed seed for reproducible buffers
    pub seed: Option<u64>,
    #[serde(flatten)]
    pub generator: GeneratorOptions,
}

impl Default for NoiseGeneratorOptions {
    fn default() -> Self {
        Self {
            noise_type: NoiseType::Pink,
            low_pass_cutoff_frequency: None,
            high_pass_cutoff_frequency: None,
            band_pass_center_frequency: None,
            band_pass_q: 1.0,
            lfo_initially_enabled: false,
            lfo_frequency: 2.0,
            lfo_depth: 1.0,
            lfo_type: OscillatorType::Sine,
            seed: None,
            generator: GeneratorOptions::default(),
        }
    }
}

/// Fill `length` samples of noise in [-1, 1].
pub fn generate_noise<R: Rng>(noise_type: NoiseType, length: usize, rng: &mut R) -> Vec<f32> {
    let mut samples = Vec::with_capacity(length);
    match noise_type {
        NoiseType::White => {
            for _ in 0..length {
                samples.push(rng.gen_range(-1.0_f32..=1.0));
            }
        }
        NoiseType::Pink => {
            // Paul Kellet's refined pink filter
            let mut b = [0.0_f32; 7];
            for _ in 0..length {
                let white = rng.gen_range(-1.0_f32..=1.0);
                b[0] = 0.99886 * b[0] + white * 0.055_517_9;
                b[1] = 0.99332 * b[1] + white * 0.075_075_9;
                b[2] = 0.969 * b[2] + white * 0.153_852;
                b[3] = 0.8665 * b[3] + white * 0.310_485_6;
                b[4] = 0.55 * b[4] + white * 0.532_952_2;
                b[5] = -0.7616 * b[5] - white * 0.016_898;
                let pink = b.iter().sum::<f32>() + white * 0.5362;
                b[6] = white * 0.115_926;
                samples.push((pink * 0.11).clamp(-1.0, 1.0));
            }
        }
        NoiseType::Brown => {
            let mut last = 0.0_f32;
            for _ in 0..length {
                let white = rng.gen_range(-1.0_f32..=1.0);
                last = (last + 0.02 * white) / 1.02;
                samples.push((last * 3.5).clamp(-1.0, 1.0));
            }
        }
    }
    samples
}

struct Lfo {
    oscillator: NodeId,
    depth_gain: NodeId,
}

struct NoiseInner {
    core: Rc<GeneratorCore>,
    buffer: AudioBuffer,
    input: NodeId,
    lfo_gain: NodeId,
    filters: Vec<NodeId>,
    source: Cell<Option<NodeId>>,
    lfo: RefCell<Option<Lfo>>,
    lfo_frequency: Cell<f64>,
    lfo_depth: Cell<f64>,
    lfo_type: OscillatorType,
    deferred: DeferredStart,
}

/// Continuous filtered noise.
#[derive(Clone)]
pub struct NoiseGenerator {
    inner: Rc<NoiseInner>,
}

impl NoiseGenerator {
    pub fn new(context: &AudioContext, options: NoiseGeneratorOptions) -> Self {
        let length = (context.sample_rate() * NOISE_BUFFER_DURATION) as usize;
        let samples = match options.seed {
            Some(seed) => generate_noise(options.noise_type, length, &mut StdRng::seed_from_u64(seed)),
            None => generate_noise(options.noise_type, length, &mut rand::thread_rng()),
        };
        let buffer = AudioBuffer::from_channels(vec![samples], context.sample_rate());

        let core = GeneratorCore::new(context, options.generator);
        let lfo_gain = context.create_gain();
        context.connect(lfo_gain, core.gain_node());

        let mut filters = Vec::new();
        if let Some(cutoff) = options.high_pass_cutoff_frequency {
            filters.push(Self::create_filter(context, FilterType::Highpass, cutoff, None));
        }
        if let Some(cutoff) = options.low_pass_cutoff_frequency {
            filters.push(Self::create_filter(context, FilterType::Lowpass, cutoff, None));
        }
        if let Some(center) = options.band_pass_center_frequency {
            filters.push(Self::create_filter(
                context,
                FilterType::Bandpass,
                center,
                Some(options.band_pass_q),
            ));
        }
        for pair in filters.windows(2) {
            context.connect(pair[0], pair[1]);
        }
        let input = match (filters.first(), filters.last()) {
            (Some(&first), Some(&last)) => {
                context.connect(last, lfo_gain);
                first
            }
            _ => lfo_gain,
        };

        let generator = Self {
            inner: Rc::new(NoiseInner {
                core,
                buffer,
                input,
                lfo_gain,
                filters,
                source: Cell::new(None),
                lfo: RefCell::new(None),
                lfo_frequency: Cell::new(options.lfo_frequency),
                lfo_depth: Cell::new(options.lfo_depth),
                lfo_type: options.lfo_type,
                deferred: DeferredStart::new(context.clone()),
            }),
        };
        generator.set_lfo_enabled(options.lfo_initially_enabled);
        generator
    }

    fn create_filter(context: &AudioContext, kind: FilterType, frequency: f64, q: Option<f64>) -> NodeId {
        let filter = context.create_biquad_filter(kind);
        let now = context.current_time();
        context
            .param(filter, ParamName::Frequency)
            .set_value_at_time(frequency, now);
        if let Some(q) = q {
            context.param(filter, ParamName::Q).set_value_at_time(q, now);
        }
        filter
    }

    fn filter(&self, kind: FilterType) -> Option<NodeId> {
        let context = self.inner.core.context();
        self.inner
            .filters
            .iter()
            .copied()
            .find(|f| context.filter_type(*f) == Some(kind))
    }

    /// Start the noise `delay` seconds from now, deferring until the session
    /// runs if it is not running yet.
    pub fn start(&self, delay: f64) {
        let inner = &self.inner;
        if inner.source.get().is_some() {
            return;
        }
        let context = inner.core.context();
        if !context.is_running() {
            let weak = Rc::downgrade(inner);
            inner.deferred.request(move |elapsed| {
                if let Some(inner) = weak.upgrade() {
                    debug!(elapsed, "starting deferred noise");
                    NoiseGenerator { inner }.start(delay + DEFERRED_PLAY_DELAY);
                }
            });
            return;
        }

        self.apply_lfo_base_level();
        let source = context.create_buffer_source();
        context.set_buffer(source, inner.buffer.clone());
        context.set_loop(source, true, 0.0, inner.buffer.duration());
        context.connect(source, inner.input);
        context.start_source(source, context.current_time() + delay.max(0.0), 0.0);
        inner.source.set(Some(source));
    }

    /// Fade out and stop `time` seconds from now.
    pub fn stop(&self, time: f64) {
        let inner = &self.inner;
        inner.deferred.cancel();
        if let Some(source) = inner.source.take() {
            let context = inner.core.context();
            let stop_time = fade_out(context, inner.lfo_gain, time);
            context.stop_source(source, stop_time);
        }
    }

    pub fn is_playing(&self) -> bool {
        self.inner.source.get().is_some()
    }

    pub fn has_deferred_start(&self) -> bool {
        self.inner.deferred.is_pending()
    }

    pub fn buffer(&self) -> &AudioBuffer {
        &self.inner.buffer
    }

    // -------------------------------------------------------------------------
    // Filters
    // -------------------------------------------------------------------------

    pub fn set_low_pass_cutoff_frequency(&self, frequency: f64, time_constant: f64) {
        self.ramp_filter(FilterType::Lowpass, frequency, time_constant);
    }

    pub fn set_high_pass_cutoff_frequency(&self, frequency: f64, time_constant: f64) {
        self.ramp_filter(FilterType::Highpass, frequency, time_constant);
    }

    pub fn set_band_pass_center_frequency(&self, frequency: f64, time_constant: f64) {
        self.ramp_filter(FilterType::Bandpass, frequency, time_constant);
    }

    fn ramp_filter(&self, kind: FilterType, frequency: f64, time_constant: f64) {
        let filter = self.filter(kind);
        debug_assert!(filter.is_some(), "no {:?} filter was configured", kind);
        let Some(filter) = filter else {
            return;
        };
        let context = self.inner.core.context();
        let param = context.param(filter, ParamName::Frequency);
        param.hold_current_value();
        param.set_target_at_time(frequency, context.current_time(), time_constant);
    }

    // -------------------------------------------------------------------------
    // LFO
    // -------------------------------------------------------------------------

    pub fn set_lfo_enabled(&self, enabled: bool) {
        let inner = &self.inner;
        let context = inner.core.context();
        let mut lfo = inner.lfo.borrow_mut();
        match (enabled, lfo.is_some()) {
            (true, false) => {
                let oscillator = context.create_oscillator();
                context.set_oscillator_type(oscillator, inner.lfo_type);
                let now = context.current_time();
                context
                    .param(oscillator, ParamName::Frequency)
                    .set_value_at_time(inner.lfo_frequency.get(), now);
                let depth_gain = context.create_gain();
                context
                    .param(depth_gain, ParamName::Gain)
                    .set_value_at_time(inner.lfo_depth.get() / 2.0, now);
                context.connect(oscillator, depth_gain);
                context.connect_param(depth_gain, inner.lfo_gain, ParamName::Gain);
                context.start_source(oscillator, now, 0.0);
                *lfo = Some(Lfo {
                    oscillator,
                    depth_gain,
                });
            }
            (false, true) => {
                if let Some(old) = lfo.take() {
                    context.stop_source(old.oscillator, context.current_time());
                    context.remove_node(old.oscillator);
                    context.remove_node(old.depth_gain);
                }
            }
            _ => {}
        }
        drop(lfo);
        self.apply_lfo_base_level();
    }

    /// The modulated gain swings between `1 - depth` and 1 while the LFO
    /// runs, and sits at unity otherwise.
    fn apply_lfo_base_level(&self) {
        let inner = &self.inner;
        let context = inner.core.context();
        let base = if inner.lfo.borrow().is_some() {
            1.0 - inner.lfo_depth.get() / 2.0
        } else {
            1.0
        };
        let param = context.param(inner.lfo_gain, ParamName::Gain);
        param.cancel_scheduled_values(context.current_time());
        param.set_value_at_time(base, context.current_time());
    }

    pub fn is_lfo_enabled(&self) -> bool {
        self.inner.lfo.borrow().is_some()
    }

    pub fn set_lfo_frequency(&self, frequency: f64) {
        self.inner.lfo_frequency.set(frequency);
        if let Some(lfo) = self.inner.lfo.borrow().as_ref() {
            let context = self.inner.core.context();
            context
                .param(lfo.oscillator, ParamName::Frequency)
                .set_target_at_time(frequency, context.current_time(), 0.015);
        }
    }

    pub fn set_lfo_depth(&self, depth: f64) {
        self.inner.lfo_depth.set(depth);
        if let Some(lfo) = self.inner.lfo.borrow().as_ref() {
            let context = self.inner.core.context();
            context
                .param(lfo.depth_gain, ParamName::Gain)
                .set_target_at_time(depth / 2.0, context.current_time(), 0.015);
        }
        if self.inner.source.get().is_some() {
            self.apply_lfo_base_level();
        }
    }

    pub fn lfo_gain_node(&self) -> NodeId {
        self.inner.lfo_gain
    }
}

impl SoundGenerator for NoiseGenerator {
    fn core(&self) -> &Rc<GeneratorCore> {
        &self.inner.core
    }

    fn dispose(&self) {
        self.stop(0.0);
        self.set_lfo_enabled(false);
        self.inner.core.dispose();
    }
}
