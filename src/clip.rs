//! Sound Clip
//!
//! Plays one decoded buffer as a one-shot or a loop.
//!
//! ```text
//!   source ─┐
//!   source ─┼─► local gain (stop fades) ──► generator gain ──► mix
//!   source ─┘
//! ```
//!
//! A one-shot may have several instances in flight at once; a loop has at
//! most one. Instances are never reused. Playback and loop points use the
//! buffer's detected sound bounds so recorded silence adds no latency.

use crate::buffer::{AudioBuffer, WrappedAudioBuffer};
use crate::context::{AudioContext, NodeId, ParamName};
use crate::deferred::DeferredStart;
use crate::generator::{GeneratorCore, GeneratorOptions, SoundGenerator};
use crate::player::SoundPlayer;
use crate::property::{ListenerId, Property, ReadOnlyProperty};
use crate::sound_utils::{detect_sound_bounds, SoundBounds, DEFAULT_SILENCE_THRESHOLD};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use tracing::{debug, trace};

/// One-shot requests older than this when the session resumes are dropped
pub const MAX_PLAY_DEFER_TIME: f64 = 0.2;

/// Start delay for deferred plays, which avoids platform fade-in muting
pub const DEFERRED_PLAY_DELAY: f64 = 0.1;

/// Default fade time for `stop`
pub const DEFAULT_STOP_DELAY: f64 = 0.0;

/// Shortest time constant used for stop fades
pub const MIN_STOP_TIME_CONSTANT: f64 = 0.005;

/// Options for [`SoundClip`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoundClipOptions {
    pub loops: bool,

    /// Play and loop between the detected sound bounds
    pub trim_silence: bool,

    /// One-shots only: allow `play` while not fully enabled
    pub initiate_when_disabled: bool,

    /// Whether `set_playback_rate` also ramps instances already playing
    pub rate_changes_affect_playing_sounds: bool,

    pub initial_playback_rate: f64,

    #[serde(flatten)]
    pub generator: GeneratorOptions,
}

impl Default for SoundClipOptions {
    fn default() -> Self {
        Self {
            loops: false,
            trim_silence: true,
            initiate_when_disabled: false,
            rate_changes_affect_playing_sounds: true,
            initial_playback_rate: 1.0,
            generator: GeneratorOptions::default(),
        }
    }
}

impl SoundClipOptions {
    pub fn looping() -> Self {
        Self {
            loops: true,
            ..Self::default()
        }
    }
}

/// Ramp a gain to silence and return the time at which it is silent enough
/// to stop the sources feeding it.
pub(crate) fn fade_out(context: &AudioContext, gain: NodeId, delay: f64) -> f64 {
    let now = context.current_time();
    let time_constant = (delay / 5.0).max(MIN_STOP_TIME_CONSTANT);
    let param = context.param(gain, ParamName::Gain);
    param.hold_current_value();
    param.set_target_at_time(0.0, now, time_constant);
    now + time_constant * 5.0
}

/// Reset a fade gain to unity for a new instance.
pub(crate) fn restore_gain(context: &AudioContext, gain: NodeId) {
    let now = context.current_time();
    let param = context.param(gain, ParamName::Gain);
    param.cancel_scheduled_values(now);
    param.set_value_at_time(1.0, now);
}

struct ClipInner {
    core: Rc<GeneratorCore>,
    buffer: WrappedAudioBuffer,
    local_gain: NodeId,
    loops: bool,
    trim_silence: bool,
    initiate_when_disabled: bool,
    rate_changes_affect_playing_sounds: bool,
    playback_rate: Cell<f64>,
    active: RefCell<Vec<NodeId>>,
    bounds: Cell<Option<SoundBounds>>,
    is_playing: Property<bool>,
    deferred: DeferredStart,
    play_when_ready: Cell<bool>,
    enabled_link: Cell<Option<ListenerId>>,
    ready_link: Cell<Option<ListenerId>>,
}

/// A generator that plays a single decoded buffer.
#[derive(Clone)]
pub struct SoundClip {
    inner: Rc<ClipInner>,
}

impl SoundClip {
    pub fn new(context: &AudioContext, buffer: WrappedAudioBuffer, options: SoundClipOptions) -> Self {
        debug_assert!(
            options.initial_playback_rate > 0.0,
            "playback rate must be positive"
        );
        let core = GeneratorCore::new(context, options.generator);
        let local_gain = context.create_gain();
        context.connect(local_gain, core.gain_node());

        let inner = Rc::new_cyclic(|weak: &Weak<ClipInner>| {
            let w = weak.clone();
            let enabled_link = core.fully_enabled_property().lazy_link(move |enabled, _| {
                let Some(inner) = w.upgrade() else {
                    return;
                };
                if !*enabled && (inner.loops || !inner.initiate_when_disabled) {
                    SoundClip { inner }.stop(DEFAULT_STOP_DELAY);
                }
            });
            ClipInner {
                core,
                buffer: buffer.clone(),
                local_gain,
                loops: options.loops,
                trim_silence: options.trim_silence,
                initiate_when_disabled: options.initiate_when_disabled,
                rate_changes_affect_playing_sounds: options.rate_changes_affect_playing_sounds,
                playback_rate: Cell::new(options.initial_playback_rate),
                active: RefCell::new(Vec::new()),
                bounds: Cell::new(None),
                is_playing: Property::new(false),
                deferred: DeferredStart::new(context.clone()),
                play_when_ready: Cell::new(false),
                enabled_link: Cell::new(Some(enabled_link)),
                ready_link: Cell::new(None),
            }
        });

        let weak = Rc::downgrade(&inner);
        let ready_link = buffer.when_ready(move |buffer| {
            if let Some(inner) = weak.upgrade() {
                SoundClip { inner }.on_buffer_ready(buffer);
            }
        });
        inner.ready_link.set(ready_link);

        Self { inner }
    }

    fn on_buffer_ready(&self, buffer: &AudioBuffer) {
        let bounds = self.bounds_for(buffer);
        trace!(start = bounds.start, end = bounds.end, "clip buffer ready");
        if self.inner.play_when_ready.replace(false) {
            self.play(0.0);
        }
    }

    fn bounds_for(&self, buffer: &AudioBuffer) -> SoundBounds {
        if let Some(bounds) = self.inner.bounds.get() {
            return bounds;
        }
        let bounds = if self.inner.trim_silence {
            detect_sound_bounds(buffer, DEFAULT_SILENCE_THRESHOLD)
        } else {
            SoundBounds {
                start: 0.0,
                end: buffer.duration(),
            }
        };
        self.inner.bounds.set(Some(bounds));
        bounds
    }

    /// Start playing `delay` seconds from now.
    ///
    /// When the session is not running the request is deferred until it
    /// resumes. Loops are always honored on resume; one-shots only if the
    /// request is still fresh.
    pub fn play(&self, delay: f64) {
        let inner = &self.inner;
        let allowed =
            inner.core.is_fully_enabled() || (inner.initiate_when_disabled && !inner.loops);
        if !allowed {
            trace!(generator = inner.core.id().raw(), "play ignored while disabled");
            return;
        }
        if inner.loops && inner.is_playing.get() {
            return;
        }

        let context = inner.core.context();
        if !context.is_running() {
            let weak = Rc::downgrade(inner);
            let loops = inner.loops;
            inner.deferred.request(move |elapsed| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if loops || elapsed < MAX_PLAY_DEFER_TIME {
                    SoundClip { inner }.play(delay + DEFERRED_PLAY_DELAY);
                } else {
                    debug!(elapsed, "dropping stale deferred play request");
                }
            });
            return;
        }

        match inner.buffer.get() {
            Some(buffer) => self.start_instance(&buffer, delay),
            None if inner.loops => inner.play_when_ready.set(true),
            None => trace!("one-shot play ignored, buffer not decoded yet"),
        }
    }

    fn start_instance(&self, buffer: &AudioBuffer, delay: f64) {
        let inner = &self.inner;
        let context = inner.core.context();
        let now = context.current_time();
        let bounds = self.bounds_for(buffer);
        let rate = inner.playback_rate.get();

        restore_gain(context, inner.local_gain);

        let source = context.create_buffer_source();
        context.set_buffer(source, buffer.clone());
        context
            .param(source, ParamName::PlaybackRate)
            .set_value_at_time(rate, now);
        context.connect(source, inner.local_gain);

        let start_time = now + delay.max(0.0);
        if inner.loops {
            context.set_loop(source, true, bounds.start, bounds.end);
            context.start_source(source, start_time, bounds.start);
        } else {
            context.start_source(source, start_time, bounds.start);
            if inner.trim_silence {
                context.stop_source(source, start_time + bounds.duration() / rate);
            }
        }

        let weak = Rc::downgrade(inner);
        context.set_on_ended(source, move || {
            if let Some(inner) = weak.upgrade() {
                inner.active.borrow_mut().retain(|s| *s != source);
                inner.core.context().remove_node(source);
                inner.is_playing.set(!inner.active.borrow().is_empty());
            }
        });

        inner.active.borrow_mut().push(source);
        inner.is_playing.set(true);
    }

    /// Fade out over `delay` seconds and stop every active instance.
    ///
    /// The active list is cleared immediately rather than waiting for end
    /// notifications. Any deferred play is cancelled.
    pub fn stop(&self, delay: f64) {
        let inner = &self.inner;
        inner.deferred.cancel();
        inner.play_when_ready.set(false);

        let sources: Vec<NodeId> = inner.active.borrow_mut().drain(..).collect();
        if !sources.is_empty() {
            let context = inner.core.context();
            let stop_time = fade_out(context, inner.local_gain, delay);
            for source in sources {
                context.stop_source(source, stop_time);
            }
        }
        inner.is_playing.set(false);
    }

    /// Set the playback rate for future instances and, if configured, ramp
    /// instances already playing.
    pub fn set_playback_rate(&self, rate: f64, time_constant: f64) {
        debug_assert!(rate > 0.0, "playback rate must be positive, got {}", rate);
        let inner = &self.inner;
        inner.playback_rate.set(rate);
        if !inner.rate_changes_affect_playing_sounds {
            return;
        }
        let context = inner.core.context();
        let now = context.current_time();
        for &source in inner.active.borrow().iter() {
            let param = context.param(source, ParamName::PlaybackRate);
            if time_constant == 0.0 {
                param.cancel_scheduled_values(now);
                param.set_value_at_time(rate, now);
            } else {
                param.hold_current_value();
                param.set_target_at_time(rate, now, time_constant);
            }
        }
    }

    pub fn playback_rate(&self) -> f64 {
        self.inner.playback_rate.get()
    }

    pub fn is_playing(&self) -> bool {
        self.inner.is_playing.get()
    }

    pub fn is_playing_property(&self) -> ReadOnlyProperty<bool> {
        self.inner.is_playing.read_only()
    }

    pub fn is_loop(&self) -> bool {
        self.inner.loops
    }

    pub fn active_instance_count(&self) -> usize {
        self.inner.active.borrow().len()
    }

    /// Sources currently tracked as playing
    pub fn active_sources(&self) -> Vec<NodeId> {
        self.inner.active.borrow().clone()
    }

    pub fn has_deferred_play(&self) -> bool {
        self.inner.deferred.is_pending()
    }

    pub fn buffer(&self) -> &WrappedAudioBuffer {
        &self.inner.buffer
    }

    /// Detected sound bounds, once the buffer is ready
    pub fn sound_bounds(&self) -> Option<SoundBounds> {
        self.inner.bounds.get()
    }

    pub fn local_gain_node(&self) -> NodeId {
        self.inner.local_gain
    }
}

impl SoundGenerator for SoundClip {
    fn core(&self) -> &Rc<GeneratorCore> {
        &self.inner.core
    }

    fn dispose(&self) {
        if self.inner.core.is_disposed() {
            return;
        }
        self.stop(0.0);
        if let Some(link) = self.inner.enabled_link.take() {
            self.inner.core.fully_enabled_property().unlink(link);
        }
        if let Some(link) = self.inner.ready_link.take() {
            self.inner.buffer.unlink(link);
        }
        self.inner.core.dispose();
    }
}

impl SoundPlayer for SoundClip {
    fn play(&self) {
        SoundClip::play(self, 0.0);
    }

    fn stop(&self) {
        SoundClip::stop(self, DEFAULT_STOP_DELAY);
    }

    fn set_playback_rate(&self, rate: f64) {
        SoundClip::set_playback_rate(self, rate, 0.0);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// One second at 1 kHz: 100 ms of silence, 800 ms of sound, 100 ms of silence.
    pub(crate) fn padded_buffer() -> AudioBuffer {
        let mut samples = vec![0.0_f32; 1000];
        for s in &mut samples[100..900] {
            *s = 0.5;
        }
        AudioBuffer::from_channels(vec![samples], 1000.0)
    }

    pub(crate) fn one_shot(ctx: &AudioContext) -> SoundClip {
        SoundClip::new(
            ctx,
            WrappedAudioBuffer::ready(padded_buffer()),
            SoundClipOptions::default(),
        )
    }

    fn looped(ctx: &AudioContext) -> SoundClip {
        SoundClip::new(
            ctx,
            WrappedAudioBuffer::ready(padded_buffer()),
            SoundClipOptions::looping(),
        )
    }

    #[test]
    fn test_one_shots_overlap_and_end_independently() {
        let ctx = AudioContext::new_running(44100.0);
        let clip = one_shot(&ctx);
        clip.play(0.0);
        ctx.advance(0.3);
        clip.play(0.0);
        clip.play(0.0);
        assert_eq!(clip.active_instance_count(), 3);

        ctx.advance(0.6);
        assert_eq!(clip.active_instance_count(), 2, "first instance trimmed to 0.8 s");
        ctx.advance(0.3);
        assert_eq!(clip.active_instance_count(), 0);
        assert!(!clip.is_playing());
        assert_eq!(ctx.active_source_count(), 0);
    }

    #[test]
    fn test_loop_play_is_idempotent() {
        let ctx = AudioContext::new_running(44100.0);
        let clip = looped(&ctx);
        clip.play(0.0);
        clip.play(0.0);
        assert_eq!(clip.active_instance_count(), 1);
        ctx.advance(10.0);
        assert!(clip.is_playing());
    }

    #[test]
    fn test_loop_points_use_sound_bounds() {
        let ctx = AudioContext::new_running(44100.0);
        let clip = looped(&ctx);
        clip.play(0.0);
        let source = clip.active_sources()[0];
        let (looping, start, end) = ctx.loop_points(source).unwrap();
        assert!(looping);
        assert_relative_eq!(start, 0.1);
        assert_relative_eq!(end, 0.9);
        assert_relative_eq!(ctx.source_offset(source).unwrap(), 0.1);
    }

    #[test]
    fn test_untrimmed_clip_uses_full_buffer() {
        let ctx = AudioContext::new_running(44100.0);
        let clip = SoundClip::new(
            &ctx,
            WrappedAudioBuffer::ready(padded_buffer()),
            SoundClipOptions {
                trim_silence: false,
                ..Default::default()
            },
        );
        clip.play(0.0);
        ctx.advance(0.95);
        assert_eq!(clip.active_instance_count(), 1);
        ctx.advance(0.1);
        assert_eq!(clip.active_instance_count(), 0);
    }

    #[test]
    fn test_stop_fades_then_stops_and_clears_immediately() {
        let ctx = AudioContext::new_running(44100.0);
        let clip = looped(&ctx);
        clip.play(0.0);
        ctx.advance(1.0);
        let source = clip.active_sources()[0];

        clip.stop(0.5);
        assert_eq!(clip.active_instance_count(), 0);
        assert!(!clip.is_playing());
        assert_relative_eq!(ctx.source_stop_time(source).unwrap(), 1.5);

        let gain = ctx.param(clip.local_gain_node(), ParamName::Gain);
        assert_relative_eq!(gain.value_at(1.1), libm::exp(-1.0), epsilon = 1e-9);
    }

    #[test]
    fn test_zero_delay_stop_uses_minimum_fade() {
        let ctx = AudioContext::new_running(44100.0);
        let clip = one_shot(&ctx);
        clip.play(0.0);
        let source = clip.active_sources()[0];
        clip.stop(0.0);
        assert_relative_eq!(
            ctx.source_stop_time(source).unwrap(),
            MIN_STOP_TIME_CONSTANT * 5.0
        );
    }

    #[test]
    fn test_deferred_play_fires_on_resume() {
        let ctx = AudioContext::new(44100.0);
        let clip = one_shot(&ctx);
        clip.play(0.0);
        assert_eq!(clip.active_instance_count(), 0);
        assert!(clip.has_deferred_play());

        ctx.advance(0.05);
        ctx.resume().unwrap();
        assert_eq!(clip.active_instance_count(), 1);
        assert!(!clip.has_deferred_play());
        ctx.advance(0.5);
        assert!(clip.is_playing());
    }

    #[test]
    fn test_stale_one_shot_is_dropped() {
        let ctx = AudioContext::new(44100.0);
        let clip = one_shot(&ctx);
        clip.play(0.0);
        ctx.advance(MAX_PLAY_DEFER_TIME + 0.1);
        ctx.resume().unwrap();
        assert_eq!(clip.active_instance_count(), 0);
    }

    #[test]
    fn test_stale_loop_is_still_honored() {
        let ctx = AudioContext::new(44100.0);
        let clip = looped(&ctx);
        clip.play(0.0);
        ctx.advance(30.0);
        ctx.resume().unwrap();
        assert_eq!(clip.active_instance_count(), 1);
    }

    #[test]
    fn test_stop_cancels_deferred_play() {
        let ctx = AudioContext::new(44100.0);
        let clip = looped(&ctx);
        clip.play(0.0);
        clip.stop(0.0);
        ctx.resume().unwrap();
        assert_eq!(clip.active_instance_count(), 0);
    }

    #[test]
    fn test_disable_force_stops_loop() {
        let ctx = AudioContext::new_running(44100.0);
        let clip = looped(&ctx);
        clip.play(0.0);
        clip.enabled_property().set(false);
        assert!(!clip.is_playing());
        clip.play(0.0);
        assert!(!clip.is_playing(), "loops cannot start while disabled");
    }

    #[test]
    fn test_initiate_when_disabled_one_shot() {
        let ctx = AudioContext::new_running(44100.0);
        let clip = SoundClip::new(
            &ctx,
            WrappedAudioBuffer::ready(padded_buffer()),
            SoundClipOptions {
                initiate_when_disabled: true,
                ..Default::default()
            },
        );
        clip.play(0.0);
        clip.enabled_property().set(false);
        assert_eq!(clip.active_instance_count(), 1, "tail is not cut off");
        clip.play(0.0);
        assert_eq!(clip.active_instance_count(), 2);
    }

    #[test]
    fn test_loop_starts_when_buffer_arrives() {
        let ctx = AudioContext::new_running(44100.0);
        let wrapped = WrappedAudioBuffer::new();
        let clip = SoundClip::new(&ctx, wrapped.clone(), SoundClipOptions::looping());
        clip.play(0.0);
        assert!(!clip.is_playing());
        wrapped.set(padded_buffer());
        assert!(clip.is_playing());
        assert!(clip.sound_bounds().is_some());
    }

    #[test]
    fn test_playback_rate_ramps_active_instances() {
        let ctx = AudioContext::new_running(44100.0);
        let clip = looped(&ctx);
        clip.play(0.0);
        let source = clip.active_sources()[0];
        clip.set_playback_rate(2.0, 0.0);
        assert_relative_eq!(ctx.param(source, ParamName::PlaybackRate).value(), 2.0);
    }

    #[test]
    fn test_playback_rate_only_for_new_instances() {
        let ctx = AudioContext::new_running(44100.0);
        let clip = SoundClip::new(
            &ctx,
            WrappedAudioBuffer::ready(padded_buffer()),
            SoundClipOptions {
                loops: true,
                rate_changes_affect_playing_sounds: false,
                ..Default::default()
            },
        );
        clip.play(0.0);
        let source = clip.active_sources()[0];
        clip.set_playback_rate(0.5, 0.0);
        assert_relative_eq!(ctx.param(source, ParamName::PlaybackRate).value(), 1.0);
        assert_relative_eq!(clip.playback_rate(), 0.5);
    }

    #[test]
    #[should_panic(expected = "playback rate must be positive")]
    fn test_non_positive_rate_asserts() {
        let ctx = AudioContext::new_running(44100.0);
        one_shot(&ctx).set_playback_rate(0.0, 0.0);
    }

    #[test]
    fn test_dispose_stops_and_releases() {
        let ctx = AudioContext::new_running(44100.0);
        let clip = looped(&ctx);
        let gate = Property::new(true);
        clip.add_enable_control(gate.clone());
        clip.play(0.0);
        clip.dispose();
        clip.dispose();
        assert!(!clip.is_playing());
        assert_eq!(gate.listener_count(), 0);
    }

    #[test]
    fn test_undecodable_asset_stays_silent() {
        use crate::asset::{AudioAsset, AudioFormat, MemoryFetcher};
        use crate::decoder::{load_sound, DecodeCache};

        let ctx = AudioContext::new_running(44100.0);
        let cache = DecodeCache::new(Rc::new(MemoryFetcher::new()));
        let asset = AudioAsset::from_bytes("corrupt", AudioFormat::Wav, &[0, 1, 2, 3]);
        let wrapped = load_sound(&cache, &asset, &ctx);

        let once = SoundClip::new(&ctx, wrapped.clone(), SoundClipOptions::default());
        let looping = SoundClip::new(&ctx, wrapped.clone(), SoundClipOptions::looping());
        once.play(0.0);
        looping.play(0.0);

        ctx.run_pending_decodes();
        ctx.advance(1.0);
        once.play(0.0);
        looping.play(0.0);

        assert!(!wrapped.is_ready());
        assert_eq!(once.active_instance_count(), 0);
        assert_eq!(looping.active_instance_count(), 0);
        assert!(!looping.is_playing());
    }
}
