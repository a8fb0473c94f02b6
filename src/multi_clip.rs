//! Value-dispatched clip playback
//!
//! [`MultiClip`] plays one of several buffers chosen by a key.
//! [`PropertyMultiClip`] drives it from an observable.
//! [`DiscreteSoundGenerator`] plays a clip whenever a continuous value moves
//! into a different bin.

use crate::bin_mapper::{BinMapper, BinMapperOptions, ValueRange};
use crate::buffer::WrappedAudioBuffer;
use crate::clip::{
    fade_out, restore_gain, SoundClip, SoundClipOptions, DEFERRED_PLAY_DELAY, MAX_PLAY_DEFER_TIME,
};
use crate::context::{AudioContext, NodeId};
use crate::deferred::DeferredStart;
use crate::generator::{GeneratorCore, GeneratorOptions, SoundGenerator};
use crate::property::{ListenerId, Property};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::hash::Hash;
use std::rc::Rc;
use tracing::debug;

// =============================================================================
// MultiClip
// =============================================================================

struct MultiClipInner<K> {
    core: Rc<GeneratorCore>,
    buffers: HashMap<K, WrappedAudioBuffer>,
    local_gain: NodeId,
    active: RefCell<Vec<NodeId>>,
    deferred: DeferredStart,
}

/// Plays the buffer associated with a key as a one-shot.
pub struct MultiClip<K> {
    inner: Rc<MultiClipInner<K>>,
}

impl<K> Clone for MultiClip<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<K: Eq + Hash + Clone + std::fmt::Debug + 'static> MultiClip<K> {
    pub fn new(
        context: &AudioContext,
        buffers: impl IntoIterator<Item = (K, WrappedAudioBuffer)>,
        options: GeneratorOptions,
    ) -> Self {
        let core = GeneratorCore::new(context, options);
        let local_gain = context.create_gain();
        context.connect(local_gain, core.gain_node());
        Self {
            inner: Rc::new(MultiClipInner {
                core,
                buffers: buffers.into_iter().collect(),
                local_gain,
                active: RefCell::new(Vec::new()),
                deferred: DeferredStart::new(context.clone()),
            }),
        }
    }

    /// Play the sound associated with `value`. There must be one.
    pub fn play_associated_sound(&self, value: &K, delay: f64) {
        let inner = &self.inner;
        let wrapped = inner.buffers.get(value);
        debug_assert!(wrapped.is_some(), "no sound associated with value {:?}", value);
        let Some(wrapped) = wrapped else {
            return;
        };
        if !inner.core.is_fully_enabled() {
            return;
        }

        let context = inner.core.context();
        if !context.is_running() {
            let weak = Rc::downgrade(inner);
            let value = value.clone();
            inner.deferred.request(move |elapsed| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if elapsed < MAX_PLAY_DEFER_TIME {
                    MultiClip { inner }.play_associated_sound(&value, delay + DEFERRED_PLAY_DELAY);
                } else {
                    debug!(elapsed, "dropping stale deferred multi-clip request");
                }
            });
            return;
        }

        let Some(buffer) = wrapped.get() else {
            return;
        };
        let now = context.current_time();
        restore_gain(context, inner.local_gain);

        let source = context.create_buffer_source();
        context.set_buffer(source, buffer);
        context.connect(source, inner.local_gain);
        context.start_source(source, now + delay.max(0.0), 0.0);

        let weak = Rc::downgrade(inner);
        context.set_on_ended(source, move || {
            if let Some(inner) = weak.upgrade() {
                inner.active.borrow_mut().retain(|s| *s != source);
                inner.core.context().remove_node(source);
            }
        });
        inner.active.borrow_mut().push(source);
    }

    /// Fade out and stop everything that is playing.
    pub fn stop_all(&self) {
        let inner = &self.inner;
        inner.deferred.cancel();
        let sources: Vec<NodeId> = inner.active.borrow_mut().drain(..).collect();
        if sources.is_empty() {
            return;
        }
        let context = inner.core.context();
        let stop_time = fade_out(context, inner.local_gain, 0.0);
        for source in sources {
            context.stop_source(source, stop_time);
        }
    }

    pub fn has_sound_for(&self, value: &K) -> bool {
        self.inner.buffers.contains_key(value)
    }

    pub fn active_instance_count(&self) -> usize {
        self.inner.active.borrow().len()
    }
}

impl<K: 'static> SoundGenerator for MultiClip<K> {
    fn core(&self) -> &Rc<GeneratorCore> {
        &self.inner.core
    }

    fn dispose(&self) {
        let inner = &self.inner;
        if inner.core.is_disposed() {
            return;
        }
        inner.deferred.cancel();
        let context = inner.core.context();
        for source in inner.active.borrow_mut().drain(..) {
            context.remove_node(source);
        }
        context.remove_node(inner.local_gain);
        inner.core.dispose();
    }
}

// =============================================================================
// PropertyMultiClip
// =============================================================================

/// Plays the sound associated with each new value of an observable.
pub struct PropertyMultiClip<K> {
    multi_clip: MultiClip<K>,
    property: Property<K>,
    link: Cell<Option<ListenerId>>,
}

impl<K: Eq + Hash + Clone + std::fmt::Debug + 'static> PropertyMultiClip<K> {
    /// When `link_lazily` is false the initial value is also played.
    pub fn new(
        context: &AudioContext,
        property: Property<K>,
        buffers: impl IntoIterator<Item = (K, WrappedAudioBuffer)>,
        link_lazily: bool,
        options: GeneratorOptions,
    ) -> Self {
        let multi_clip = MultiClip::new(context, buffers, options);
        let player = multi_clip.clone();
        let listener = move |value: &K, _: &K| player.play_associated_sound(value, 0.0);
        let link = if link_lazily {
            property.lazy_link(listener)
        } else {
            property.link(listener)
        };
        Self {
            multi_clip,
            property,
            link: Cell::new(Some(link)),
        }
    }

    pub fn multi_clip(&self) -> &MultiClip<K> {
        &self.multi_clip
    }
}

impl<K: Eq + Hash + Clone + std::fmt::Debug + 'static> SoundGenerator for PropertyMultiClip<K> {
    fn core(&self) -> &Rc<GeneratorCore> {
        self.multi_clip.core()
    }

    fn dispose(&self) {
        if let Some(link) = self.link.take() {
            self.property.unlink(link);
        }
        self.multi_clip.dispose();
    }
}

// =============================================================================
// DiscreteSoundGenerator
// =============================================================================

/// Options for [`DiscreteSoundGenerator`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscreteSoundGeneratorOptions {
    pub num_bins: usize,
    pub sound_when_min_reached: bool,
    pub sound_when_max_reached: bool,
    /// Playback rates at the range min and max; interpolated linearly between
    pub playback_rate_range: ValueRange,
    pub tolerate_out_of_range_values: bool,
    #[serde(skip)]
    pub always_play_on_change: Option<Property<bool>>,
    pub clip: SoundClipOptions,
}

impl Default for DiscreteSoundGeneratorOptions {
    fn default() -> Self {
        Self {
            num_bins: 7,
            sound_when_min_reached: true,
            sound_when_max_reached: true,
            playback_rate_range: ValueRange::new(1.0, 1.0),
            tolerate_out_of_range_values: false,
            always_play_on_change: None,
            clip: SoundClipOptions::default(),
        }
    }
}

/// Plays a clip when a value crosses into a different bin.
pub struct DiscreteSoundGenerator {
    clip: SoundClip,
    value: Property<f64>,
    link: Cell<Option<ListenerId>>,
}

impl DiscreteSoundGenerator {
    pub fn new(
        context: &AudioContext,
        value: Property<f64>,
        range: ValueRange,
        buffer: WrappedAudioBuffer,
        options: DiscreteSoundGeneratorOptions,
    ) -> Self {
        let clip = SoundClip::new(
            context,
            buffer,
            SoundClipOptions {
                rate_changes_affect_playing_sounds: false,
                ..options.clip.clone()
            },
        );
        let mapper = BinMapper::with_options(
            options.num_bins,
            range,
            BinMapperOptions {
                tolerate_out_of_range_values: options.tolerate_out_of_range_values,
            },
        );

        let player = clip.clone();
        let link = value.lazy_link(move |&new, &old| {
            let bin_changed = mapper.map_to_bin(new) != mapper.map_to_bin(old);
            let at_min = options.sound_when_min_reached && new == range.min;
            let at_max = options.sound_when_max_reached && new == range.max;
            let always = options
                .always_play_on_change
                .as_ref()
                .is_some_and(Property::get);
            if !(bin_changed || at_min || at_max || always) {
                return;
            }
            let rates = options.playback_rate_range;
            let position = range.normalize(range.constrain(new));
            player.set_playback_rate(rates.min + position * rates.length(), 0.0);
            player.play(0.0);
        });

        Self {
            clip,
            value,
            link: Cell::new(Some(link)),
        }
    }

    pub fn clip(&self) -> &SoundClip {
        &self.clip
    }
}

impl SoundGenerator for DiscreteSoundGenerator {
    fn core(&self) -> &Rc<GeneratorCore> {
        self.clip.core()
    }

    fn dispose(&self) {
        if let Some(link) = self.link.take() {
            self.value.unlink(link);
        }
        self.clip.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::tests::padded_buffer;
    use crate::context::ParamName;
    use approx::assert_relative_eq;

    fn buffers() -> Vec<(&'static str, WrappedAudioBuffer)> {
        vec![
            ("low", WrappedAudioBuffer::ready(padded_buffer())),
            ("high", WrappedAudioBuffer::ready(padded_buffer())),
        ]
    }

    #[test]
    fn test_plays_associated_sound() {
        let ctx = AudioContext::new_running(44100.0);
        let multi = MultiClip::new(&ctx, buffers(), GeneratorOptions::default());
        multi.play_associated_sound(&"low", 0.0);
        multi.play_associated_sound(&"high", 0.0);
        assert_eq!(multi.active_instance_count(), 2);
        ctx.advance(1.5);
        assert_eq!(multi.active_instance_count(), 0);
    }

    #[test]
    #[should_panic(expected = "no sound associated")]
    fn test_missing_key_asserts() {
        let ctx = AudioContext::new_running(44100.0);
        let multi = MultiClip::new(&ctx, buffers(), GeneratorOptions::default());
        multi.play_associated_sound(&"middle", 0.0);
    }

    #[test]
    fn test_stop_all() {
        let ctx = AudioContext::new_running(44100.0);
        let multi = MultiClip::new(&ctx, buffers(), GeneratorOptions::default());
        multi.play_associated_sound(&"low", 0.0);
        multi.stop_all();
        assert_eq!(multi.active_instance_count(), 0);
    }

    #[test]
    fn test_dispose_stops_and_releases() {
        let ctx = AudioContext::new_running(44100.0);
        let multi = MultiClip::new(&ctx, buffers(), GeneratorOptions::default());
        let local_gain = multi.inner.local_gain;
        multi.play_associated_sound(&"low", 0.0);
        let source = multi.inner.active.borrow()[0];

        multi.dispose();
        multi.dispose();
        assert_eq!(multi.active_instance_count(), 0);
        assert!(!ctx.contains_node(source));
        assert!(!ctx.contains_node(local_gain));

        let nodes = ctx.node_count();
        drop(multi);
        ctx.advance(30.0);
        assert_eq!(ctx.node_count(), nodes);
    }

    #[test]
    fn test_multi_clip_defers_while_suspended() {
        let ctx = AudioContext::new(44100.0);
        let multi = MultiClip::new(&ctx, buffers(), GeneratorOptions::default());
        multi.play_associated_sound(&"high", 0.0);
        assert_eq!(multi.active_instance_count(), 0);
        ctx.resume().unwrap();
        assert_eq!(multi.active_instance_count(), 1);
    }

    #[test]
    fn test_property_multi_clip_lazy_and_eager() {
        let ctx = AudioContext::new_running(44100.0);
        let lazy_value = Property::new("low");
        let lazy = PropertyMultiClip::new(&ctx, lazy_value.clone(), buffers(), true, Default::default());
        assert_eq!(lazy.multi_clip().active_instance_count(), 0);
        lazy_value.set("high");
        assert_eq!(lazy.multi_clip().active_instance_count(), 1);

        let eager = PropertyMultiClip::new(&ctx, Property::new("low"), buffers(), false, Default::default());
        assert_eq!(eager.multi_clip().active_instance_count(), 1);

        lazy.dispose();
        assert_eq!(lazy_value.listener_count(), 0);
    }

    #[test]
    fn test_discrete_generator_plays_on_bin_change() {
        let ctx = AudioContext::new_running(44100.0);
        let value = Property::new(0.0);
        let generator = DiscreteSoundGenerator::new(
            &ctx,
            value.clone(),
            ValueRange::new(0.0, 10.0),
            WrappedAudioBuffer::ready(padded_buffer()),
            DiscreteSoundGeneratorOptions {
                num_bins: 5,
                ..Default::default()
            },
        );

        value.set(1.0);
        assert_eq!(generator.clip().active_instance_count(), 0, "same bin");
        value.set(2.0);
        assert_eq!(generator.clip().active_instance_count(), 1, "bin 0 to bin 1");
        value.set(3.0);
        assert_eq!(generator.clip().active_instance_count(), 1, "still bin 1");
    }

    #[test]
    fn test_discrete_generator_min_max_and_rate() {
        let ctx = AudioContext::new_running(44100.0);
        let value = Property::new(5.0);
        let generator = DiscreteSoundGenerator::new(
            &ctx,
            value.clone(),
            ValueRange::new(0.0, 10.0),
            WrappedAudioBuffer::ready(padded_buffer()),
            DiscreteSoundGeneratorOptions {
                num_bins: 1,
                playback_rate_range: ValueRange::new(0.5, 1.5),
                ..Default::default()
            },
        );

        value.set(10.0);
        assert_eq!(generator.clip().active_instance_count(), 1);
        assert_relative_eq!(generator.clip().playback_rate(), 1.5);

        value.set(0.0);
        assert_eq!(generator.clip().active_instance_count(), 2);
        assert_relative_eq!(generator.clip().playback_rate(), 0.5);

        let sources = generator.clip().active_sources();
        let rate_of = |source| ctx.param(source, ParamName::PlaybackRate).value();
        assert_relative_eq!(rate_of(sources[0]), 1.5);
        assert_relative_eq!(rate_of(sources[1]), 0.5);

        value.set(4.0);
        assert_eq!(generator.clip().active_instance_count(), 2);
    }

    #[test]
    fn test_discrete_generator_always_play_override() {
        let ctx = AudioContext::new_running(44100.0);
        let value = Property::new(5.0);
        let always = Property::new(true);
        let generator = DiscreteSoundGenerator::new(
            &ctx,
            value.clone(),
            ValueRange::new(0.0, 10.0),
            WrappedAudioBuffer::ready(padded_buffer()),
            DiscreteSoundGeneratorOptions {
                always_play_on_change: Some(always.clone()),
                ..Default::default()
            },
        );
        value.set(5.1);
        assert_eq!(generator.clip().active_instance_count(), 1);
        always.set(false);
        value.set(5.2);
        assert_eq!(generator.clip().active_instance_count(), 1);
    }
}
