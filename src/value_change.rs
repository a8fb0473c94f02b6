//! Value Change Sound Policy
//!
//! Decides which of several shared players to invoke when a numeric value
//! changes: a dedicated sound at each end of the range, and an up or down
//! sound for movement in the interior. Interior sounds are rate limited so
//! fast dragging does not flood the mix.

use crate::bin_mapper::ValueRange;
use crate::clock::Clock;
use crate::player::{NullSoundPlayer, SoundPlayer};
use std::cell::Cell;
use std::rc::Rc;

/// Shortest wall-clock interval between two interior sounds, in seconds
pub const DEFAULT_MIN_TIME_BETWEEN_MIDDLE_SOUNDS: f64 = 0.035;

/// Smallest usable threshold delta; finer spacing vanishes under
/// [`default_constrain_value`]
pub const MIN_THRESHOLD_DELTA: f64 = 1e-7;

/// Removes floating-point noise before values are compared.
pub fn default_constrain_value(value: f64) -> f64 {
    (value * 1e7).round() / 1e7
}

/// How interior thresholds are laid out. The two are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdSpacing {
    /// This many evenly spaced thresholds strictly inside the range
    Count(usize),
    /// Thresholds every `delta` from the range min
    Delta(f64),
}

/// Options for [`ValueChangeSoundPlayer`]
#[derive(Clone)]
pub struct ValueChangeSoundPlayerOptions {
    pub spacing: ThresholdSpacing,
    pub min_sound_player: Rc<dyn SoundPlayer>,
    pub max_sound_player: Rc<dyn SoundPlayer>,
    pub middle_moving_up_sound_player: Rc<dyn SoundPlayer>,
    pub middle_moving_down_sound_player: Rc<dyn SoundPlayer>,
    /// Maps the new value to a playback rate for the interior sounds
    pub middle_playback_rate_mapper: Option<Rc<dyn Fn(f64) -> f64>>,
    pub constrain_value: Rc<dyn Fn(f64) -> f64>,
    pub min_time_between_middle_sounds: f64,
}

impl Default for ValueChangeSoundPlayerOptions {
    fn default() -> Self {
        Self {
            spacing: ThresholdSpacing::Count(9),
            min_sound_player: Rc::new(NullSoundPlayer),
            max_sound_player: Rc::new(NullSoundPlayer),
            middle_moving_up_sound_player: Rc::new(NullSoundPlayer),
            middle_moving_down_sound_player: Rc::new(NullSoundPlayer),
            middle_playback_rate_mapper: None,
            constrain_value: Rc::new(default_constrain_value),
            min_time_between_middle_sounds: DEFAULT_MIN_TIME_BETWEEN_MIDDLE_SOUNDS,
        }
    }
}

/// Threshold-crossing sound policy for a value in a range.
pub struct ValueChangeSoundPlayer {
    range: ValueRange,
    thresholds: Vec<f64>,
    options: ValueChangeSoundPlayerOptions,
    clock: Rc<dyn Clock>,
    last_middle_sound_time: Cell<Option<f64>>,
}

impl ValueChangeSoundPlayer {
    pub fn new(range: ValueRange, options: ValueChangeSoundPlayerOptions, clock: Rc<dyn Clock>) -> Self {
        let constrain = Rc::clone(&options.constrain_value);
        let thresholds = match options.spacing {
            ThresholdSpacing::Count(count) => {
                let spacing = range.length() / (count + 1) as f64;
                (1..=count)
                    .map(|i| constrain(range.min + spacing * i as f64))
                    .collect()
            }
            ThresholdSpacing::Delta(delta) => {
                debug_assert!(
                    delta >= MIN_THRESHOLD_DELTA,
                    "threshold delta must be at least {MIN_THRESHOLD_DELTA}"
                );
                if delta >= MIN_THRESHOLD_DELTA {
                    let count = libm::ceil(range.length() / delta) as usize;
                    let mut thresholds: Vec<f64> = (1..=count)
                        .map(|i| constrain(range.min + delta * i as f64))
                        .filter(|t| *t > range.min && *t < range.max)
                        .collect();
                    thresholds.dedup();
                    thresholds
                } else {
                    Vec::new()
                }
            }
        };

        Self {
            range,
            thresholds,
            options,
            clock,
            last_middle_sound_time: Cell::new(None),
        }
    }

    /// Interior thresholds, ascending
    pub fn thresholds(&self) -> &[f64] {
        &self.thresholds
    }

    /// The thresholds bracketing `value`: the greatest at or below it and the
    /// least at or above it. A value on a threshold is bracketed by that
    /// threshold on both sides.
    pub fn surrounding_thresholds(&self, value: f64) -> (Option<f64>, Option<f64>) {
        let value = (self.options.constrain_value)(value);
        let below = self.thresholds.iter().rev().find(|t| **t <= value).copied();
        let above = self.thresholds.iter().find(|t| **t >= value).copied();
        (below, above)
    }

    /// A threshold is reached when the bracketing thresholds of the old and
    /// new values differ.
    fn threshold_reached(&self, new: f64, old: f64) -> bool {
        self.surrounding_thresholds(new) != self.surrounding_thresholds(old)
    }

    /// Play a sound if the change reaches a threshold or a range boundary.
    pub fn play_sound_if_threshold_reached(&self, new_value: f64, old_value: f64) {
        let constrain = &self.options.constrain_value;
        let new = constrain(new_value);
        let old = constrain(old_value);
        if new == old {
            return;
        }
        if self.play_boundary_sound(new) {
            return;
        }
        if self.threshold_reached(new, old) {
            self.play_middle_sound(new, old);
        }
    }

    /// Play a sound for any change, regardless of thresholds.
    pub fn play_sound_for_value_change(&self, new_value: f64, old_value: f64) {
        let constrain = &self.options.constrain_value;
        let new = constrain(new_value);
        let old = constrain(old_value);
        if new == old {
            return;
        }
        if !self.play_boundary_sound(new) {
            self.play_middle_sound(new, old);
        }
    }

    fn play_boundary_sound(&self, value: f64) -> bool {
        if value == self.range.min {
            self.options.min_sound_player.play();
            true
        } else if value == self.range.max {
            self.options.max_sound_player.play();
            true
        } else {
            false
        }
    }

    fn play_middle_sound(&self, new: f64, old: f64) {
        let now = self.clock.now();
        if let Some(last) = self.last_middle_sound_time.get() {
            if now - last < self.options.min_time_between_middle_sounds {
                return;
            }
        }
        self.last_middle_sound_time.set(Some(now));

        let player = if new > old {
            &self.options.middle_moving_up_sound_player
        } else {
            &self.options.middle_moving_down_sound_player
        };
        if let Some(mapper) = &self.options.middle_playback_rate_mapper {
            player.set_playback_rate(mapper(new));
        }
        player.play();
    }
}
