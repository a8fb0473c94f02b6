//! Host bindings
//!
//! The observables a hosting application provides to the sound layer. The
//! sound layer only reads them; the host owns and drives them.

use crate::property::{Emitter, Property};

/// Host-side conditions and events consumed by the [`SoundManager`].
///
/// [`SoundManager`]: crate::manager::SoundManager
#[derive(Clone)]
pub struct HostState {
    /// The host permits audio at all (for example a global mute)
    pub audio_allowed: Property<bool>,
    /// The simulation has finished constructing its model and views
    pub construction_complete: Property<bool>,
    /// The simulation screen is currently shown
    pub sim_visible: Property<bool>,
    /// The simulation is active rather than paused in the background
    pub sim_active: Property<bool>,
    /// Persisted state is being replayed
    pub setting_state: Property<bool>,
    /// The whole application is resetting
    pub reset_in_progress: Property<bool>,
    /// First contact of a touch
    pub touch_start: Emitter<()>,
    /// Any user gesture that platforms accept for resuming audio
    pub user_gesture: Emitter<()>,
}

impl Default for HostState {
    fn default() -> Self {
        Self {
            audio_allowed: Property::new(true),
            construction_complete: Property::new(true),
            sim_visible: Property::new(true),
            sim_active: Property::new(true),
            setting_state: Property::new(false),
            reset_in_progress: Property::new(false),
            touch_start: Emitter::new(),
            user_gesture: Emitter::new(),
        }
    }
}

impl std::fmt::Debug for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostState")
            .field("audio_allowed", &self.audio_allowed.get())
            .field("construction_complete", &self.construction_complete.get())
            .field("sim_visible", &self.sim_visible.get())
            .field("sim_active", &self.sim_active.get())
            .field("setting_state", &self.setting_state.get())
            .field("reset_in_progress", &self.reset_in_progress.get())
            .finish()
    }
}
