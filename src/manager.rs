//! Sound Manager
//!
//! The central mixing session. It owns the output bus graph, gates the whole
//! mix on the host's conditions, ducks everything under narration, keeps the
//! audio session resumed, and wires registered generators into the mix with
//! the global conditions attached.
//!
//! ```text
//!   generator ─► category ─┬─► convolver ─► wet ─┐
//!                          └─► dry ──────────────┴─► master ─► ducking ─► compressor ─► out
//! ```
//!
//! Registration calls made before [`SoundManager::initialize`] are queued and
//! applied in order once the graph exists.

use crate::buffer::AudioBuffer;
use crate::context::{AudioContext, ContextState, NodeId, ParamName};
use crate::error::SoundError;
use crate::generator::{
    GeneratorCore, GeneratorId, SonificationLevel, SoundGenerator, DEFAULT_LINEAR_GAIN_CHANGE_TIME,
};
use crate::host::HostState;
use crate::noise::{generate_noise, NoiseType};
use crate::property::{DerivedProperty, ListenerId, Property};
use crate::session_monitor::{self, StateListenerId};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Level of the ducking bus while any ducking condition is true
pub const DUCKED_LEVEL: f64 = 0.15;

/// Time constant for ducking down, in seconds
pub const DUCK_TIME_CONSTANT: f64 = 0.05;

/// Time constant for restoring after ducking, in seconds
pub const UNDUCK_TIME_CONSTANT: f64 = 0.5;

/// Default wet level of the shared reverb
pub const DEFAULT_REVERB_LEVEL: f64 = 0.02;

/// Time constant used for master, category and reverb level changes
pub const LEVEL_TIME_CONSTANT: f64 = 0.015;

/// Configuration for [`SoundManager::initialize`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoundManagerConfig {
    /// Names of the category buses, which must be unique
    pub categories: Vec<String>,
    pub master_output_level: f64,
    /// Wet share of the mix; the dry share is `1 - reverb_level`
    pub reverb_level: f64,
    pub extra_sounds_enabled: bool,
    pub ducked_level: f64,
    pub duck_time_constant: f64,
    pub unduck_time_constant: f64,
    /// Length of the synthetic reverb impulse response, in seconds
    pub reverb_duration: f64,
    /// Exponential decay rate of the impulse response, per second
    pub reverb_decay: f64,
    /// Seed for the impulse response noise
    pub reverb_seed: u64,
}

impl Default for SoundManagerConfig {
    fn default() -> Self {
        Self {
            categories: Vec::new(),
            master_output_level: 1.0,
            reverb_level: DEFAULT_REVERB_LEVEL,
            extra_sounds_enabled: false,
            ducked_level: DUCKED_LEVEL,
            duck_time_constant: DUCK_TIME_CONSTANT,
            unduck_time_constant: UNDUCK_TIME_CONSTANT,
            reverb_duration: 1.0,
            reverb_decay: 4.0,
            reverb_seed: 0x5eed,
        }
    }
}

impl SoundManagerConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self, SoundError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SoundError> {
        for (i, name) in self.categories.iter().enumerate() {
            if self.categories[..i].contains(name) {
                return Err(SoundError::DuplicateCategory(name.clone()));
            }
        }
        if !(0.0..=1.0).contains(&self.reverb_level) {
            return Err(SoundError::InvalidConfig(format!(
                "reverb level {} is outside [0, 1]",
                self.reverb_level
            )));
        }
        if self.duck_time_constant < 0.0 || self.unduck_time_constant < 0.0 {
            return Err(SoundError::InvalidConfig(
                "ducking time constants must be non-negative".into(),
            ));
        }
        if self.reverb_duration <= 0.0 {
            return Err(SoundError::InvalidConfig(
                "reverb duration must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Synthesize a decaying-noise reverb impulse response.
pub fn synthetic_impulse_response(sample_rate: f64, duration: f64, decay: f64, seed: u64) -> AudioBuffer {
    let length = (sample_rate * duration).max(1.0) as usize;
    let mut rng = StdRng::seed_from_u64(seed);
    let channels = (0..2)
        .map(|_| {
            let mut samples = generate_noise(NoiseType::White, length, &mut rng);
            for (i, sample) in samples.iter_mut().enumerate() {
                let t = i as f64 / sample_rate;
                *sample *= libm::exp(-decay * t) as f32;
            }
            samples
        })
        .collect();
    AudioBuffer::from_channels(channels, sample_rate)
}

/// Per-registration options for [`SoundManager::add_sound_generator`]
#[derive(Clone, Default)]
pub struct SoundGeneratorAddOptions {
    /// Category bus to connect to; `None` connects straight to the reverb
    /// and dry sends
    pub category: Option<String>,
    /// Visibility of the view the sound belongs to. The generator is only
    /// audible while it is true.
    pub associated_view_visible: Option<Property<bool>>,
}

impl SoundGeneratorAddOptions {
    pub fn category(name: impl Into<String>) -> Self {
        Self {
            category: Some(name.into()),
            associated_view_visible: None,
        }
    }
}

// =============================================================================
// State
// =============================================================================

/// The fixed bus graph built by `initialize`
struct Buses {
    compressor: NodeId,
    ducking: NodeId,
    master: NodeId,
    convolver: NodeId,
    wet: NodeId,
    dry: NodeId,
    categories: Vec<(String, NodeId)>,
    master_gate: DerivedProperty<bool>,
}

impl Buses {
    fn category(&self, name: &str) -> Option<NodeId> {
        self.categories
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, node)| *node)
    }
}

struct Registration {
    core: Rc<GeneratorCore>,
    controls: Vec<Property<bool>>,
    visibility: Option<DerivedProperty<bool>>,
}

enum PendingOp {
    Add(Rc<GeneratorCore>, SoundGeneratorAddOptions),
    Remove(Rc<GeneratorCore>),
}

struct ResumeListeners {
    touch_start: ListenerId,
    user_gesture: ListenerId,
}

struct ManagerInner {
    context: AudioContext,
    host: HostState,
    enabled: Property<bool>,
    extra_sound_enabled: Property<bool>,
    not_setting_state: DerivedProperty<bool>,
    not_resetting: DerivedProperty<bool>,
    buses: RefCell<Option<Buses>>,
    config: RefCell<SoundManagerConfig>,
    registrations: RefCell<HashMap<GeneratorId, Registration>>,
    pending: RefCell<Vec<PendingOp>>,
    ducking_properties: RefCell<Vec<(Property<bool>, ListenerId)>>,
    ducked: Cell<bool>,
    master_level: Cell<f64>,
    reverb_level: Cell<f64>,
    session_listener: Cell<Option<StateListenerId>>,
    resume_listeners: RefCell<Option<ResumeListeners>>,
}

/// The central mixing session.
#[derive(Clone)]
pub struct SoundManager {
    inner: Rc<ManagerInner>,
}

impl std::fmt::Debug for SoundManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoundManager")
            .field("initialized", &self.is_initialized())
            .field("generators", &self.inner.registrations.borrow().len())
            .field("pending", &self.inner.pending.borrow().len())
            .field("ducked", &self.inner.ducked.get())
            .finish()
    }
}

impl SoundManager {
    pub fn new(context: &AudioContext, host: HostState) -> Self {
        let not_setting_state = DerivedProperty::not(host.setting_state.clone());
        let not_resetting = DerivedProperty::not(host.reset_in_progress.clone());
        let config = SoundManagerConfig::default();
        Self {
            inner: Rc::new(ManagerInner {
                context: context.clone(),
                host,
                enabled: Property::new(true),
                extra_sound_enabled: Property::new(config.extra_sounds_enabled),
                not_setting_state,
                not_resetting,
                buses: RefCell::new(None),
                master_level: Cell::new(config.master_output_level),
                reverb_level: Cell::new(config.reverb_level),
                config: RefCell::new(config),
                registrations: RefCell::new(HashMap::new()),
                pending: RefCell::new(Vec::new()),
                ducking_properties: RefCell::new(Vec::new()),
                ducked: Cell::new(false),
                session_listener: Cell::new(None),
                resume_listeners: RefCell::new(None),
            }),
        }
    }

    pub fn context(&self) -> &AudioContext {
        &self.inner.context
    }

    pub fn host(&self) -> &HostState {
        &self.inner.host
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.buses.borrow().is_some()
    }

    // -------------------------------------------------------------------------
    // Initialization
    // -------------------------------------------------------------------------

    /// Build the bus graph, start session supervision, and apply any
    /// registrations queued before this call.
    pub fn initialize(&self, config: SoundManagerConfig) -> Result<(), SoundError> {
        if self.is_initialized() {
            return Err(SoundError::AlreadyInitialized);
        }
        config.validate()?;

        let inner = &self.inner;
        let context = &inner.context;
        let now = context.current_time();

        let compressor = context.create_dynamics_compressor();
        let compressor_params = [
            (ParamName::Threshold, -6.0),
            (ParamName::Knee, 5.0),
            (ParamName::Ratio, 12.0),
            (ParamName::Attack, 0.0),
            (ParamName::Release, 0.25),
        ];
        for (name, value) in compressor_params {
            context.param(compressor, name).set_value_at_time(value, now);
        }
        context.connect(compressor, context.destination());

        let ducking = context.create_gain();
        context.connect(ducking, compressor);

        let master = context.create_gain();
        context.param(master, ParamName::Gain).set_value_at_time(0.0, now);
        context.connect(master, ducking);

        let impulse = synthetic_impulse_response(
            context.sample_rate(),
            config.reverb_duration,
            config.reverb_decay,
            config.reverb_seed,
        );
        let convolver = context.create_convolver(Some(impulse));
        let wet = context.create_gain();
        context
            .param(wet, ParamName::Gain)
            .set_value_at_time(config.reverb_level, now);
        context.connect(convolver, wet);
        context.connect(wet, master);

        let dry = context.create_gain();
        context
            .param(dry, ParamName::Gain)
            .set_value_at_time(1.0 - config.reverb_level, now);
        context.connect(dry, master);

        let categories = config
            .categories
            .iter()
            .map(|name| {
                let bus = context.create_gain();
                context.connect(bus, convolver);
                context.connect(bus, dry);
                (name.clone(), bus)
            })
            .collect();

        let host = &inner.host;
        let master_gate = DerivedProperty::new(
            vec![
                inner.enabled.clone(),
                host.audio_allowed.clone(),
                host.construction_complete.clone(),
                host.sim_visible.clone(),
                host.sim_active.clone(),
                host.setting_state.clone(),
            ],
            |v| v[0] && v[1] && v[2] && v[3] && v[4] && !v[5],
        );

        inner.master_level.set(config.master_output_level);
        inner.reverb_level.set(config.reverb_level);
        inner.extra_sound_enabled.set(config.extra_sounds_enabled);

        let weak = Rc::downgrade(inner);
        master_gate.property().lazy_link(move |open, _| {
            if let Some(inner) = weak.upgrade() {
                SoundManager { inner }.apply_master_gate(*open);
            }
        });
        let open = master_gate.get();

        info!(
            categories = ?config.categories,
            reverb_level = config.reverb_level,
            "sound manager initialized"
        );
        *inner.config.borrow_mut() = config;
        *inner.buses.borrow_mut() = Some(Buses {
            compressor,
            ducking,
            master,
            convolver,
            wet,
            dry,
            categories,
            master_gate,
        });
        self.apply_master_gate(open);
        self.update_ducking(true);
        self.start_session_supervision();

        let pending = std::mem::take(&mut *inner.pending.borrow_mut());
        debug!(count = pending.len(), "applying queued registrations");
        for op in pending {
            let result = match op {
                PendingOp::Add(core, options) => self.register(core, options),
                PendingOp::Remove(core) => self.unregister(&core),
            };
            if let Err(e) = result {
                warn!(error = %e, "queued sound generator operation failed");
            }
        }
        Ok(())
    }

    fn apply_master_gate(&self, open: bool) {
        let buses = self.inner.buses.borrow();
        let Some(buses) = buses.as_ref() else {
            return;
        };
        let context = &self.inner.context;
        let target = if open { self.inner.master_level.get() } else { 0.0 };
        debug!(open, target, "master gate changed");
        let gain = context.param(buses.master, ParamName::Gain);
        gain.hold_current_value();
        gain.linear_ramp_to_value_at_time(target, context.current_time() + DEFAULT_LINEAR_GAIN_CHANGE_TIME);
    }

    // -------------------------------------------------------------------------
    // Generators
    // -------------------------------------------------------------------------

    /// Register a generator with the mix. Queued if not yet initialized.
    pub fn add_sound_generator(
        &self,
        generator: &dyn SoundGenerator,
        options: SoundGeneratorAddOptions,
    ) -> Result<(), SoundError> {
        let core = Rc::clone(generator.core());
        if !self.is_initialized() {
            self.inner.pending.borrow_mut().push(PendingOp::Add(core, options));
            return Ok(());
        }
        self.register(core, options)
    }

    /// Unregister a generator. Queued if not yet initialized.
    pub fn remove_sound_generator(&self, generator: &dyn SoundGenerator) -> Result<(), SoundError> {
        let core = Rc::clone(generator.core());
        if !self.is_initialized() {
            self.inner.pending.borrow_mut().push(PendingOp::Remove(core));
            return Ok(());
        }
        self.unregister(&core)
    }

    pub fn has_sound_generator(&self, generator: &dyn SoundGenerator) -> bool {
        self.inner
            .registrations
            .borrow()
            .contains_key(&generator.core().id())
    }

    pub fn sound_generator_count(&self) -> usize {
        self.inner.registrations.borrow().len()
    }

    /// Registrations waiting for initialization
    pub fn pending_operation_count(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    fn register(&self, core: Rc<GeneratorCore>, options: SoundGeneratorAddOptions) -> Result<(), SoundError> {
        let inner = &self.inner;
        let id = core.id();
        if inner.registrations.borrow().contains_key(&id) {
            return Err(SoundError::DuplicateGenerator(id.raw()));
        }

        {
            let buses = inner.buses.borrow();
            let buses = buses.as_ref().ok_or(SoundError::NotInitialized)?;
            match &options.category {
                Some(name) => {
                    let bus = buses
                        .category(name)
                        .ok_or_else(|| SoundError::UnknownCategory(name.clone()))?;
                    core.connect(bus);
                }
                None => {
                    core.connect(buses.convolver);
                    core.connect(buses.dry);
                }
            }
        }

        let mut controls = vec![
            inner.enabled.clone(),
            inner.not_setting_state.as_condition(),
        ];
        if !core.enabled_during_reset() {
            controls.push(inner.not_resetting.as_condition());
        }
        if core.sonification_level() == SonificationLevel::Extra {
            controls.push(inner.extra_sound_enabled.clone());
        }
        let visibility = options
            .associated_view_visible
            .map(|visible| DerivedProperty::and(vec![visible]));
        if let Some(visibility) = &visibility {
            controls.push(visibility.as_condition());
        }
        for control in &controls {
            core.add_enable_control(control.clone());
        }

        debug!(generator = id.raw(), category = ?options.category, "sound generator added");
        inner.registrations.borrow_mut().insert(
            id,
            Registration {
                core,
                controls,
                visibility,
            },
        );
        Ok(())
    }

    fn unregister(&self, core: &Rc<GeneratorCore>) -> Result<(), SoundError> {
        let id = core.id();
        let registration = self
            .inner
            .registrations
            .borrow_mut()
            .remove(&id)
            .ok_or(SoundError::UnknownGenerator(id.raw()))?;

        if let Some(buses) = self.inner.buses.borrow().as_ref() {
            let candidates = buses
                .categories
                .iter()
                .map(|(_, bus)| *bus)
                .chain([buses.convolver, buses.dry]);
            for bus in candidates {
                if registration.core.is_connected_to(bus) {
                    registration.core.disconnect(bus);
                }
            }
        }
        for control in &registration.controls {
            registration.core.remove_enable_control(control);
        }
        if let Some(visibility) = &registration.visibility {
            visibility.dispose();
        }
        debug!(generator = id.raw(), "sound generator removed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Levels
    // -------------------------------------------------------------------------

    /// Global enable, one input of the master gate and a condition on every
    /// registered generator
    pub fn enabled_property(&self) -> Property<bool> {
        self.inner.enabled.clone()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.set(enabled);
    }

    pub fn extra_sound_enabled_property(&self) -> Property<bool> {
        self.inner.extra_sound_enabled.clone()
    }

    pub fn set_extra_sound_enabled(&self, enabled: bool) {
        self.inner.extra_sound_enabled.set(enabled);
    }

    pub fn is_extra_sound_enabled(&self) -> bool {
        self.inner.extra_sound_enabled.get()
    }

    /// Whether every master gate input currently allows sound
    pub fn is_master_gate_open(&self) -> bool {
        self.inner
            .buses
            .borrow()
            .as_ref()
            .is_some_and(|buses| buses.master_gate.get())
    }

    pub fn master_output_level(&self) -> f64 {
        self.inner.master_level.get()
    }

    pub fn set_master_output_level(&self, level: f64) -> Result<(), SoundError> {
        self.inner.master_level.set(level);
        let buses = self.inner.buses.borrow();
        let buses = buses.as_ref().ok_or(SoundError::NotInitialized)?;
        if buses.master_gate.get() {
            set_gain_target(&self.inner.context, buses.master, level, LEVEL_TIME_CONSTANT);
        }
        Ok(())
    }

    pub fn set_output_level_for_category(&self, category: &str, level: f64) -> Result<(), SoundError> {
        let buses = self.inner.buses.borrow();
        let buses = buses.as_ref().ok_or(SoundError::NotInitialized)?;
        let bus = buses
            .category(category)
            .ok_or_else(|| SoundError::UnknownCategory(category.to_string()))?;
        set_gain_target(&self.inner.context, bus, level, LEVEL_TIME_CONSTANT);
        Ok(())
    }

    /// The level most recently requested for a category
    pub fn output_level_for_category(&self, category: &str) -> Result<f64, SoundError> {
        let buses = self.inner.buses.borrow();
        let buses = buses.as_ref().ok_or(SoundError::NotInitialized)?;
        let bus = buses
            .category(category)
            .ok_or_else(|| SoundError::UnknownCategory(category.to_string()))?;
        let context = &self.inner.context;
        Ok(context.param(bus, ParamName::Gain).value_at(f64::INFINITY))
    }

    pub fn reverb_level(&self) -> f64 {
        self.inner.reverb_level.get()
    }

    /// Set the wet share of the mix; the dry share follows as `1 - level`.
    pub fn set_reverb_level(&self, level: f64) -> Result<(), SoundError> {
        if !(0.0..=1.0).contains(&level) {
            return Err(SoundError::InvalidConfig(format!(
                "reverb level {} is outside [0, 1]",
                level
            )));
        }
        let buses = self.inner.buses.borrow();
        let buses = buses.as_ref().ok_or(SoundError::NotInitialized)?;
        self.inner.reverb_level.set(level);
        let context = &self.inner.context;
        set_gain_target(context, buses.wet, level, LEVEL_TIME_CONSTANT);
        set_gain_target(context, buses.dry, 1.0 - level, LEVEL_TIME_CONSTANT);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Ducking
    // -------------------------------------------------------------------------

    /// Duck the whole mix while `property` is true.
    pub fn add_ducking_property(&self, property: Property<bool>) {
        let weak: Weak<ManagerInner> = Rc::downgrade(&self.inner);
        let id = property.lazy_link(move |_, _| {
            if let Some(inner) = weak.upgrade() {
                SoundManager { inner }.update_ducking(false);
            }
        });
        self.inner.ducking_properties.borrow_mut().push((property, id));
        self.update_ducking(false);
    }

    pub fn remove_ducking_property(&self, property: &Property<bool>) -> Result<(), SoundError> {
        let removed = {
            let mut properties = self.inner.ducking_properties.borrow_mut();
            let index = properties
                .iter()
                .position(|(p, _)| p.ptr_eq(property))
                .ok_or(SoundError::UnknownDuckingProperty)?;
            properties.remove(index)
        };
        removed.0.unlink(removed.1);
        self.update_ducking(false);
        Ok(())
    }

    pub fn is_ducked(&self) -> bool {
        self.inner.ducked.get()
    }

    fn update_ducking(&self, force: bool) {
        let inner = &self.inner;
        let duck = inner
            .ducking_properties
            .borrow()
            .iter()
            .any(|(p, _)| p.get());
        if duck == inner.ducked.replace(duck) && !force {
            return;
        }
        let buses = inner.buses.borrow();
        let Some(buses) = buses.as_ref() else {
            return;
        };
        let config = inner.config.borrow();
        let (level, time_constant) = if duck {
            (config.ducked_level, config.duck_time_constant)
        } else {
            (1.0, config.unduck_time_constant)
        };
        debug!(duck, "ducking changed");
        set_gain_target(&inner.context, buses.ducking, level, time_constant);
    }

    // -------------------------------------------------------------------------
    // Session supervision
    // -------------------------------------------------------------------------

    fn start_session_supervision(&self) {
        let weak = Rc::downgrade(&self.inner);
        let id = session_monitor::add_state_change_listener(&self.inner.context, move |state| {
            if let Some(inner) = weak.upgrade() {
                SoundManager { inner }.on_session_state(state);
            }
        });
        self.inner.session_listener.set(Some(id));
        self.on_session_state(self.inner.context.state());
    }

    fn on_session_state(&self, state: ContextState) {
        match state {
            ContextState::Running | ContextState::Closed => self.detach_resume_listeners(),
            ContextState::Suspended | ContextState::Interrupted => self.attach_resume_listeners(),
        }
    }

    fn attach_resume_listeners(&self) {
        if self.inner.resume_listeners.borrow().is_some() {
            return;
        }
        debug!("audio session not running, waiting for a user gesture");
        let host = &self.inner.host;
        let resume = {
            let context = self.inner.context.clone();
            move |_: &()| {
                if let Err(e) = context.resume() {
                    warn!(error = %e, "audio session resume rejected");
                }
            }
        };
        let listeners = ResumeListeners {
            touch_start: host.touch_start.add_listener(resume.clone()),
            user_gesture: host.user_gesture.add_listener(resume),
        };
        *self.inner.resume_listeners.borrow_mut() = Some(listeners);
    }

    fn detach_resume_listeners(&self) {
        let listeners = self.inner.resume_listeners.borrow_mut().take();
        if let Some(listeners) = listeners {
            let host = &self.inner.host;
            host.touch_start.remove_listener(listeners.touch_start);
            host.user_gesture.remove_listener(listeners.user_gesture);
        }
    }

    pub fn has_resume_listeners(&self) -> bool {
        self.inner.resume_listeners.borrow().is_some()
    }

    // -------------------------------------------------------------------------
    // Bus accessors
    // -------------------------------------------------------------------------

    pub fn category_bus(&self, category: &str) -> Option<NodeId> {
        self.inner.buses.borrow().as_ref()?.category(category)
    }

    pub fn master_bus(&self) -> Option<NodeId> {
        self.inner.buses.borrow().as_ref().map(|b| b.master)
    }

    pub fn ducking_bus(&self) -> Option<NodeId> {
        self.inner.buses.borrow().as_ref().map(|b| b.ducking)
    }

    pub fn compressor_node(&self) -> Option<NodeId> {
        self.inner.buses.borrow().as_ref().map(|b| b.compressor)
    }

    /// Input of the reverb send
    pub fn reverb_bus(&self) -> Option<NodeId> {
        self.inner.buses.borrow().as_ref().map(|b| b.convolver)
    }

    pub fn dry_bus(&self) -> Option<NodeId> {
        self.inner.buses.borrow().as_ref().map(|b| b.dry)
    }

    pub fn wet_bus(&self) -> Option<NodeId> {
        self.inner.buses.borrow().as_ref().map(|b| b.wet)
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Some(id) = self.session_listener.take() {
            session_monitor::remove_state_change_listener(&self.context, id);
        }
        if let Some(listeners) = self.resume_listeners.borrow_mut().take() {
            self.host.touch_start.remove_listener(listeners.touch_start);
            self.host.user_gesture.remove_listener(listeners.user_gesture);
        }
    }
}

fn set_gain_target(context: &AudioContext, node: NodeId, level: f64, time_constant: f64) {
    let now = context.current_time();
    let gain = context.param(node, ParamName::Gain);
    if time_constant == 0.0 || !context.is_running() {
        gain.cancel_scheduled_values(now);
        gain.set_value_at_time(level, now);
    } else {
        gain.hold_current_value();
        gain.set_target_at_time(level, now, time_constant);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::WrappedAudioBuffer;
    use crate::clip::tests::{one_shot, padded_buffer};
    use crate::clip::{SoundClip, SoundClipOptions};
    use crate::generator::GeneratorOptions;
    use crate::noise::{NoiseGenerator, NoiseGeneratorOptions};
    use approx::assert_relative_eq;

    fn manager(ctx: &AudioContext) -> SoundManager {
        let m = SoundManager::new(ctx, HostState::default());
        m.initialize(SoundManagerConfig {
            categories: vec!["ui".into(), "ambience".into()],
            ..Default::default()
        })
        .unwrap();
        m
    }

    fn gain(ctx: &AudioContext, node: NodeId) -> f64 {
        ctx.param(node, ParamName::Gain).value()
    }

    #[test]
    fn test_bus_graph_topology() {
        let ctx = AudioContext::new_running(44100.0);
        let m = manager(&ctx);
        let ui = m.category_bus("ui").unwrap();
        assert!(ctx.is_connected(ui, m.reverb_bus().unwrap()));
        assert!(ctx.is_connected(ui, m.dry_bus().unwrap()));
        assert!(ctx.is_connected(m.wet_bus().unwrap(), m.master_bus().unwrap()));
        assert!(ctx.is_connected(m.dry_bus().unwrap(), m.master_bus().unwrap()));
        assert!(ctx.is_connected(m.master_bus().unwrap(), m.ducking_bus().unwrap()));
        assert!(ctx.is_connected(m.ducking_bus().unwrap(), m.compressor_node().unwrap()));
        assert!(ctx.is_connected(m.compressor_node().unwrap(), ctx.destination()));
        assert!(ctx.has_convolver_buffer(m.reverb_bus().unwrap()));
    }

    #[test]
    fn test_second_initialize_is_rejected() {
        let ctx = AudioContext::new_running(44100.0);
        let m = manager(&ctx);
        assert_eq!(
            m.initialize(SoundManagerConfig::default()),
            Err(SoundError::AlreadyInitialized)
        );
    }

    #[test]
    fn test_duplicate_categories_are_rejected() {
        let ctx = AudioContext::new_running(44100.0);
        let m = SoundManager::new(&ctx, HostState::default());
        let result = m.initialize(SoundManagerConfig {
            categories: vec!["ui".into(), "ui".into()],
            ..Default::default()
        });
        assert_eq!(result, Err(SoundError::DuplicateCategory("ui".into())));
        assert!(!m.is_initialized());
    }

    #[test]
    fn test_config_from_json() {
        let config = SoundManagerConfig::from_json(
            r#"{ "categories": ["ui", "user-interface"], "reverb_level": 0.1 }"#,
        )
        .unwrap();
        assert_eq!(config.categories.len(), 2);
        assert_relative_eq!(config.reverb_level, 0.1);
        assert_relative_eq!(config.ducked_level, DUCKED_LEVEL);

        assert!(matches!(
            SoundManagerConfig::from_json(r#"{ "reverb_level": 3.0 }"#),
            Err(SoundError::InvalidConfig(_))
        ));
        assert!(matches!(
            SoundManagerConfig::from_json("not json"),
            Err(SoundError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_registrations_before_initialize_are_queued() {
        let ctx = AudioContext::new_running(44100.0);
        let m = SoundManager::new(&ctx, HostState::default());
        let a = one_shot(&ctx);
        let b = one_shot(&ctx);
        m.add_sound_generator(&a, SoundGeneratorAddOptions::category("ui"))
            .unwrap();
        m.add_sound_generator(&b, SoundGeneratorAddOptions::default())
            .unwrap();
        m.remove_sound_generator(&b).unwrap();
        assert_eq!(m.pending_operation_count(), 3);
        assert_eq!(m.sound_generator_count(), 0);

        m.initialize(SoundManagerConfig {
            categories: vec!["ui".into()],
            ..Default::default()
        })
        .unwrap();
        assert_eq!(m.pending_operation_count(), 0);
        assert!(m.has_sound_generator(&a));
        assert!(!m.has_sound_generator(&b));
        assert!(a.is_connected_to(m.category_bus("ui").unwrap()));
        assert!(!b.is_connected_to(m.dry_bus().unwrap()));
    }

    #[test]
    fn test_registration_errors() {
        let ctx = AudioContext::new_running(44100.0);
        let m = manager(&ctx);
        let clip = one_shot(&ctx);
        m.add_sound_generator(&clip, SoundGeneratorAddOptions::default())
            .unwrap();
        assert_eq!(
            m.add_sound_generator(&clip, SoundGeneratorAddOptions::default()),
            Err(SoundError::DuplicateGenerator(clip.id().raw()))
        );

        let other = one_shot(&ctx);
        assert_eq!(
            m.add_sound_generator(&other, SoundGeneratorAddOptions::category("nope")),
            Err(SoundError::UnknownCategory("nope".into()))
        );
        assert_eq!(
            m.remove_sound_generator(&other),
            Err(SoundError::UnknownGenerator(other.id().raw()))
        );
    }

    #[test]
    fn test_uncategorized_generator_feeds_reverb_and_dry() {
        let ctx = AudioContext::new_running(44100.0);
        let m = manager(&ctx);
        let clip = one_shot(&ctx);
        m.add_sound_generator(&clip, SoundGeneratorAddOptions::default())
            .unwrap();
        assert!(clip.is_connected_to(m.reverb_bus().unwrap()));
        assert!(clip.is_connected_to(m.dry_bus().unwrap()));

        m.remove_sound_generator(&clip).unwrap();
        assert!(clip.core().connections().is_empty());
    }

    #[test]
    fn test_global_conditions_attach_and_detach() {
        let ctx = AudioContext::new_running(44100.0);
        let host = HostState::default();
        let m = SoundManager::new(&ctx, host.clone());
        m.initialize(SoundManagerConfig::default()).unwrap();
        let clip = one_shot(&ctx);
        m.add_sound_generator(&clip, SoundGeneratorAddOptions::default())
            .unwrap();

        m.set_enabled(false);
        assert!(!clip.is_fully_enabled());
        m.set_enabled(true);
        host.setting_state.set(true);
        assert!(!clip.is_fully_enabled());
        host.setting_state.set(false);
        host.reset_in_progress.set(true);
        assert!(!clip.is_fully_enabled());
        host.reset_in_progress.set(false);
        assert!(clip.is_fully_enabled());

        m.remove_sound_generator(&clip).unwrap();
        m.set_enabled(false);
        assert!(clip.is_fully_enabled());
    }

    #[test]
    fn test_enabled_during_reset_and_extra_tier() {
        let ctx = AudioContext::new_running(44100.0);
        let host = HostState::default();
        let m = SoundManager::new(&ctx, host.clone());
        m.initialize(SoundManagerConfig::default()).unwrap();

        let clip = SoundClip::new(
            &ctx,
            WrappedAudioBuffer::ready(padded_buffer()),
            SoundClipOptions {
                generator: GeneratorOptions {
                    enabled_during_reset: true,
                    sonification_level: SonificationLevel::Extra,
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        m.add_sound_generator(&clip, SoundGeneratorAddOptions::default())
            .unwrap();
        assert!(!clip.is_fully_enabled(), "extra sounds default to off");

        m.set_extra_sound_enabled(true);
        assert!(clip.is_fully_enabled());
        host.reset_in_progress.set(true);
        assert!(clip.is_fully_enabled());
    }

    #[test]
    fn test_view_visibility_condition() {
        let ctx = AudioContext::new_running(44100.0);
        let m = manager(&ctx);
        let visible = Property::new(true);
        let clip = one_shot(&ctx);
        m.add_sound_generator(
            &clip,
            SoundGeneratorAddOptions {
                category: Some("ui".into()),
                associated_view_visible: Some(visible.clone()),
            },
        )
        .unwrap();
        visible.set(false);
        assert!(!clip.is_fully_enabled());
        visible.set(true);
        assert!(clip.is_fully_enabled());

        m.remove_sound_generator(&clip).unwrap();
        assert_eq!(visible.listener_count(), 0);
    }

    #[test]
    fn test_master_gate_follows_host_conditions() {
        let ctx = AudioContext::new_running(44100.0);
        let host = HostState::default();
        let m = SoundManager::new(&ctx, host.clone());
        m.initialize(SoundManagerConfig::default()).unwrap();
        let master = m.master_bus().unwrap();
        ctx.advance(0.2);
        assert!(m.is_master_gate_open());
        assert_relative_eq!(gain(&ctx, master), 1.0);

        host.sim_visible.set(false);
        assert!(!m.is_master_gate_open());
        ctx.advance(0.05);
        assert_relative_eq!(gain(&ctx, master), 0.5, epsilon = 1e-9);
        ctx.advance(0.1);
        assert_relative_eq!(gain(&ctx, master), 0.0);

        host.sim_visible.set(true);
        host.setting_state.set(true);
        assert!(!m.is_master_gate_open());
        host.setting_state.set(false);
        assert!(m.is_master_gate_open());
    }

    #[test]
    fn test_ducking_is_asymmetric() {
        let ctx = AudioContext::new_running(44100.0);
        let m = manager(&ctx);
        let ducking = m.ducking_bus().unwrap();
        let narration = Property::new(false);
        m.add_ducking_property(narration.clone());
        assert!(!m.is_ducked());

        narration.set(true);
        assert!(m.is_ducked());
        ctx.advance(0.5);
        assert_relative_eq!(gain(&ctx, ducking), DUCKED_LEVEL, epsilon = 1e-3);

        narration.set(false);
        ctx.advance(0.5);
        let restored = gain(&ctx, ducking);
        assert!(restored > 0.6 && restored < 0.75, "one time constant in: {}", restored);

        assert!(m.remove_ducking_property(&narration).is_ok());
        assert_eq!(
            m.remove_ducking_property(&narration),
            Err(SoundError::UnknownDuckingProperty)
        );
        assert_eq!(narration.listener_count(), 0);
    }

    #[test]
    fn test_levels() {
        let ctx = AudioContext::new_running(44100.0);
        let m = manager(&ctx);
        m.set_output_level_for_category("ui", 0.3).unwrap();
        assert_relative_eq!(m.output_level_for_category("ui").unwrap(), 0.3, epsilon = 1e-9);
        assert_eq!(
            m.set_output_level_for_category("missing", 0.3),
            Err(SoundError::UnknownCategory("missing".into()))
        );

        m.set_reverb_level(0.25).unwrap();
        ctx.advance(1.0);
        assert_relative_eq!(gain(&ctx, m.wet_bus().unwrap()), 0.25, epsilon = 1e-9);
        assert_relative_eq!(gain(&ctx, m.dry_bus().unwrap()), 0.75, epsilon = 1e-9);
        assert!(m.set_reverb_level(1.5).is_err());

        m.set_master_output_level(0.5).unwrap();
        ctx.advance(1.0);
        assert_relative_eq!(gain(&ctx, m.master_bus().unwrap()), 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_levels_require_initialization() {
        let ctx = AudioContext::new_running(44100.0);
        let m = SoundManager::new(&ctx, HostState::default());
        assert_eq!(m.set_reverb_level(0.1), Err(SoundError::NotInitialized));
        assert_eq!(
            m.output_level_for_category("ui"),
            Err(SoundError::NotInitialized)
        );
    }

    #[test]
    fn test_resume_on_gesture_while_not_running() {
        let ctx = AudioContext::new(44100.0);
        let host = HostState::default();
        let m = SoundManager::new(&ctx, host.clone());
        m.initialize(SoundManagerConfig::default()).unwrap();
        assert!(m.has_resume_listeners());

        ctx.set_resume_allowed(false);
        host.user_gesture.emit(&());
        assert_eq!(ctx.state(), ContextState::Suspended);
        assert!(m.has_resume_listeners(), "listeners stay for the next gesture");

        ctx.set_resume_allowed(true);
        host.touch_start.emit(&());
        assert_eq!(ctx.state(), ContextState::Running);
        assert!(!m.has_resume_listeners());
        assert_eq!(host.touch_start.listener_count(), 0);
        assert_eq!(host.user_gesture.listener_count(), 0);

        ctx.interrupt();
        assert!(m.has_resume_listeners());
        host.user_gesture.emit(&());
        assert!(ctx.is_running());
    }

    #[test]
    fn test_scenario_play_before_session_runs() {
        let ctx = AudioContext::new(44100.0);
        let host = HostState::default();
        let m = SoundManager::new(&ctx, host.clone());
        m.initialize(SoundManagerConfig {
            categories: vec!["ui".into()],
            ..Default::default()
        })
        .unwrap();
        let clip = one_shot(&ctx);
        m.add_sound_generator(&clip, SoundGeneratorAddOptions::category("ui"))
            .unwrap();

        clip.play(0.0);
        assert!(!clip.is_playing());
        assert!(clip.has_deferred_play());

        ctx.advance(0.05);
        host.user_gesture.emit(&());
        assert!(ctx.is_running());
        assert!(clip.is_playing());
        assert_eq!(clip.active_instance_count(), 1);
    }

    #[test]
    fn test_scenario_white_noise_is_bounded_through_the_mix() {
        let ctx = AudioContext::new_running(8000.0);
        let m = manager(&ctx);
        let noise = NoiseGenerator::new(
            &ctx,
            NoiseGeneratorOptions {
                noise_type: NoiseType::White,
                ..Default::default()
            },
        );
        m.add_sound_generator(&noise, SoundGeneratorAddOptions::category("ambience"))
            .unwrap();
        assert!(noise
            .buffer()
            .channel_data(0)
            .iter()
            .all(|s| (-1.0..=1.0).contains(s)));
        noise.start(0.0);
        assert!(noise.is_playing());
    }

    #[test]
    fn test_impulse_response_decays() {
        let ir = synthetic_impulse_response(1000.0, 1.0, 6.0, 1);
        assert_eq!(ir.number_of_channels(), 2);
        assert_eq!(ir.length(), 1000);
        let head: f32 = ir.channel_data(0)[..100].iter().map(|s| s.abs()).sum();
        let tail: f32 = ir.channel_data(0)[900..].iter().map(|s| s.abs()).sum();
        assert!(tail < head);
    }
}
