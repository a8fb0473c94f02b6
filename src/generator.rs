//! Sound Generator Base
//!
//! Every sound source owns a [`GeneratorCore`]: a dedicated output gain node,
//! the set of boolean conditions that together decide whether it is audible,
//! and the bookkeeping of where its output is connected.
//!
//! ```text
//!   internal nodes ──► gain ──► [additional nodes] ──► destinations
//!                       ▲
//!        fully enabled ─┘  (linear ramp to 0 or to the output level)
//! ```
//!
//! The audio graph cannot report existing connections, so the core tracks its
//! own outgoing edges. The enable control is a [`ConditionSet`]: the generator
//! is fully enabled exactly when every member condition is true.

use crate::context::{AudioContext, NodeId, ParamName};
use crate::property::{ConditionSet, ListenerId, Property, ReadOnlyProperty};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Default time constant for output level changes, in seconds
pub const DEFAULT_TIME_CONSTANT: f64 = 0.015;

/// Duration of the gain ramp applied when enablement changes, in seconds
pub const DEFAULT_LINEAR_GAIN_CHANGE_TIME: f64 = 0.1;

/// Unique identifier of a generator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeneratorId(u64);

impl GeneratorId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

static NEXT_GENERATOR_ID: AtomicU64 = AtomicU64::new(1);

/// Which sonification tier a generator belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SonificationLevel {
    /// Always part of the sound design
    #[default]
    Basic,
    /// Only audible when extra sounds are turned on
    Extra,
}

/// Construction options shared by every generator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorOptions {
    /// Output level applied at construction
    pub initial_output_level: f64,

    /// Conditions that must all be true for the generator to be audible,
    /// beyond its own local enable flag
    #[serde(skip)]
    pub enable_controls: Vec<Property<bool>>,

    pub sonification_level: SonificationLevel,

    /// Stay enabled while the whole application is resetting
    pub enabled_during_reset: bool,

    /// Nodes chained after the output gain, in order
    #[serde(skip)]
    pub additional_audio_nodes: Vec<NodeId>,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            initial_output_level: 1.0,
            enable_controls: Vec::new(),
            sonification_level: SonificationLevel::Basic,
            enabled_during_reset: false,
            additional_audio_nodes: Vec::new(),
        }
    }
}

/// State shared by every sound generator.
pub struct GeneratorCore {
    id: GeneratorId,
    context: AudioContext,
    gain: NodeId,
    chain: Vec<NodeId>,
    output_level: Cell<f64>,
    connections: RefCell<Vec<NodeId>>,
    conditions: ConditionSet,
    local_enabled: Property<bool>,
    enabled_link: Cell<Option<ListenerId>>,
    sonification_level: SonificationLevel,
    enabled_during_reset: bool,
    disposed: Cell<bool>,
}

impl std::fmt::Debug for GeneratorCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratorCore")
            .field("id", &self.id)
            .field("output_level", &self.output_level.get())
            .field("fully_enabled", &self.is_fully_enabled())
            .field("conditions", &self.conditions.len())
            .finish()
    }
}

impl GeneratorCore {
    pub fn new(context: &AudioContext, options: GeneratorOptions) -> Rc<Self> {
        let gain = context.create_gain();
        let mut previous = gain;
        for &node in &options.additional_audio_nodes {
            context.connect(previous, node);
            previous = node;
        }
        let mut chain = vec![gain];
        chain.extend(options.additional_audio_nodes.iter().copied());

        let conditions = ConditionSet::new();
        let local_enabled = Property::new(true);
        conditions.add(local_enabled.clone());
        for control in options.enable_controls {
            conditions.add(control);
        }

        let core = Rc::new_cyclic(|weak: &Weak<GeneratorCore>| {
            let weak = weak.clone();
            let link = conditions.output().lazy_link(move |enabled, _| {
                if let Some(core) = weak.upgrade() {
                    core.apply_enabled(*enabled);
                }
            });
            GeneratorCore {
                id: GeneratorId(NEXT_GENERATOR_ID.fetch_add(1, Ordering::Relaxed)),
                context: context.clone(),
                gain,
                chain,
                output_level: Cell::new(options.initial_output_level),
                connections: RefCell::new(Vec::new()),
                conditions,
                local_enabled,
                enabled_link: Cell::new(Some(link)),
                sonification_level: options.sonification_level,
                enabled_during_reset: options.enabled_during_reset,
                disposed: Cell::new(false),
            }
        });

        let initial = if core.is_fully_enabled() {
            options.initial_output_level
        } else {
            0.0
        };
        context
            .param(gain, ParamName::Gain)
            .set_value_at_time(initial, context.current_time());
        core
    }

    pub fn id(&self) -> GeneratorId {
        self.id
    }

    pub fn context(&self) -> &AudioContext {
        &self.context
    }

    /// The output gain node. Internal nodes feed into it.
    pub fn gain_node(&self) -> NodeId {
        self.gain
    }

    fn output_node(&self) -> NodeId {
        self.chain.last().copied().unwrap_or(self.gain)
    }

    pub fn sonification_level(&self) -> SonificationLevel {
        self.sonification_level
    }

    pub fn enabled_during_reset(&self) -> bool {
        self.enabled_during_reset
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.get()
    }

    // -------------------------------------------------------------------------
    // Connections
    // -------------------------------------------------------------------------

    pub fn connect(&self, destination: NodeId) {
        let mut connections = self.connections.borrow_mut();
        if connections.contains(&destination) {
            return;
        }
        self.context.connect(self.output_node(), destination);
        connections.push(destination);
    }

    pub fn disconnect(&self, destination: NodeId) {
        let mut connections = self.connections.borrow_mut();
        if let Some(index) = connections.iter().position(|d| *d == destination) {
            connections.remove(index);
            self.context.disconnect(self.output_node(), destination);
        }
    }

    pub fn is_connected_to(&self, destination: NodeId) -> bool {
        self.connections.borrow().contains(&destination)
    }

    pub fn connections(&self) -> Vec<NodeId> {
        self.connections.borrow().clone()
    }

    // -------------------------------------------------------------------------
    // Output level
    // -------------------------------------------------------------------------

    pub fn output_level(&self) -> f64 {
        self.output_level.get()
    }

    /// Set the output level. A zero time constant is instantaneous; otherwise
    /// the gain approaches the level exponentially. The level is recorded but
    /// not applied while the generator is not fully enabled.
    pub fn set_output_level(&self, level: f64, time_constant: f64) {
        debug_assert!(time_constant >= 0.0, "time constant must be non-negative");
        self.output_level.set(level);
        if !self.is_fully_enabled() || self.disposed.get() {
            return;
        }

        let now = self.context.current_time();
        let gain = self.context.param(self.gain, ParamName::Gain);
        if time_constant == 0.0 {
            gain.cancel_scheduled_values(now);
            gain.set_value_at_time(level, now);
        } else if self.context.is_running() {
            gain.hold_current_value();
            gain.set_target_at_time(level, now, time_constant);
        } else {
            // Target ramps do not progress on a session that is not running
            gain.hold_current_value();
            gain.linear_ramp_to_value_at_time(level, now + time_constant * 4.0);
        }
    }

    fn apply_enabled(&self, enabled: bool) {
        if self.disposed.get() {
            return;
        }
        trace!(generator = self.id.0, enabled, "generator enablement changed");
        let now = self.context.current_time();
        let gain = self.context.param(self.gain, ParamName::Gain);
        gain.hold_current_value();
        let target = if enabled { self.output_level.get() } else { 0.0 };
        gain.linear_ramp_to_value_at_time(target, now + DEFAULT_LINEAR_GAIN_CHANGE_TIME);
    }

    // -------------------------------------------------------------------------
    // Enablement
    // -------------------------------------------------------------------------

    pub fn is_fully_enabled(&self) -> bool {
        self.conditions.all_true()
    }

    pub fn fully_enabled_property(&self) -> ReadOnlyProperty<bool> {
        self.conditions.output()
    }

    /// This generator's own enable flag
    pub fn enabled_property(&self) -> Property<bool> {
        self.local_enabled.clone()
    }

    pub fn add_enable_control(&self, condition: Property<bool>) {
        self.conditions.add(condition);
    }

    pub fn remove_enable_control(&self, condition: &Property<bool>) -> bool {
        self.conditions.remove(condition)
    }

    pub fn has_enable_control(&self, condition: &Property<bool>) -> bool {
        self.conditions.contains(condition)
    }

    /// Release every condition subscription and disconnect the output.
    /// Safe to call more than once.
    pub fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        if let Some(link) = self.enabled_link.take() {
            self.conditions.output().unlink(link);
        }
        self.conditions.dispose();
        let output = self.output_node();
        for destination in self.connections.borrow_mut().drain(..) {
            self.context.disconnect(output, destination);
        }
    }
}

/// A source of sound that can be wired into the mix.
pub trait SoundGenerator {
    fn core(&self) -> &Rc<GeneratorCore>;

    fn id(&self) -> GeneratorId {
        self.core().id()
    }

    fn connect(&self, destination: NodeId) {
        self.core().connect(destination);
    }

    fn disconnect(&self, destination: NodeId) {
        self.core().disconnect(destination);
    }

    fn is_connected_to(&self, destination: NodeId) -> bool {
        self.core().is_connected_to(destination)
    }

    fn set_output_level(&self, level: f64, time_constant: f64) {
        self.core().set_output_level(level, time_constant);
    }

    fn output_level(&self) -> f64 {
        self.core().output_level()
    }

    fn is_fully_enabled(&self) -> bool {
        self.core().is_fully_enabled()
    }

    fn fully_enabled_property(&self) -> ReadOnlyProperty<bool> {
        self.core().fully_enabled_property()
    }

    fn enabled_property(&self) -> Property<bool> {
        self.core().enabled_property()
    }

    fn add_enable_control(&self, condition: Property<bool>) {
        self.core().add_enable_control(condition);
    }

    fn remove_enable_control(&self, condition: &Property<bool>) -> bool {
        self.core().remove_enable_control(condition)
    }

    fn dispose(&self) {
        self.core().dispose();
    }
}
