//! Audio Session and Graph
//!
//! An in-process model of the platform's real-time audio graph: nodes keyed
//! by [`NodeId`], explicit connections, parameter automation timelines, a
//! session state machine with a single native state-change hook, and an
//! asynchronous decoder.
//!
//! The model does not render samples. It keeps exactly the state the
//! orchestration layer schedules against, and evaluates parameter timelines
//! with the platform's formulas so gain ramps can be observed at any time.
//!
//! Time is explicit. [`AudioContext::advance`] moves the wall clock, moves the
//! audio clock while the session is running, fires `ended` notifications for
//! sources that have finished, and completes pending decodes.

use crate::asset::AudioFormat;
use crate::buffer::AudioBuffer;
use crate::clock::Clock;
use crate::error::{DecodeError, SessionError};
use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, SlotMap};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::Cursor;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

new_key_type! {
    /// Unique identifier for a node in the audio graph
    pub struct NodeId;
}

/// Identity of an [`AudioContext`], stable across clones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Platform audio session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextState {
    Suspended,
    Running,
    /// Suspended by the host (e.g. an incoming call), not by the application
    Interrupted,
    Closed,
}

/// Oscillator waveform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OscillatorType {
    #[default]
    Sine,
    Square,
    Sawtooth,
    Triangle,
}

/// Biquad filter response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    Lowpass,
    Highpass,
    Bandpass,
}

/// Automatable parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamName {
    Gain,
    Frequency,
    Detune,
    PlaybackRate,
    Q,
    Threshold,
    Knee,
    Ratio,
    Attack,
    Release,
}

// =============================================================================
// Parameter automation
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParamEvent {
    SetValue { time: f64, value: f64 },
    LinearRamp { time: f64, value: f64 },
    ExponentialRamp { time: f64, value: f64 },
    SetTarget { time: f64, target: f64, time_constant: f64 },
}

impl ParamEvent {
    fn time(&self) -> f64 {
        match *self {
            ParamEvent::SetValue { time, .. }
            | ParamEvent::LinearRamp { time, .. }
            | ParamEvent::ExponentialRamp { time, .. }
            | ParamEvent::SetTarget { time, .. } => time,
        }
    }
}

/// The automation timeline of a single parameter.
#[derive(Debug, Clone)]
pub struct AudioParam {
    default_value: f64,
    events: Vec<ParamEvent>,
}

impl AudioParam {
    pub fn new(default_value: f64) -> Self {
        Self {
            default_value,
            events: Vec::new(),
        }
    }

    fn insert(&mut self, event: ParamEvent) {
        let index = self
            .events
            .iter()
            .position(|e| e.time() > event.time())
            .unwrap_or(self.events.len());
        self.events.insert(index, event);
    }

    pub fn set_value_at_time(&mut self, value: f64, time: f64) {
        self.insert(ParamEvent::SetValue { time, value });
    }

    pub fn linear_ramp_to_value_at_time(&mut self, value: f64, time: f64) {
        self.insert(ParamEvent::LinearRamp { time, value });
    }

    pub fn exponential_ramp_to_value_at_time(&mut self, value: f64, time: f64) {
        debug_assert!(value != 0.0, "exponential ramps cannot reach zero");
        self.insert(ParamEvent::ExponentialRamp { time, value });
    }

    pub fn set_target_at_time(&mut self, target: f64, time: f64, time_constant: f64) {
        debug_assert!(time_constant >= 0.0, "time constant must be non-negative");
        self.insert(ParamEvent::SetTarget {
            time,
            target,
            time_constant,
        });
    }

    /// Drop every event scheduled at or after `time`.
    pub fn cancel_scheduled_values(&mut self, time: f64) {
        self.events.retain(|e| e.time() < time);
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Evaluate the timeline at `time`.
    pub fn value_at(&self, time: f64) -> f64 {
        let mut value = self.default_value;
        let mut last_time = 0.0_f64;

        for (i, event) in self.events.iter().enumerate() {
            match *event {
                ParamEvent::SetValue { time: at, value: v } => {
                    if at > time {
                        break;
                    }
                    value = v;
                    last_time = at;
                }
                ParamEvent::LinearRamp { time: end, value: v } => {
                    if end <= time {
                        value = v;
                        last_time = end;
                        continue;
                    }
                    let span = end - last_time;
                    if span <= 0.0 {
                        return v;
                    }
                    let fraction = ((time - last_time) / span).clamp(0.0, 1.0);
                    return value + (v - value) * fraction;
                }
                ParamEvent::ExponentialRamp { time: end, value: v } => {
                    if end <= time {
                        value = v;
                        last_time = end;
                        continue;
                    }
                    // No exponential path through zero or across a sign change
                    if value * v <= 0.0 {
                        return value;
                    }
                    let span = end - last_time;
                    if span <= 0.0 {
                        return v;
                    }
                    let fraction = ((time - last_time) / span).clamp(0.0, 1.0);
                    return value * libm::pow(v / value, fraction);
                }
                ParamEvent::SetTarget {
                    time: start,
                    target,
                    time_constant,
                } => {
                    if start > time {
                        break;
                    }
                    let next_time = self
                        .events
                        .get(i + 1)
                        .map(ParamEvent::time)
                        .unwrap_or(f64::INFINITY);
                    let until = time.min(next_time);
                    value = if time_constant <= 0.0 {
                        target
                    } else {
                        target + (value - target) * libm::exp(-(until - start) / time_constant)
                    };
                    last_time = until;
                    if next_time > time {
                        return value;
                    }
                }
            }
        }

        value
    }
}

// =============================================================================
// Nodes
// =============================================================================

/// Lifecycle of a scheduled source (buffer source or oscillator)
#[derive(Default)]
struct Playback {
    start_time: Option<f64>,
    stop_time: Option<f64>,
    ended: bool,
    on_ended: Option<Rc<dyn Fn()>>,
}

#[derive(Default)]
struct BufferSourceState {
    buffer: Option<AudioBuffer>,
    looping: bool,
    loop_start: f64,
    loop_end: f64,
    offset: f64,
    playback: Playback,
}

#[derive(Default)]
struct OscillatorState {
    waveform: OscillatorType,
    playback: Playback,
}

enum NodeKind {
    Destination,
    Gain,
    BufferSource(BufferSourceState),
    Oscillator(OscillatorState),
    BiquadFilter(FilterType),
    Convolver(Option<AudioBuffer>),
    DynamicsCompressor,
}

impl NodeKind {
    fn playback(&self) -> Option<&Playback> {
        match self {
            NodeKind::BufferSource(s) => Some(&s.playback),
            NodeKind::Oscillator(o) => Some(&o.playback),
            _ => None,
        }
    }

    fn playback_mut(&mut self) -> Option<&mut Playback> {
        match self {
            NodeKind::BufferSource(s) => Some(&mut s.playback),
            NodeKind::Oscillator(o) => Some(&mut o.playback),
            _ => None,
        }
    }
}

/// An outgoing edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connection {
    Node(NodeId),
    Param(NodeId, ParamName),
}

struct Node {
    kind: NodeKind,
    params: Vec<(ParamName, AudioParam)>,
    outputs: Vec<Connection>,
}

impl Node {
    fn new(kind: NodeKind, params: &[(ParamName, f64)]) -> Self {
        Self {
            kind,
            params: params
                .iter()
                .map(|&(name, default)| (name, AudioParam::new(default)))
                .collect(),
            outputs: Vec::new(),
        }
    }

    fn param(&self, name: ParamName) -> Option<&AudioParam> {
        self.params.iter().find(|(n, _)| *n == name).map(|(_, p)| p)
    }

    fn param_mut(&mut self, name: ParamName) -> Option<&mut AudioParam> {
        self.params
            .iter_mut()
            .find(|(n, _)| *n == name)
            .map(|(_, p)| p)
    }

    /// Time at which this source stops producing sound, if it is bounded.
    fn end_time(&self) -> Option<f64> {
        let playback = self.kind.playback()?;
        let start = playback.start_time?;
        let natural = match &self.kind {
            NodeKind::BufferSource(source) if !source.looping => {
                source.buffer.as_ref().map(|buffer| {
                    let rate = self
                        .param(ParamName::PlaybackRate)
                        .map_or(1.0, |p| p.value_at(start))
                        .abs()
                        .max(f64::EPSILON);
                    start + (buffer.duration() - source.offset).max(0.0) / rate
                })
            }
            _ => None,
        };
        match (playback.stop_time, natural) {
            (Some(stop), Some(natural)) => Some(stop.min(natural)),
            (stop, natural) => stop.or(natural),
        }
    }
}

// =============================================================================
// AudioContext
// =============================================================================

/// The single native state-change hook a session supports
pub type StateChangeHook = Rc<dyn Fn(ContextState)>;

/// Completion callback for an asynchronous decode
pub type DecodeCallback = Box<dyn FnOnce(Result<AudioBuffer, DecodeError>)>;

struct PendingDecode {
    bytes: Vec<u8>,
    format: AudioFormat,
    callback: DecodeCallback,
}

struct ContextInner {
    id: ContextId,
    sample_rate: f64,
    graph: RefCell<SlotMap<NodeId, Node>>,
    destination: NodeId,
    state: Cell<ContextState>,
    current_time: Cell<f64>,
    wall_time: Cell<f64>,
    resume_allowed: Cell<bool>,
    state_hook: RefCell<Option<StateChangeHook>>,
    pending_decodes: RefCell<VecDeque<PendingDecode>>,
    decode_count: Cell<usize>,
}

/// Handle to a platform audio session and its graph.
///
/// Clones refer to the same session.
#[derive(Clone)]
pub struct AudioContext {
    inner: Rc<ContextInner>,
}

impl std::fmt::Debug for AudioContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioContext")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("current_time", &self.current_time())
            .field("nodes", &self.node_count())
            .finish()
    }
}

impl AudioContext {
    /// A new session in the `Suspended` state, as browsers create them
    /// before the first user gesture.
    pub fn new(sample_rate: f64) -> Self {
        let mut graph = SlotMap::with_key();
        let destination = graph.insert(Node::new(NodeKind::Destination, &[]));
        Self {
            inner: Rc::new(ContextInner {
                id: ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)),
                sample_rate,
                graph: RefCell::new(graph),
                destination,
                state: Cell::new(ContextState::Suspended),
                current_time: Cell::new(0.0),
                wall_time: Cell::new(0.0),
                resume_allowed: Cell::new(true),
                state_hook: RefCell::new(None),
                pending_decodes: RefCell::new(VecDeque::new()),
                decode_count: Cell::new(0),
            }),
        }
    }

    /// A new session that is already running
    pub fn new_running(sample_rate: f64) -> Self {
        let context = Self::new(sample_rate);
        context.inner.state.set(ContextState::Running);
        context
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn sample_rate(&self) -> f64 {
        self.inner.sample_rate
    }

    pub fn destination(&self) -> NodeId {
        self.inner.destination
    }

    /// Audio clock in seconds; frozen while not running
    pub fn current_time(&self) -> f64 {
        self.inner.current_time.get()
    }

    /// Wall clock in seconds; always advances
    pub fn wall_time(&self) -> f64 {
        self.inner.wall_time.get()
    }

    pub fn ptr_eq(&self, other: &AudioContext) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    // -------------------------------------------------------------------------
    // Session state
    // -------------------------------------------------------------------------

    pub fn state(&self) -> ContextState {
        self.inner.state.get()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ContextState::Running
    }

    /// Install or clear the native state-change hook. There is exactly one
    /// slot; installing replaces whatever was there.
    pub fn set_state_change_hook(&self, hook: Option<StateChangeHook>) {
        *self.inner.state_hook.borrow_mut() = hook;
    }

    pub fn has_state_change_hook(&self) -> bool {
        self.inner.state_hook.borrow().is_some()
    }

    /// Whether the host will honor [`AudioContext::resume`] (autoplay policy).
    pub fn set_resume_allowed(&self, allowed: bool) {
        self.inner.resume_allowed.set(allowed);
    }

    pub fn resume(&self) -> Result<(), SessionError> {
        match self.state() {
            ContextState::Closed => Err(SessionError::Closed),
            ContextState::Running => Ok(()),
            _ if !self.inner.resume_allowed.get() => Err(SessionError::ResumeRejected),
            _ => {
                self.set_state(ContextState::Running);
                Ok(())
            }
        }
    }

    pub fn suspend(&self) {
        if self.state() != ContextState::Closed {
            self.set_state(ContextState::Suspended);
        }
    }

    /// Host-initiated interruption
    pub fn interrupt(&self) {
        if self.state() != ContextState::Closed {
            self.set_state(ContextState::Interrupted);
        }
    }

    pub fn close(&self) {
        self.set_state(ContextState::Closed);
    }

    fn set_state(&self, state: ContextState) {
        if self.inner.state.replace(state) == state {
            return;
        }
        debug!(context = self.inner.id.0, ?state, "audio session state changed");
        let hook = self.inner.state_hook.borrow().clone();
        if let Some(hook) = hook {
            hook(state);
        }
    }

    // -------------------------------------------------------------------------
    // Time
    // -------------------------------------------------------------------------

    /// Move time forward. The audio clock only moves while running.
    pub fn advance(&self, seconds: f64) {
        debug_assert!(seconds >= 0.0, "time cannot go backwards");
        self.inner.wall_time.set(self.inner.wall_time.get() + seconds);
        if self.is_running() {
            self.inner
                .current_time
                .set(self.inner.current_time.get() + seconds);
            self.fire_ended();
        }
        self.run_pending_decodes();
    }

    fn fire_ended(&self) {
        let now = self.current_time();
        let callbacks: Vec<Rc<dyn Fn()>> = {
            let mut graph = self.inner.graph.borrow_mut();
            let finished: Vec<NodeId> = graph
                .iter()
                .filter(|(_, node)| {
                    node.kind.playback().is_some_and(|p| !p.ended)
                        && node.end_time().is_some_and(|end| end <= now)
                })
                .map(|(id, _)| id)
                .collect();
            finished
                .into_iter()
                .filter_map(|id| {
                    let playback = graph.get_mut(id)?.kind.playback_mut()?;
                    playback.ended = true;
                    playback.on_ended.clone()
                })
                .collect()
        };
        for callback in callbacks {
            callback();
        }
    }

    // -------------------------------------------------------------------------
    // Node creation
    // -------------------------------------------------------------------------

    fn insert(&self, node: Node) -> NodeId {
        self.inner.graph.borrow_mut().insert(node)
    }

    pub fn create_gain(&self) -> NodeId {
        self.insert(Node::new(NodeKind::Gain, &[(ParamName::Gain, 1.0)]))
    }

    pub fn create_buffer_source(&self) -> NodeId {
        self.insert(Node::new(
            NodeKind::BufferSource(BufferSourceState::default()),
            &[(ParamName::PlaybackRate, 1.0), (ParamName::Detune, 0.0)],
        ))
    }

    pub fn create_oscillator(&self) -> NodeId {
        self.insert(Node::new(
            NodeKind::Oscillator(OscillatorState::default()),
            &[(ParamName::Frequency, 440.0), (ParamName::Detune, 0.0)],
        ))
    }

    pub fn create_biquad_filter(&self, filter_type: FilterType) -> NodeId {
        self.insert(Node::new(
            NodeKind::BiquadFilter(filter_type),
            &[
                (ParamName::Frequency, 350.0),
                (ParamName::Q, 1.0),
                (ParamName::Gain, 0.0),
                (ParamName::Detune, 0.0),
            ],
        ))
    }

    pub fn create_convolver(&self, impulse_response: Option<AudioBuffer>) -> NodeId {
        self.insert(Node::new(NodeKind::Convolver(impulse_response), &[]))
    }

    pub fn create_dynamics_compressor(&self) -> NodeId {
        self.insert(Node::new(
            NodeKind::DynamicsCompressor,
            &[
                (ParamName::Threshold, -24.0),
                (ParamName::Knee, 30.0),
                (ParamName::Ratio, 12.0),
                (ParamName::Attack, 0.003),
                (ParamName::Release, 0.25),
            ],
        ))
    }

    /// Remove a node and every edge into it.
    pub fn remove_node(&self, id: NodeId) -> bool {
        if id == self.inner.destination {
            return false;
        }
        let mut graph = self.inner.graph.borrow_mut();
        if graph.remove(id).is_none() {
            return false;
        }
        for (_, node) in graph.iter_mut() {
            node.outputs.retain(|c| match c {
                Connection::Node(to) | Connection::Param(to, _) => *to != id,
            });
        }
        true
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        self.inner.graph.borrow().contains_key(id)
    }

    pub fn node_count(&self) -> usize {
        self.inner.graph.borrow().len()
    }

    // -------------------------------------------------------------------------
    // Connections
    // -------------------------------------------------------------------------

    fn add_connection(&self, from: NodeId, connection: Connection) {
        let mut graph = self.inner.graph.borrow_mut();
        let target = match connection {
            Connection::Node(to) | Connection::Param(to, _) => to,
        };
        if !graph.contains_key(target) {
            warn!("ignoring connection to a node that no longer exists");
            return;
        }
        match graph.get_mut(from) {
            Some(node) => {
                if !node.outputs.contains(&connection) {
                    node.outputs.push(connection);
                }
            }
            None => warn!("ignoring connection from a node that no longer exists"),
        }
    }

    pub fn connect(&self, from: NodeId, to: NodeId) {
        self.add_connection(from, Connection::Node(to));
    }

    /// Connect a node's output to a parameter of another node (modulation).
    pub fn connect_param(&self, from: NodeId, to: NodeId, param: ParamName) {
        self.add_connection(from, Connection::Param(to, param));
    }

    pub fn disconnect(&self, from: NodeId, to: NodeId) -> bool {
        let mut graph = self.inner.graph.borrow_mut();
        let Some(node) = graph.get_mut(from) else {
            return false;
        };
        let before = node.outputs.len();
        node.outputs.retain(|c| *c != Connection::Node(to));
        node.outputs.len() != before
    }

    pub fn disconnect_all(&self, from: NodeId) {
        if let Some(node) = self.inner.graph.borrow_mut().get_mut(from) {
            node.outputs.clear();
        }
    }

    pub fn is_connected(&self, from: NodeId, to: NodeId) -> bool {
        self.inner
            .graph
            .borrow()
            .get(from)
            .is_some_and(|n| n.outputs.contains(&Connection::Node(to)))
    }

    pub fn is_connected_to_param(&self, from: NodeId, to: NodeId, param: ParamName) -> bool {
        self.inner
            .graph
            .borrow()
            .get(from)
            .is_some_and(|n| n.outputs.contains(&Connection::Param(to, param)))
    }

    // -------------------------------------------------------------------------
    // Parameters
    // -------------------------------------------------------------------------

    /// Handle to one parameter of one node
    pub fn param(&self, node: NodeId, name: ParamName) -> ParamHandle {
        ParamHandle {
            context: self.clone(),
            node,
            name,
        }
    }

    fn with_param<R>(&self, node: NodeId, name: ParamName, f: impl FnOnce(&mut AudioParam) -> R) -> Option<R> {
        let mut graph = self.inner.graph.borrow_mut();
        let param = graph.get_mut(node)?.param_mut(name);
        if param.is_none() {
            warn!(?name, "node has no such parameter");
        }
        param.map(f)
    }

    // -------------------------------------------------------------------------
    // Scheduled sources
    // -------------------------------------------------------------------------

    pub fn set_buffer(&self, node: NodeId, buffer: AudioBuffer) {
        if let Some(NodeKind::BufferSource(source)) =
            self.inner.graph.borrow_mut().get_mut(node).map(|n| &mut n.kind)
        {
            source.buffer = Some(buffer);
        }
    }

    /// Configure looping between `loop_start` and `loop_end` seconds.
    pub fn set_loop(&self, node: NodeId, looping: bool, loop_start: f64, loop_end: f64) {
        if let Some(NodeKind::BufferSource(source)) =
            self.inner.graph.borrow_mut().get_mut(node).map(|n| &mut n.kind)
        {
            source.looping = looping;
            source.loop_start = loop_start;
            source.loop_end = loop_end;
        }
    }

    /// Loop configuration of a buffer source: `(looping, start, end)`
    pub fn loop_points(&self, node: NodeId) -> Option<(bool, f64, f64)> {
        match self.inner.graph.borrow().get(node).map(|n| &n.kind) {
            Some(NodeKind::BufferSource(s)) => Some((s.looping, s.loop_start, s.loop_end)),
            _ => None,
        }
    }

    /// Start offset of a buffer source, in seconds into its buffer
    pub fn source_offset(&self, node: NodeId) -> Option<f64> {
        match self.inner.graph.borrow().get(node).map(|n| &n.kind) {
            Some(NodeKind::BufferSource(s)) => Some(s.offset),
            _ => None,
        }
    }

    pub fn set_oscillator_type(&self, node: NodeId, waveform: OscillatorType) {
        if let Some(NodeKind::Oscillator(osc)) =
            self.inner.graph.borrow_mut().get_mut(node).map(|n| &mut n.kind)
        {
            osc.waveform = waveform;
        }
    }

    pub fn oscillator_type(&self, node: NodeId) -> Option<OscillatorType> {
        match self.inner.graph.borrow().get(node).map(|n| &n.kind) {
            Some(NodeKind::Oscillator(osc)) => Some(osc.waveform),
            _ => None,
        }
    }

    pub fn filter_type(&self, node: NodeId) -> Option<FilterType> {
        match self.inner.graph.borrow().get(node).map(|n| &n.kind) {
            Some(NodeKind::BiquadFilter(t)) => Some(*t),
            _ => None,
        }
    }

    pub fn has_convolver_buffer(&self, node: NodeId) -> bool {
        matches!(
            self.inner.graph.borrow().get(node).map(|n| &n.kind),
            Some(NodeKind::Convolver(Some(_)))
        )
    }

    /// Schedule a source to start. Sources are single-use.
    pub fn start_source(&self, node: NodeId, when: f64, offset: f64) {
        let now = self.current_time();
        let mut graph = self.inner.graph.borrow_mut();
        let Some(n) = graph.get_mut(node) else {
            return;
        };
        if let NodeKind::BufferSource(source) = &mut n.kind {
            source.offset = offset.max(0.0);
        }
        if let Some(playback) = n.kind.playback_mut() {
            debug_assert!(playback.start_time.is_none(), "sources can only be started once");
            playback.start_time = Some(when.max(now));
        }
    }

    /// Schedule a source to stop. A later call replaces an earlier one.
    pub fn stop_source(&self, node: NodeId, when: f64) {
        let now = self.current_time();
        if let Some(playback) = self
            .inner
            .graph
            .borrow_mut()
            .get_mut(node)
            .and_then(|n| n.kind.playback_mut())
        {
            playback.stop_time = Some(when.max(now));
        }
    }

    pub fn set_on_ended(&self, node: NodeId, callback: impl Fn() + 'static) {
        if let Some(playback) = self
            .inner
            .graph
            .borrow_mut()
            .get_mut(node)
            .and_then(|n| n.kind.playback_mut())
        {
            playback.on_ended = Some(Rc::new(callback));
        }
    }

    /// Started and not yet ended
    pub fn is_source_active(&self, node: NodeId) -> bool {
        self.inner
            .graph
            .borrow()
            .get(node)
            .and_then(|n| n.kind.playback())
            .is_some_and(|p| p.start_time.is_some() && !p.ended)
    }

    pub fn source_stop_time(&self, node: NodeId) -> Option<f64> {
        self.inner
            .graph
            .borrow()
            .get(node)
            .and_then(|n| n.kind.playback())
            .and_then(|p| p.stop_time)
    }

    pub fn active_source_count(&self) -> usize {
        self.inner
            .graph
            .borrow()
            .values()
            .filter_map(|n| n.kind.playback())
            .filter(|p| p.start_time.is_some() && !p.ended)
            .count()
    }

    // -------------------------------------------------------------------------
    // Decoding
    // -------------------------------------------------------------------------

    /// Queue bytes for decoding. The callback runs when pending decodes are
    /// processed, never from within this call.
    pub fn decode_audio_data(&self, bytes: Vec<u8>, format: AudioFormat, callback: DecodeCallback) {
        self.inner.decode_count.set(self.inner.decode_count.get() + 1);
        self.inner.pending_decodes.borrow_mut().push_back(PendingDecode {
            bytes,
            format,
            callback,
        });
    }

    /// Complete every queued decode, including any queued while running.
    pub fn run_pending_decodes(&self) -> usize {
        let mut completed = 0;
        loop {
            let next = self.inner.pending_decodes.borrow_mut().pop_front();
            let Some(pending) = next else {
                break;
            };
            let result = decode_bytes(&pending.bytes, pending.format);
            (pending.callback)(result);
            completed += 1;
        }
        completed
    }

    pub fn pending_decode_count(&self) -> usize {
        self.inner.pending_decodes.borrow().len()
    }

    /// Total decodes ever submitted
    pub fn decode_count(&self) -> usize {
        self.inner.decode_count.get()
    }
}

impl Clock for AudioContext {
    fn now(&self) -> f64 {
        self.wall_time()
    }
}

fn decode_bytes(bytes: &[u8], format: AudioFormat) -> Result<AudioBuffer, DecodeError> {
    match format {
        AudioFormat::Wav => decode_wav(bytes),
        other => Err(DecodeError::UnsupportedFormat(other.mime_type().to_string())),
    }
}

fn decode_wav(bytes: &[u8]) -> Result<AudioBuffer, DecodeError> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();

    let samples: Result<Vec<f32>, hound::Error> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect(),
        hound::SampleFormat::Int => {
            let max_value = (1_i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|sample| sample.map(|s| s as f32 / max_value))
                .collect()
        }
    };
    let samples = samples?;
    if samples.is_empty() {
        return Err(DecodeError::Corrupt("no sample frames".into()));
    }

    Ok(AudioBuffer::from_interleaved(
        &samples,
        spec.channels as usize,
        spec.sample_rate as f64,
    ))
}

/// Encode mono samples as a 16-bit PCM WAV file.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>, DecodeError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            writer.write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// A handle to one automatable parameter.
#[derive(Clone)]
pub struct ParamHandle {
    context: AudioContext,
    node: NodeId,
    name: ParamName,
}

impl ParamHandle {
    /// Value at the current audio time
    pub fn value(&self) -> f64 {
        self.value_at(self.context.current_time())
    }

    pub fn value_at(&self, time: f64) -> f64 {
        let graph = self.context.inner.graph.borrow();
        graph
            .get(self.node)
            .and_then(|n| n.param(self.name))
            .map_or(0.0, |p| p.value_at(time))
    }

    pub fn set_value_at_time(&self, value: f64, time: f64) {
        self.context
            .with_param(self.node, self.name, |p| p.set_value_at_time(value, time));
    }

    pub fn linear_ramp_to_value_at_time(&self, value: f64, time: f64) {
        self.context.with_param(self.node, self.name, |p| {
            p.linear_ramp_to_value_at_time(value, time)
        });
    }

    pub fn exponential_ramp_to_value_at_time(&self, value: f64, time: f64) {
        self.context.with_param(self.node, self.name, |p| {
            p.exponential_ramp_to_value_at_time(value, time)
        });
    }

    pub fn set_target_at_time(&self, target: f64, time: f64, time_constant: f64) {
        self.context.with_param(self.node, self.name, |p| {
            p.set_target_at_time(target, time, time_constant)
        });
    }

    pub fn cancel_scheduled_values(&self, time: f64) {
        self.context
            .with_param(self.node, self.name, |p| p.cancel_scheduled_values(time));
    }

    /// Cancel everything from now on and pin the current value, so that a
    /// following ramp starts from where the parameter actually is.
    pub fn hold_current_value(&self) -> f64 {
        let now = self.context.current_time();
        let value = self.value_at(now);
        self.cancel_scheduled_values(now);
        self.set_value_at_time(value, now);
        value
    }

    pub fn event_count(&self) -> usize {
        let graph = self.context.inner.graph.borrow();
        graph
            .get(self.node)
            .and_then(|n| n.param(self.name))
            .map_or(0, AudioParam::event_count)
    }
}
