//! Observables
//!
//! Single-threaded observable values and events. Everything in the crate that
//! reacts to a change (enable conditions, ducking, visibility, value-driven
//! sounds) is wired through these types.
//!
//! Listeners are always invoked from a snapshot of the listener list, so a
//! listener may unlink itself, or others, while a notification is running.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Identifier returned when a listener is attached, used to detach it later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

thread_local! {
    static NEXT_LISTENER_ID: Cell<u64> = const { Cell::new(1) };
}

fn next_listener_id() -> ListenerId {
    NEXT_LISTENER_ID.with(|next| {
        let id = next.get();
        next.set(id + 1);
        ListenerId(id)
    })
}

type ChangeListener<T> = Rc<dyn Fn(&T, &T)>;

struct PropertyInner<T> {
    value: RefCell<T>,
    listeners: RefCell<Vec<(ListenerId, ChangeListener<T>)>>,
}

// =============================================================================
// Property
// =============================================================================

/// An observable value.
///
/// Cloning a `Property` yields another handle to the same value.
pub struct Property<T> {
    inner: Rc<PropertyInner<T>>,
}

impl<T> Clone for Property<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Property<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Property")
            .field("value", &*self.inner.value.borrow())
            .field("listeners", &self.inner.listeners.borrow().len())
            .finish()
    }
}

impl<T: Clone + PartialEq + 'static> Property<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Rc::new(PropertyInner {
                value: RefCell::new(value),
                listeners: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Current value
    pub fn get(&self) -> T {
        self.inner.value.borrow().clone()
    }

    /// Set the value, notifying listeners with `(new, old)` if it changed.
    pub fn set(&self, value: T) {
        let old = {
            let mut current = self.inner.value.borrow_mut();
            if *current == value {
                return;
            }
            std::mem::replace(&mut *current, value.clone())
        };
        self.notify(&value, &old);
    }

    fn notify(&self, new: &T, old: &T) {
        let snapshot: Vec<ChangeListener<T>> = self
            .inner
            .listeners
            .borrow()
            .iter()
            .map(|(_, l)| Rc::clone(l))
            .collect();
        for listener in snapshot {
            listener(new, old);
        }
    }

    /// Attach a listener and invoke it immediately with the current value.
    pub fn link(&self, listener: impl Fn(&T, &T) + 'static) -> ListenerId {
        let id = self.lazy_link(listener);
        let value = self.get();
        let listener = self
            .inner
            .listeners
            .borrow()
            .iter()
            .find(|(lid, _)| *lid == id)
            .map(|(_, l)| Rc::clone(l));
        if let Some(listener) = listener {
            listener(&value, &value);
        }
        id
    }

    /// Attach a listener that only fires on subsequent changes.
    pub fn lazy_link(&self, listener: impl Fn(&T, &T) + 'static) -> ListenerId {
        let id = next_listener_id();
        self.inner
            .listeners
            .borrow_mut()
            .push((id, Rc::new(listener)));
        id
    }

    /// Detach a listener. Returns false if it was not attached.
    pub fn unlink(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn has_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.borrow().iter().any(|(lid, _)| *lid == id)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.borrow().len()
    }

    /// Whether two handles refer to the same underlying value.
    pub fn ptr_eq(&self, other: &Property<T>) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Read-only view of this property.
    pub fn read_only(&self) -> ReadOnlyProperty<T> {
        ReadOnlyProperty {
            property: self.clone(),
        }
    }
}

impl<T: Clone + PartialEq + Default + 'static> Default for Property<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// A view of a [`Property`] that cannot be set.
pub struct ReadOnlyProperty<T> {
    property: Property<T>,
}

impl<T> Clone for ReadOnlyProperty<T> {
    fn clone(&self) -> Self {
        Self {
            property: self.property.clone(),
        }
    }
}

impl<T: Clone + PartialEq + 'static> ReadOnlyProperty<T> {
    pub fn get(&self) -> T {
        self.property.get()
    }

    pub fn link(&self, listener: impl Fn(&T, &T) + 'static) -> ListenerId {
        self.property.link(listener)
    }

    pub fn lazy_link(&self, listener: impl Fn(&T, &T) + 'static) -> ListenerId {
        self.property.lazy_link(listener)
    }

    pub fn unlink(&self, id: ListenerId) -> bool {
        self.property.unlink(id)
    }

    pub fn listener_count(&self) -> usize {
        self.property.listener_count()
    }
}

// =============================================================================
// DerivedProperty
// =============================================================================

/// A boolean-input derivation whose output is recomputed whenever any input
/// changes. Must be disposed to release its input subscriptions.
pub struct DerivedProperty<T> {
    output: Property<T>,
    inputs: Vec<(Property<bool>, ListenerId)>,
    disposed: Cell<bool>,
}

impl<T: Clone + PartialEq + 'static> DerivedProperty<T> {
    pub fn new(inputs: Vec<Property<bool>>, derive: impl Fn(&[bool]) -> T + 'static) -> Self {
        let values: Vec<bool> = inputs.iter().map(Property::get).collect();
        let output = Property::new(derive(&values));
        let derive = Rc::new(derive);

        let links = inputs
            .iter()
            .map(|input| {
                let sources = inputs.clone();
                let output = output.clone();
                let derive = Rc::clone(&derive);
                let id = input.lazy_link(move |_, _| {
                    let values: Vec<bool> = sources.iter().map(Property::get).collect();
                    output.set(derive(&values));
                });
                (input.clone(), id)
            })
            .collect();

        Self {
            output,
            inputs: links,
            disposed: Cell::new(false),
        }
    }

    pub fn get(&self) -> T {
        self.output.get()
    }

    pub fn property(&self) -> ReadOnlyProperty<T> {
        self.output.read_only()
    }

    /// Releases all input subscriptions; the output keeps its last value.
    pub fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        for (input, id) in &self.inputs {
            input.unlink(*id);
        }
    }
}

impl DerivedProperty<bool> {
    /// Logical AND of all inputs.
    pub fn and(inputs: Vec<Property<bool>>) -> Self {
        Self::new(inputs, |values| values.iter().all(|v| *v))
    }

    /// Logical OR of all inputs.
    pub fn or(inputs: Vec<Property<bool>>) -> Self {
        Self::new(inputs, |values| values.iter().any(|v| *v))
    }

    /// Negation of a single input.
    pub fn not(input: Property<bool>) -> Self {
        Self::new(vec![input], |values| !values[0])
    }

    /// A settable-looking boolean mirror, for use as an enable condition.
    ///
    /// The returned property tracks the derivation; setting it directly is
    /// overwritten on the next input change.
    pub fn as_condition(&self) -> Property<bool> {
        self.output.clone()
    }
}

impl<T> Drop for DerivedProperty<T> {
    fn drop(&mut self) {
        if !self.disposed.get() {
            for (input, id) in &self.inputs {
                let mut listeners = input.inner.listeners.borrow_mut();
                listeners.retain(|(lid, _)| lid != id);
            }
        }
    }
}

// =============================================================================
// Emitter
// =============================================================================

type EventListener<T> = Rc<dyn Fn(&T)>;

/// Event fan-out without a stored value.
pub struct Emitter<T> {
    listeners: Rc<RefCell<Vec<(ListenerId, EventListener<T>)>>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            listeners: Rc::clone(&self.listeners),
        }
    }
}

impl<T: 'static> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Emitter<T> {
    pub fn new() -> Self {
        Self {
            listeners: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn emit(&self, event: &T) {
        let snapshot: Vec<EventListener<T>> = self
            .listeners
            .borrow()
            .iter()
            .map(|(_, l)| Rc::clone(l))
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn add_listener(&self, listener: impl Fn(&T) + 'static) -> ListenerId {
        let id = next_listener_id();
        self.listeners.borrow_mut().push((id, Rc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn has_listener(&self, id: ListenerId) -> bool {
        self.listeners.borrow().iter().any(|(lid, _)| *lid == id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }
}

// =============================================================================
// ConditionSet
// =============================================================================

struct ConditionSetInner {
    conditions: RefCell<Vec<(Property<bool>, ListenerId)>>,
    all_true: Property<bool>,
}

impl ConditionSetInner {
    fn recompute(&self) {
        let all = self.conditions.borrow().iter().all(|(c, _)| c.get());
        self.all_true.set(all);
    }
}

/// An observable, order-irrelevant set of boolean conditions whose output is
/// true exactly when every member is true (an empty set is true).
#[derive(Clone)]
pub struct ConditionSet {
    inner: Rc<ConditionSetInner>,
}

impl Default for ConditionSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ConditionSet {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(ConditionSetInner {
                conditions: RefCell::new(Vec::new()),
                all_true: Property::new(true),
            }),
        }
    }

    /// Add a condition. The output is updated before this returns.
    pub fn add(&self, condition: Property<bool>) {
        debug_assert!(!self.contains(&condition), "condition already present");
        let weak = Rc::downgrade(&self.inner);
        let id = condition.lazy_link(move |_, _| {
            if let Some(inner) = weak.upgrade() {
                inner.recompute();
            }
        });
        self.inner.conditions.borrow_mut().push((condition, id));
        self.inner.recompute();
    }

    /// Remove a condition. Returns false if it was not a member.
    pub fn remove(&self, condition: &Property<bool>) -> bool {
        let removed = {
            let mut conditions = self.inner.conditions.borrow_mut();
            match conditions.iter().position(|(c, _)| c.ptr_eq(condition)) {
                Some(index) => Some(conditions.remove(index)),
                None => None,
            }
        };
        match removed {
            Some((condition, id)) => {
                condition.unlink(id);
                self.inner.recompute();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, condition: &Property<bool>) -> bool {
        self.inner
            .conditions
            .borrow()
            .iter()
            .any(|(c, _)| c.ptr_eq(condition))
    }

    pub fn len(&self) -> usize {
        self.inner.conditions.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all_true(&self) -> bool {
        self.inner.all_true.get()
    }

    pub fn output(&self) -> ReadOnlyProperty<bool> {
        self.inner.all_true.read_only()
    }

    /// Unlink from every condition. The output freezes at its last value.
    pub fn dispose(&self) {
        let conditions = std::mem::take(&mut *self.inner.conditions.borrow_mut());
        for (condition, id) in conditions {
            condition.unlink(id);
        }
    }
}
