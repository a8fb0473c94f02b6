//! Audio session state-change fan-out
//!
//! A platform session accepts exactly one native state-change hook. This
//! registry owns that hook for every session it has seen and fans each
//! transition out to any number of listeners.

use crate::context::{AudioContext, ContextId, ContextState};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::trace;

/// Handle for a registered state-change listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateListenerId(u64);

type StateListener = Rc<dyn Fn(ContextState)>;

thread_local! {
    static REGISTRY: RefCell<HashMap<ContextId, Vec<(StateListenerId, StateListener)>>> =
        RefCell::new(HashMap::new());
    static NEXT_ID: Cell<u64> = const { Cell::new(1) };
}

fn fan_out(context: ContextId, state: ContextState) {
    let snapshot: Vec<StateListener> = REGISTRY.with(|registry| {
        registry
            .borrow()
            .get(&context)
            .map(|listeners| listeners.iter().map(|(_, l)| Rc::clone(l)).collect())
            .unwrap_or_default()
    });
    trace!(listeners = snapshot.len(), ?state, "fanning out session state change");
    for listener in snapshot {
        listener(state);
    }
}

/// Register a listener for state transitions of `context`.
///
/// The first registration for a session installs the native hook.
pub fn add_state_change_listener(
    context: &AudioContext,
    listener: impl Fn(ContextState) + 'static,
) -> StateListenerId {
    let id = NEXT_ID.with(|next| {
        let id = next.get();
        next.set(id + 1);
        StateListenerId(id)
    });
    let key = context.id();

    let first = REGISTRY.with(|registry| {
        let mut registry = registry.borrow_mut();
        let first = !registry.contains_key(&key);
        registry
            .entry(key)
            .or_default()
            .push((id, Rc::new(listener)));
        first
    });

    if first {
        context.set_state_change_hook(Some(Rc::new(move |state| fan_out(key, state))));
    }
    id
}

/// Remove a listener. Removing one that was never registered is a
/// programmer error.
///
/// Removing the last listener of a session releases its registry entry and
/// native hook, so listeners holding the session no longer keep it alive.
pub fn remove_state_change_listener(context: &AudioContext, id: StateListenerId) {
    let key = context.id();
    let (removed, emptied) = REGISTRY.with(|registry| {
        let mut registry = registry.borrow_mut();
        let Some(listeners) = registry.get_mut(&key) else {
            return (false, false);
        };
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        let removed = listeners.len() != before;
        let emptied = listeners.is_empty();
        if emptied {
            registry.remove(&key);
        }
        (removed, emptied)
    });
    debug_assert!(removed, "state change listener is not registered");
    if emptied {
        context.set_state_change_hook(None);
    }
}

pub fn has_listener(context: &AudioContext, id: StateListenerId) -> bool {
    REGISTRY.with(|registry| {
        registry
            .borrow()
            .get(&context.id())
            .is_some_and(|listeners| listeners.iter().any(|(lid, _)| *lid == id))
    })
}

pub fn listener_count(context: &AudioContext) -> usize {
    REGISTRY.with(|registry| registry.borrow().get(&context.id()).map_or(0, Vec::len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_native_hook_many_listeners() {
        let ctx = AudioContext::new(44100.0);
        let count = Rc::new(Cell::new(0));
        let c1 = Rc::clone(&count);
        let c2 = Rc::clone(&count);
        let a = add_state_change_listener(&ctx, move |_| c1.set(c1.get() + 1));
        let b = add_state_change_listener(&ctx, move |_| c2.set(c2.get() + 1));
        assert!(ctx.has_state_change_hook());
        assert!(has_listener(&ctx, a));
        assert!(has_listener(&ctx, b));

        ctx.resume().unwrap();
        assert_eq!(count.get(), 2);

        remove_state_change_listener(&ctx, a);
        ctx.suspend();
        assert_eq!(count.get(), 3);
        assert_eq!(listener_count(&ctx), 1);
    }

    #[test]
    fn test_listener_removes_itself_during_fan_out() {
        let ctx = AudioContext::new(44100.0);
        let slot: Rc<Cell<Option<StateListenerId>>> = Rc::new(Cell::new(None));
        let calls = Rc::new(Cell::new(0));

        let s = Rc::clone(&slot);
        let handle = ctx.clone();
        let c = Rc::clone(&calls);
        let id = add_state_change_listener(&ctx, move |_| {
            c.set(c.get() + 1);
            if let Some(id) = s.take() {
                remove_state_change_listener(&handle, id);
            }
        });
        slot.set(Some(id));

        let c = Rc::clone(&calls);
        add_state_change_listener(&ctx, move |_| c.set(c.get() + 10));

        ctx.resume().unwrap();
        assert_eq!(calls.get(), 11);
        ctx.suspend();
        assert_eq!(calls.get(), 21);
    }

    #[test]
    fn test_sessions_are_independent() {
        let a = AudioContext::new(44100.0);
        let b = AudioContext::new(44100.0);
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        add_state_change_listener(&a, move |_| h.set(h.get() + 1));
        b.resume().unwrap();
        assert_eq!(hits.get(), 0);
        assert!(!b.has_state_change_hook());
    }

    #[test]
    fn test_last_removal_releases_session() {
        let ctx = AudioContext::new(44100.0);
        let handle = ctx.clone();
        let id = add_state_change_listener(&ctx, move |_| {
            let _ = handle.current_time();
        });
        remove_state_change_listener(&ctx, id);

        let tracked = REGISTRY.with(|registry| registry.borrow().contains_key(&ctx.id()));
        assert!(!tracked);
        assert!(!ctx.has_state_change_hook());

        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        add_state_change_listener(&ctx, move |_| h.set(h.get() + 1));
        assert!(ctx.has_state_change_hook());
        ctx.resume().unwrap();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    #[should_panic(expected = "not registered")]
    fn test_removing_unknown_listener_asserts() {
        let ctx = AudioContext::new(44100.0);
        let id = add_state_change_listener(&ctx, |_| {});
        remove_state_change_listener(&ctx, id);
        remove_state_change_listener(&ctx, id);
    }
}
