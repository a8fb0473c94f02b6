//! Deferred playback requests
//!
//! A start request made while the session is not running is remembered with
//! its wall-clock timestamp and handed back, with the elapsed time, once the
//! session transitions to running. The owner decides whether it is stale.

use crate::context::{AudioContext, ContextState};
use crate::session_monitor::{self, StateListenerId};
use std::cell::RefCell;
use std::rc::Rc;

struct Pending {
    requested_at: f64,
    listener: StateListenerId,
    action: Rc<dyn Fn(f64)>,
}

pub(crate) struct DeferredStart {
    context: AudioContext,
    pending: Rc<RefCell<Option<Pending>>>,
}

impl DeferredStart {
    pub(crate) fn new(context: AudioContext) -> Self {
        Self {
            context,
            pending: Rc::new(RefCell::new(None)),
        }
    }

    /// Record a request. A newer request replaces the timestamp and action
    /// of an older one that has not fired yet.
    pub(crate) fn request(&self, action: impl Fn(f64) + 'static) {
        let now = self.context.wall_time();
        let mut pending = self.pending.borrow_mut();
        if let Some(existing) = pending.as_mut() {
            existing.requested_at = now;
            existing.action = Rc::new(action);
            return;
        }

        let cell = Rc::clone(&self.pending);
        let context = self.context.clone();
        let listener = session_monitor::add_state_change_listener(&self.context, move |state| {
            if state != ContextState::Running {
                return;
            }
            let fired = cell.borrow_mut().take();
            if let Some(fired) = fired {
                session_monitor::remove_state_change_listener(&context, fired.listener);
                (fired.action)(context.wall_time() - fired.requested_at);
            }
        });

        *pending = Some(Pending {
            requested_at: now,
            listener,
            action: Rc::new(action),
        });
    }

    pub(crate) fn cancel(&self) {
        let pending = self.pending.borrow_mut().take();
        if let Some(pending) = pending {
            session_monitor::remove_state_change_listener(&self.context, pending.listener);
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending.borrow().is_some()
    }
}

impl Drop for DeferredStart {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::cell::Cell;

    #[test]
    fn test_fires_once_on_resume_with_elapsed_time() {
        let ctx = AudioContext::new(44100.0);
        let deferred = DeferredStart::new(ctx.clone());
        let elapsed = Rc::new(Cell::new(None));
        let e = Rc::clone(&elapsed);
        deferred.request(move |dt| e.set(Some(dt)));

        ctx.advance(0.15);
        assert!(deferred.is_pending());
        ctx.resume().unwrap();
        assert_relative_eq!(elapsed.get().unwrap(), 0.15);
        assert!(!deferred.is_pending());
        assert_eq!(session_monitor::listener_count(&ctx), 0);
    }

    #[test]
    fn test_cancel_removes_listener() {
        let ctx = AudioContext::new(44100.0);
        let deferred = DeferredStart::new(ctx.clone());
        let fired = Rc::new(Cell::new(false));
        let f = Rc::clone(&fired);
        deferred.request(move |_| f.set(true));
        deferred.cancel();
        ctx.resume().unwrap();
        assert!(!fired.get());
        assert_eq!(session_monitor::listener_count(&ctx), 0);
    }

    #[test]
    fn test_newer_request_replaces_older() {
        let ctx = AudioContext::new(44100.0);
        let deferred = DeferredStart::new(ctx.clone());
        let calls = Rc::new(Cell::new(0));
        let c = Rc::clone(&calls);
        deferred.request(move |_| c.set(c.get() + 1));
        ctx.advance(1.0);
        let c = Rc::clone(&calls);
        let elapsed = Rc::new(Cell::new(f64::NAN));
        let e = Rc::clone(&elapsed);
        deferred.request(move |dt| {
            c.set(c.get() + 10);
            e.set(dt);
        });
        ctx.resume().unwrap();
        assert_eq!(calls.get(), 10);
        assert_relative_eq!(elapsed.get(), 0.0);
    }
}
