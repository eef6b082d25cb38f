//! Cycle-accurate event scheduler.
//!
//! Every time-dependent component registers a permanent event during
//! bring-up and (re)schedules it against the master clock. Events carry a
//! numerator/denominator pair so components living on subordinate clocks
//! (SCSP, CD block, SMPC) can schedule in their own cycle units without
//! accumulating drift: master cycles = native * den / num, computed with
//! 128-bit intermediates and truncating division.
//!
//! Dispatch order is strict: earliest target first, ties broken by
//! registration order.

use std::cell::{Cell, RefCell};

use log::trace;

use crate::error::{CoreError, CoreResult};

/// Master-clock cycle count.
pub type Cycles = u64;

/// Stable identifier of a registered event.
pub type EventId = usize;

/// Maximum number of registered events. Exceeding this is a bring-up
/// failure, not a runtime condition.
pub const MAX_EVENTS: usize = 8;

const NEVER: Cycles = Cycles::MAX;

/// The callable that runs when an event fires.
pub type EventCallback = Box<dyn FnMut(&mut EventContext)>;

#[derive(Debug, Clone, Copy)]
struct Event {
    /// Absolute master-cycle target; `NEVER` when idle.
    target: Cycles,
    /// Ratio of this event's native clock to the master clock.
    num: u64,
    den: u64,
    active: bool,
}

impl Event {
    fn new() -> Self {
        Self {
            target: NEVER,
            num: 1,
            den: 1,
            active: false,
        }
    }
}

struct Inner {
    now: Cycles,
    events: Vec<Event>,
}

/// The scheduler. Shared behind `Rc` by every component; all methods take
/// `&self` and guard their state internally so event callbacks can freely
/// schedule other events mid-dispatch.
pub struct Scheduler {
    inner: RefCell<Inner>,
    callbacks: RefCell<Vec<Option<EventCallback>>>,
    advancing: Cell<bool>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: RefCell::new(Inner {
                now: 0,
                events: Vec::new(),
            }),
            callbacks: RefCell::new(Vec::new()),
            advancing: Cell::new(false),
        }
    }

    /// Permanently register an event. Only valid during component
    /// construction; capacity is static.
    pub fn register_event(&self, callback: EventCallback) -> CoreResult<EventId> {
        let mut inner = self.inner.borrow_mut();
        if inner.events.len() >= MAX_EVENTS {
            return Err(CoreError::TooManyEvents(inner.events.len()));
        }
        let id = inner.events.len();
        inner.events.push(Event::new());
        self.callbacks.borrow_mut().push(Some(callback));
        Ok(id)
    }

    /// Replace the callback of a registered event. Used by components that
    /// switch tick cadence at runtime.
    pub fn set_event_callback(&self, id: EventId, callback: EventCallback) {
        self.callbacks.borrow_mut()[id] = Some(callback);
    }

    /// Adjust the native-clock ratio of an event. The outstanding target
    /// is recomputed so the time-until-fire measured in the event's own
    /// clock is preserved.
    pub fn set_event_count_factor(&self, id: EventId, num: u64, den: u64) {
        assert!(num != 0 && den != 0, "scheduler ratio must be non-zero");
        let mut inner = self.inner.borrow_mut();
        let now = inner.now;
        let ev = &mut inner.events[id];
        if ev.active && ev.target != NEVER && ev.target > now {
            let remaining_master = ev.target - now;
            let remaining_native = mul_div(remaining_master, ev.num, ev.den);
            ev.target = now + mul_div(remaining_native, den, num);
        }
        ev.num = num;
        ev.den = den;
    }

    /// Schedule the event `native_cycles` (of its own clock) from now.
    pub fn schedule_from_now(&self, id: EventId, native_cycles: u64) {
        let mut inner = self.inner.borrow_mut();
        let now = inner.now;
        let ev = &mut inner.events[id];
        ev.target = now + mul_div(native_cycles, ev.den, ev.num);
        ev.active = true;
    }

    /// Schedule the event at an absolute master-cycle count.
    pub fn schedule_at(&self, id: EventId, target: Cycles) {
        let mut inner = self.inner.borrow_mut();
        let ev = &mut inner.events[id];
        ev.target = target;
        ev.active = true;
    }

    /// Cancel a scheduled event. Idempotent; rescheduling reactivates it.
    pub fn cancel(&self, id: EventId) {
        let mut inner = self.inner.borrow_mut();
        let ev = &mut inner.events[id];
        ev.target = NEVER;
        ev.active = false;
    }

    /// The pending target of an event, or `None` if idle.
    pub fn target_of(&self, id: EventId) -> Option<Cycles> {
        let inner = self.inner.borrow();
        let ev = &inner.events[id];
        ev.active.then_some(ev.target)
    }

    pub fn now(&self) -> Cycles {
        self.inner.borrow().now
    }

    /// Absolute target of the soonest pending event, or `Cycles::MAX`.
    pub fn next_target(&self) -> Cycles {
        let inner = self.inner.borrow();
        inner
            .events
            .iter()
            .filter(|ev| ev.active)
            .map(|ev| ev.target)
            .min()
            .unwrap_or(NEVER)
    }

    /// Advance the master clock by `cycles`, dispatching every event whose
    /// target has come, in target order (ties: registration order).
    pub fn advance(&self, cycles: Cycles) {
        let target = self.inner.borrow().now + cycles;
        self.advance_to(target);
    }

    /// Advance the master clock to an absolute cycle count.
    pub fn advance_to(&self, target: Cycles) {
        if self.advancing.replace(true) {
            panic!("scheduler advance reentered from an event callback");
        }

        {
            let mut inner = self.inner.borrow_mut();
            debug_assert!(target >= inner.now, "master clock must be monotonic");
            inner.now = target;
        }

        loop {
            // Pick the due event with the smallest (target, id).
            let next = {
                let inner = self.inner.borrow();
                inner
                    .events
                    .iter()
                    .enumerate()
                    .filter(|(_, ev)| ev.active && ev.target <= inner.now)
                    .min_by_key(|(id, ev)| (ev.target, *id))
                    .map(|(id, _)| id)
            };
            let Some(id) = next else { break };

            let fired_target = {
                let mut inner = self.inner.borrow_mut();
                let ev = &mut inner.events[id];
                let t = ev.target;
                ev.active = false;
                ev.target = NEVER;
                t
            };

            trace!("scheduler: dispatching event {id} at target {fired_target}");

            let mut callback = self.callbacks.borrow_mut()[id]
                .take()
                .expect("event callback is in use");
            let mut ctx = EventContext {
                sched: self,
                id,
                fired_target,
            };
            callback(&mut ctx);
            self.callbacks.borrow_mut()[id] = Some(callback);
        }

        self.advancing.set(false);
    }

    /// Reset the clock and deactivate every event. Registrations persist.
    pub fn reset(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.now = 0;
        for ev in &mut inner.events {
            ev.target = NEVER;
            ev.active = false;
        }
    }

    // ── Save states ────────────────────────────────────────────

    pub fn save_state(&self) -> crate::state::SchedulerState {
        let inner = self.inner.borrow();
        crate::state::SchedulerState {
            now: inner.now,
            events: inner
                .events
                .iter()
                .map(|ev| crate::state::SchedulerEventState {
                    target: ev.target,
                    num: ev.num,
                    den: ev.den,
                    active: ev.active,
                })
                .collect(),
        }
    }

    pub fn validate_state(&self, state: &crate::state::SchedulerState) -> bool {
        state.events.len() == self.inner.borrow().events.len()
            && state.events.iter().all(|ev| ev.num != 0 && ev.den != 0)
    }

    pub fn load_state(&self, state: &crate::state::SchedulerState) {
        let mut inner = self.inner.borrow_mut();
        inner.now = state.now;
        for (ev, st) in inner.events.iter_mut().zip(&state.events) {
            ev.target = st.target;
            ev.num = st.num;
            ev.den = st.den;
            ev.active = st.active;
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// View handed to a firing callback. Rescheduling is relative to the
/// target that just fired, preserving jitter-free periodicity.
pub struct EventContext<'a> {
    sched: &'a Scheduler,
    id: EventId,
    fired_target: Cycles,
}

impl EventContext<'_> {
    pub fn now(&self) -> Cycles {
        self.sched.now()
    }

    /// Master-cycle target this firing was scheduled for.
    pub fn fired_target(&self) -> Cycles {
        self.fired_target
    }

    /// Schedule the next firing `native_cycles` after the *prior target*,
    /// not after `now`.
    pub fn reschedule(&mut self, native_cycles: u64) {
        let mut inner = self.sched.inner.borrow_mut();
        let ev = &mut inner.events[self.id];
        ev.target = self.fired_target + mul_div(native_cycles, ev.den, ev.num);
        ev.active = true;
    }

    /// Schedule the next firing relative to `now` instead.
    pub fn schedule_from_now(&mut self, native_cycles: u64) {
        self.sched.schedule_from_now(self.id, native_cycles);
    }

    pub fn cancel(&mut self) {
        self.sched.cancel(self.id);
    }
}

/// `value * num / den` with a 128-bit intermediate; truncating division.
fn mul_div(value: u64, num: u64, den: u64) -> u64 {
    assert!(den != 0, "scheduler ratio denominator must be non-zero");
    ((value as u128 * num as u128) / den as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn counter_event(sched: &Scheduler, hits: Rc<RefCell<Vec<usize>>>, tag: usize) -> EventId {
        sched
            .register_event(Box::new(move |_ctx| hits.borrow_mut().push(tag)))
            .unwrap()
    }

    #[test]
    fn fires_exactly_at_target() {
        let sched = Scheduler::new();
        let hits = Rc::new(RefCell::new(Vec::new()));
        let id = counter_event(&sched, hits.clone(), 0);

        // Ratio 2464:3125 (SCSP on NTSC/352): 128 native cycles map to
        // 128 * 3125 / 2464 = 162 master cycles (truncated).
        sched.set_event_count_factor(id, 2464, 3125);
        sched.schedule_from_now(id, 128);
        assert_eq!(sched.target_of(id), Some(162));

        sched.advance(161);
        assert!(hits.borrow().is_empty());
        sched.advance(1);
        assert_eq!(hits.borrow().len(), 1);
    }

    #[test]
    fn ties_dispatch_in_registration_order() {
        let sched = Scheduler::new();
        let hits = Rc::new(RefCell::new(Vec::new()));
        let a = counter_event(&sched, hits.clone(), 0);
        let b = counter_event(&sched, hits.clone(), 1);

        // Schedule in reverse order at the same target.
        sched.schedule_at(b, 100);
        sched.schedule_at(a, 100);
        sched.advance(100);
        assert_eq!(*hits.borrow(), vec![0, 1]);
    }

    #[test]
    fn reschedule_is_relative_to_prior_target() {
        let sched = Scheduler::new();
        let fired = Rc::new(RefCell::new(Vec::new()));
        let fired2 = fired.clone();
        let id = sched
            .register_event(Box::new(move |ctx| {
                fired2.borrow_mut().push(ctx.fired_target());
                ctx.reschedule(100);
            }))
            .unwrap();

        sched.schedule_from_now(id, 100);
        // Overshoot the first target; the second must stay on the grid.
        sched.advance(130);
        sched.advance(100);
        assert_eq!(*fired.borrow(), vec![100, 200]);
    }

    #[test]
    fn cancel_is_idempotent_and_reversible() {
        let sched = Scheduler::new();
        let hits = Rc::new(RefCell::new(Vec::new()));
        let id = counter_event(&sched, hits.clone(), 0);

        sched.schedule_from_now(id, 50);
        sched.cancel(id);
        sched.cancel(id);
        sched.advance(60);
        assert!(hits.borrow().is_empty());

        sched.schedule_from_now(id, 10);
        sched.advance(10);
        assert_eq!(hits.borrow().len(), 1);
    }

    #[test]
    fn factor_change_preserves_native_remaining_time() {
        let sched = Scheduler::new();
        let hits = Rc::new(RefCell::new(Vec::new()));
        let id = counter_event(&sched, hits.clone(), 0);

        sched.set_event_count_factor(id, 1, 2);
        sched.schedule_from_now(id, 100); // fires at master 200
        assert_eq!(sched.target_of(id), Some(200));

        // Doubling the clock halves the remaining master time.
        sched.set_event_count_factor(id, 1, 1);
        assert_eq!(sched.target_of(id), Some(100));
    }

    #[test]
    fn registration_capacity_is_enforced() {
        let sched = Scheduler::new();
        for _ in 0..MAX_EVENTS {
            sched.register_event(Box::new(|_| {})).unwrap();
        }
        assert!(sched.register_event(Box::new(|_| {})).is_err());
    }
}
