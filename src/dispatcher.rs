use embedded_time::{Clock, Instant, duration::Milliseconds};

use crate::{
    heap::{Handle, Heap},
    layer::Wakeup,
    time,
};

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Continuation {
    pub layer: usize,
    pub wakeup: Wakeup,
}

pub trait Scheduler {
    fn now(&self) -> Result<Milliseconds<u64>, crate::Error>;

    fn schedule(
        &mut self,
        delay: Milliseconds<u32>,
        continuation: Continuation,
    ) -> Result<Handle, crate::Error>;

    /// Withdraws a continuation. Returns `false` if it already fired or was
    /// cancelled before.
    fn cancel(&mut self, handle: Handle) -> bool;
}

pub struct Dispatcher<C: Clock<T = u64>, const N: usize> {
    clock: C,
    timers: Heap<Instant<C>, Continuation, N>,
}

impl<C: Clock<T = u64>, const N: usize> Dispatcher<C, N> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            timers: Heap::new(),
        }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn pending(&self) -> usize {
        self.timers.len()
    }

    pub fn is_scheduled(&self, handle: Handle) -> bool {
        self.timers.contains(handle)
    }

    pub fn next_due(&mut self) -> Result<Option<Continuation>, crate::Error> {
        let now = self.instant()?;

        match self.timers.min_key() {
            Some(at) if *at <= now => Ok(self.timers.extract_min().map(|(_, c)| c)),
            _ => Ok(None),
        }
    }

    pub fn next_deadline(&self) -> Option<Milliseconds<u64>> {
        self.timers.min_key().map(time::to_millis)
    }

    pub fn clear(&mut self) {
        self.timers.clear();
    }

    fn instant(&self) -> Result<Instant<C>, crate::Error> {
        self.clock.try_now().map_err(|_| crate::Error::TimeError)
    }
}

impl<C: Clock<T = u64>, const N: usize> Scheduler for Dispatcher<C, N> {
    fn now(&self) -> Result<Milliseconds<u64>, crate::Error> {
        self.instant().map(|now| time::to_millis(&now))
    }

    fn schedule(
        &mut self,
        delay: Milliseconds<u32>,
        continuation: Continuation,
    ) -> Result<Handle, crate::Error> {
        let at = self
            .instant()?
            .checked_add(delay)
            .ok_or(crate::Error::TimeError)?;

        let handle = self.timers.insert(at, continuation)?;
        trace!("scheduled {:?} in {} ms", continuation.wakeup, delay.0);

        Ok(handle)
    }

    fn cancel(&mut self, handle: Handle) -> bool {
        self.timers.remove(handle).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    fn continuation(layer: usize, wakeup: Wakeup) -> Continuation {
        Continuation { layer, wakeup }
    }

    #[test]
    fn fires_in_wake_order() {
        let mut dispatcher = Dispatcher::<_, 8>::new(ManualClock::new());

        dispatcher
            .schedule(Milliseconds(300), continuation(2, Wakeup::KeepAlive))
            .unwrap();
        dispatcher
            .schedule(Milliseconds(100), continuation(1, Wakeup::Resume))
            .unwrap();
        dispatcher
            .schedule(Milliseconds(0), continuation(2, Wakeup::Deliver))
            .unwrap();

        assert_eq!(
            dispatcher.next_due().unwrap(),
            Some(continuation(2, Wakeup::Deliver))
        );
        assert_eq!(dispatcher.next_due().unwrap(), None);
        assert_eq!(dispatcher.next_deadline(), Some(Milliseconds(100u64)));

        dispatcher.clock().advance(Milliseconds(100));
        assert_eq!(
            dispatcher.next_due().unwrap(),
            Some(continuation(1, Wakeup::Resume))
        );
        assert_eq!(dispatcher.next_due().unwrap(), None);

        dispatcher.clock().advance(Milliseconds(500));
        assert_eq!(
            dispatcher.next_due().unwrap(),
            Some(continuation(2, Wakeup::KeepAlive))
        );
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn cancelled_never_fires() {
        let mut dispatcher = Dispatcher::<_, 4>::new(ManualClock::new());

        let handle = dispatcher
            .schedule(Milliseconds(10), continuation(0, Wakeup::ConnackTimeout))
            .unwrap();
        assert!(dispatcher.is_scheduled(handle));
        assert!(dispatcher.cancel(handle));
        assert!(!dispatcher.cancel(handle));

        dispatcher.clock().advance(Milliseconds(1_000));
        assert_eq!(dispatcher.next_due().unwrap(), None);
    }

    #[test]
    fn cancel_after_fire_is_noop() {
        let mut dispatcher = Dispatcher::<_, 4>::new(ManualClock::new());

        let handle = dispatcher
            .schedule(Milliseconds(0), continuation(0, Wakeup::Deliver))
            .unwrap();
        assert!(dispatcher.next_due().unwrap().is_some());
        assert!(!dispatcher.cancel(handle));
    }

    #[test]
    fn full_dispatcher_refuses() {
        let mut dispatcher = Dispatcher::<_, 1>::new(ManualClock::new());

        dispatcher
            .schedule(Milliseconds(5), continuation(0, Wakeup::Deliver))
            .unwrap();
        let err = dispatcher
            .schedule(Milliseconds(5), continuation(0, Wakeup::Deliver))
            .unwrap_err();

        assert_eq!(err, crate::Error::CapacityExceeded);
    }
}
