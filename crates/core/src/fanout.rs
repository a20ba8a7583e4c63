use std::any::Any;
use std::error::Error;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{error, warn};

use crate::events::AlarmEvent;

pub type ObserverError = Box<dyn Error + Send + Sync>;

/// Receives every event emitted while registered.
pub trait Observer: Send + Sync {
    fn notify(&self, event: &AlarmEvent) -> Result<(), ObserverError>;
}

impl<F> Observer for F
where
    F: Fn(&AlarmEvent) + Send + Sync,
{
    fn notify(&self, event: &AlarmEvent) -> Result<(), ObserverError> {
        self(event);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

/// Outcome of one [`FanOut::emit`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone)]
struct Slot {
    id: ObserverId,
    observer: Arc<dyn Observer>,
}

/// Observer registry with per-observer failure isolation.
#[derive(Default)]
pub struct FanOut {
    slots: RwLock<Vec<Slot>>,
    next_id: AtomicU64,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an observer. Registering the same `Arc` twice hands back the
    /// original id and keeps its slot.
    pub fn register(&self, observer: Arc<dyn Observer>) -> ObserverId {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = slots.iter().find(|s| same_observer(&s.observer, &observer)) {
            return existing.id;
        }
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        slots.push(Slot { id, observer });
        id
    }

    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let before = slots.len();
        slots.retain(|s| s.id != id);
        slots.len() != before
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `event` to the observers registered right now, in
    /// registration order. The set is captured before the first call, so
    /// observers may register or unregister from inside `notify`.
    pub fn emit(&self, event: &AlarmEvent) -> Delivery {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner).clone();
        let mut delivery = Delivery::default();
        for slot in slots {
            match panic::catch_unwind(AssertUnwindSafe(|| slot.observer.notify(event))) {
                Ok(Ok(())) => delivery.delivered += 1,
                Ok(Err(err)) => {
                    warn!(observer = slot.id.0, error = %err, "observer failed to handle event");
                    delivery.failed += 1;
                }
                Err(panic) => {
                    error!(observer = slot.id.0, panic = panic_message(&*panic), "observer panicked");
                    delivery.failed += 1;
                }
            }
        }
        delivery
    }
}

fn same_observer(a: &Arc<dyn Observer>, b: &Arc<dyn Observer>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DeviceId;
    use std::sync::Mutex;

    fn status_event() -> AlarmEvent {
        AlarmEvent::StatusReceived { device: DeviceId::new(1).unwrap(), active: true }
    }

    fn recorder() -> (Arc<Mutex<Vec<AlarmEvent>>>, Arc<dyn Observer>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let observer: Arc<dyn Observer> = Arc::new(move |e: &AlarmEvent| sink.lock().unwrap().push(e.clone()));
        (seen, observer)
    }

    struct Failing;

    impl Observer for Failing {
        fn notify(&self, _event: &AlarmEvent) -> Result<(), ObserverError> {
            Err("display went away".into())
        }
    }

    #[test]
    fn every_observer_gets_the_same_event_once() {
        let fanout = FanOut::new();
        let recorders: Vec<_> = (0..5).map(|_| recorder()).collect();
        for (_, observer) in &recorders {
            fanout.register(observer.clone());
        }

        let delivery = fanout.emit(&status_event());
        assert_eq!(delivery, Delivery { delivered: 5, failed: 0 });
        for (seen, _) in &recorders {
            assert_eq!(*seen.lock().unwrap(), vec![status_event()]);
        }
    }

    #[test]
    fn observers_run_in_registration_order() {
        let fanout = FanOut::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = order.clone();
            fanout.register(Arc::new(move |_: &AlarmEvent| order.lock().unwrap().push(n)));
        }
        fanout.emit(&AlarmEvent::ConnectionChanged(true));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn failing_and_panicking_observers_do_not_stop_delivery() {
        let fanout = FanOut::new();
        let (before, first) = recorder();
        let (after, last) = recorder();
        fanout.register(first);
        fanout.register(Arc::new(|_: &AlarmEvent| {
            panic!("render crashed");
        }));
        fanout.register(Arc::new(Failing));
        fanout.register(last);

        let delivery = fanout.emit(&status_event());
        assert_eq!(delivery, Delivery { delivered: 2, failed: 2 });
        assert_eq!(before.lock().unwrap().len(), 1);
        assert_eq!(after.lock().unwrap().len(), 1);
    }

    #[test]
    fn registering_the_same_observer_twice_is_a_no_op() {
        let fanout = FanOut::new();
        let (seen, observer) = recorder();
        let first = fanout.register(observer.clone());
        let second = fanout.register(observer);
        assert_eq!(first, second);
        assert_eq!(fanout.len(), 1);

        fanout.emit(&status_event());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn unregister_removes_and_tolerates_unknown_ids() {
        let fanout = FanOut::new();
        let (seen, observer) = recorder();
        let id = fanout.register(observer);
        assert!(fanout.unregister(id));
        assert!(!fanout.unregister(id));
        assert!(fanout.is_empty());

        assert_eq!(fanout.emit(&status_event()), Delivery::default());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn observer_may_unregister_another_mid_emit() {
        let fanout = Arc::new(FanOut::new());
        let (victim_seen, victim) = recorder();
        let victim_id = Arc::new(Mutex::new(None));

        let remover = {
            let fanout = fanout.clone();
            let victim_id = victim_id.clone();
            move |_: &AlarmEvent| {
                if let Some(id) = victim_id.lock().unwrap().take() {
                    fanout.unregister(id);
                }
            }
        };
        fanout.register(Arc::new(remover));
        *victim_id.lock().unwrap() = Some(fanout.register(victim));

        // captured set still includes the victim for this emission
        assert_eq!(fanout.emit(&status_event()).delivered, 2);
        assert_eq!(victim_seen.lock().unwrap().len(), 1);

        assert_eq!(fanout.emit(&status_event()).delivered, 1);
        assert_eq!(victim_seen.lock().unwrap().len(), 1);
    }
}
