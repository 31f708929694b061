use crate::{Outcome, State, Strategy};
use std::any::Any;
use std::cell::RefCell;
use std::mem;
use std::sync::Arc;

pub(crate) type DoneFn<D> = Box<dyn FnOnce(&Arc<D>) + Send>;
pub(crate) type FailFn<F> = Box<dyn FnOnce(&Arc<F>) + Send>;
pub(crate) type ProgressFn<P> = Arc<dyn Fn(&Arc<P>) + Send + Sync>;
pub(crate) type AlwaysFn<D, F> = Box<dyn FnOnce(&Outcome<D, F>) + Send>;

pub(crate) struct Registered<C> {
    pub(crate) strategy: Strategy,
    pub(crate) callback: C,
}

/// The four callback channels of one promise, in registration order.
///
/// Only ever touched under the promise lock. Settlement takes the registry
/// out of the promise whole, so an entry is handed out at most once.
pub(crate) struct Registry<D, F, P> {
    pub(crate) done: Vec<Registered<DoneFn<D>>>,
    pub(crate) fail: Vec<Registered<FailFn<F>>>,
    pub(crate) progress: Vec<Registered<ProgressFn<P>>>,
    pub(crate) always: Vec<Registered<AlwaysFn<D, F>>>,
}

/// What a settlement has to deliver. Exactly one of `done` and `fail` is
/// non-empty at most.
pub(crate) struct Drained<D, F> {
    pub(crate) done: Vec<Registered<DoneFn<D>>>,
    pub(crate) fail: Vec<Registered<FailFn<F>>>,
    pub(crate) always: Vec<Registered<AlwaysFn<D, F>>>,
}

impl<D, F, P> Default for Registry<D, F, P> {
    fn default() -> Self {
        Self {
            done: Vec::new(),
            fail: Vec::new(),
            progress: Vec::new(),
            always: Vec::new(),
        }
    }
}

impl<D, F, P> Registry<D, F, P> {
    /// Takes out the callbacks that `state` fires. What stays behind can
    /// never fire any more and is left for [`release`].
    pub(crate) fn drain(&mut self, state: State) -> Drained<D, F> {
        match state {
            State::Resolved => Drained {
                done: mem::take(&mut self.done),
                fail: Vec::new(),
                always: mem::take(&mut self.always),
            },
            State::Rejected => Drained {
                done: Vec::new(),
                fail: mem::take(&mut self.fail),
                always: mem::take(&mut self.always),
            },
            State::Pending => Drained {
                done: Vec::new(),
                fail: Vec::new(),
                always: Vec::new(),
            },
        }
    }

    /// Copies out the progress callbacks; they stay registered.
    pub(crate) fn progress(&self) -> Vec<(Strategy, ProgressFn<P>)> {
        self.progress
            .iter()
            .map(|entry| (entry.strategy.clone(), Arc::clone(&entry.callback)))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.done.len() + self.fail.len() + self.progress.len() + self.always.len()
    }
}

thread_local! {
    static RELEASING: RefCell<Option<Vec<Box<dyn Any>>>> = const { RefCell::new(None) };
}

/// Drops `registry` without recursing into it.
///
/// Callbacks own the deferreds of derived promises, so dropping one registry
/// can drop the next one down a chain. Registries released while another
/// release runs on this thread are queued and dropped by the outermost call
/// in a loop. Must not be called with a promise lock held.
pub(crate) fn release<D: 'static, F: 'static, P: 'static>(registry: Registry<D, F, P>) {
    if registry.len() == 0 {
        return;
    }
    let registry: Box<dyn Any> = Box::new(registry);
    let first = RELEASING.try_with(|releasing| {
        let mut releasing = releasing.borrow_mut();
        if let Some(queue) = releasing.as_mut() {
            queue.push(registry);
            return None;
        }
        *releasing = Some(Vec::new());
        Some(registry)
    });
    let Ok(Some(mut registry)) = first else { return };

    struct Reset;
    impl Drop for Reset {
        fn drop(&mut self) {
            let _ = RELEASING.try_with(|releasing| releasing.borrow_mut().take());
        }
    }
    let _reset = Reset;

    loop {
        drop(registry);
        let next = RELEASING
            .try_with(|releasing| releasing.borrow_mut().as_mut().and_then(Vec::pop))
            .ok()
            .flatten();
        match next {
            Some(next) => registry = next,
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{release, Registered, Registry};
    use crate::{Outcome, State, Strategy};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn registry() -> Registry<i32, String, u8> {
        let mut registry = Registry::default();
        for _ in 0..2 {
            registry.done.push(Registered {
                strategy: Strategy::Immediate,
                callback: Box::new(|_: &Arc<i32>| ()),
            });
            registry.fail.push(Registered {
                strategy: Strategy::Immediate,
                callback: Box::new(|_: &Arc<String>| ()),
            });
            registry.progress.push(Registered {
                strategy: Strategy::Immediate,
                callback: Arc::new(|_: &Arc<u8>| ()),
            });
            registry.always.push(Registered {
                strategy: Strategy::Immediate,
                callback: Box::new(|_: &Outcome<i32, String>| ()),
            });
        }
        registry
    }

    #[test]
    fn test_drain_resolved_takes_done_and_always() {
        let mut registry = registry();
        assert_eq!(registry.len(), 8);
        let drained = registry.drain(State::Resolved);
        assert_eq!(drained.done.len(), 2);
        assert!(drained.fail.is_empty());
        assert_eq!(drained.always.len(), 2);
        // Fail and progress stay behind to be released.
        assert_eq!(registry.fail.len(), 2);
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_drain_rejected_takes_fail_and_always() {
        let mut registry = registry();
        let drained = registry.drain(State::Rejected);
        assert!(drained.done.is_empty());
        assert_eq!(drained.fail.len(), 2);
        assert_eq!(drained.always.len(), 2);
        assert_eq!(registry.done.len(), 2);
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_progress_snapshot_keeps_entries() {
        let registry = registry();
        assert_eq!(registry.progress().len(), 2);
        assert_eq!(registry.progress.len(), 2);
    }

    #[test]
    fn test_release_drops_callbacks() {
        struct Flag(Arc<AtomicUsize>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicUsize::new(0));
        let mut registry = registry();
        let flag = Flag(dropped.clone());
        registry.always.push(Registered {
            strategy: Strategy::Immediate,
            callback: Box::new(move |_: &Outcome<i32, String>| drop(flag)),
        });
        release(registry);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }
}
