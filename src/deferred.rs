//! The settle-once core: [`Deferred`] is the side that settles, [`Promise`]
//! the side that observes. Both are cheap handles onto the same state.
use crate::dispatch::{Channel, Dispatcher, Strategy};
use crate::registry::{self, AlwaysFn, DoneFn, Drained, FailFn, ProgressFn, Registered, Registry};
use crate::{Error, Outcome, State};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::mem;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};
use tracing::debug;

/// Values a promise can carry: shared across the settling thread, observer
/// threads and lane executors.
pub trait Payload: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Payload for T {}

struct Inner<D: Payload, F: Payload, P: Payload> {
    shared: Mutex<Shared<D, F, P>>,
    settled: Condvar,
    dispatcher: Dispatcher,
}

struct Shared<D, F, P> {
    outcome: Option<Outcome<D, F>>,
    callbacks: Registry<D, F, P>,
    wakers: Vec<Waker>,
    interrupts: u64,
}

/// The observing side of a deferred computation.
///
/// Callbacks fire at most once per outcome. Registering after the matching
/// settlement runs the callback right away through its strategy; progress is
/// never replayed.
pub struct Promise<D: Payload, F: Payload, P: Payload> {
    inner: Arc<Inner<D, F, P>>,
}

/// The settling side. Derefs to [`Promise`] so the owner can observe too.
///
/// # Examples
///
/// ```
/// use deferred::{Deferred, State};
/// use futures::executor::block_on;
/// use std::thread;
///
/// let deferred = Deferred::<String, String, u8>::default();
/// let promise = deferred.promise();
///
/// let task = thread::spawn(move || block_on(promise.settled()));
/// deferred.notify(50);
/// deferred.resolve("🍓".into()).unwrap();
///
/// let outcome = task.join().expect("The task thread has panicked");
/// assert_eq!(outcome.state(), State::Resolved);
/// assert_eq!(outcome.resolved().map(String::as_str), Some("🍓"));
/// assert!(deferred.reject("too late".into()).is_err());
/// ```
pub struct Deferred<D: Payload, F: Payload, P: Payload> {
    promise: Promise<D, F, P>,
}

impl<D: Payload, F: Payload, P: Payload> Clone for Promise<D, F, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Payload, F: Payload, P: Payload> Clone for Deferred<D, F, P> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
        }
    }
}

impl<D: Payload, F: Payload, P: Payload> Deref for Deferred<D, F, P> {
    type Target = Promise<D, F, P>;

    fn deref(&self) -> &Self::Target {
        &self.promise
    }
}

impl<D: Payload, F: Payload, P: Payload> Default for Deferred<D, F, P> {
    fn default() -> Self {
        Self::new(Dispatcher::default())
    }
}

impl<D: Payload, F: Payload, P: Payload> Deferred<D, F, P> {
    pub fn new(dispatcher: Dispatcher) -> Self {
        let inner = Inner {
            shared: Mutex::new(Shared {
                outcome: None,
                callbacks: Registry::default(),
                wakers: Vec::new(),
                interrupts: 0,
            }),
            settled: Condvar::new(),
            dispatcher,
        };
        Self {
            promise: Promise {
                inner: Arc::new(inner),
            },
        }
    }

    /// A read-only handle to hand to observers.
    pub fn promise(&self) -> Promise<D, F, P> {
        self.promise.clone()
    }

    /// Settles as resolved and fires done then always callbacks.
    ///
    /// Only the first settlement counts; later calls return
    /// [`Error::AlreadySettled`] and change nothing.
    pub fn resolve(&self, value: D) -> Result<(), Error> {
        self.settle(Outcome::Resolved(Arc::new(value)))
    }

    /// Settles as rejected and fires fail then always callbacks.
    pub fn reject(&self, value: F) -> Result<(), Error> {
        self.settle(Outcome::Rejected(Arc::new(value)))
    }

    /// Reports progress to the progress callbacks. Ignored once settled.
    pub fn notify(&self, progress: P) {
        self.notify_shared(Arc::new(progress))
    }

    pub(crate) fn notify_shared(&self, progress: Arc<P>) {
        let callbacks = {
            let shared = self.inner.shared.lock();
            if shared.outcome.is_some() {
                return;
            }
            shared.callbacks.progress()
        };
        for (strategy, callback) in callbacks {
            self.inner.fire_progress(&strategy, callback, Arc::clone(&progress));
        }
    }

    pub(crate) fn settle(&self, outcome: Outcome<D, F>) -> Result<(), Error> {
        let (mut callbacks, wakers) = {
            let mut shared = self.inner.shared.lock();
            if let Some(current) = &shared.outcome {
                return Err(Error::AlreadySettled(current.state()));
            }
            shared.outcome = Some(outcome.clone());
            (mem::take(&mut shared.callbacks), mem::take(&mut shared.wakers))
        };

        self.inner.settled.notify_all();
        for waker in wakers {
            waker.wake();
        }
        let drained = callbacks.drain(outcome.state());
        registry::release(callbacks);
        self.inner.deliver(&outcome, drained);
        Ok(())
    }

    /// Settlement driven by a parent or an inner promise, where losing a race
    /// is expected.
    pub(crate) fn settle_quietly(&self, outcome: Outcome<D, F>) {
        if let Err(error) = self.settle(outcome) {
            debug!("derived promise ignored settlement: {error}");
        }
    }

    /// Mirrors `inner` into this deferred: its done, fail and progress become
    /// ours.
    pub(crate) fn follow(&self, inner: &Promise<D, F, P>) {
        let resolver = self.clone();
        inner.register_done(
            Strategy::Immediate,
            Box::new(move |value: &Arc<D>| {
                resolver.settle_quietly(Outcome::Resolved(Arc::clone(value)))
            }),
        );
        let rejecter = self.clone();
        inner.register_fail(
            Strategy::Immediate,
            Box::new(move |value: &Arc<F>| {
                rejecter.settle_quietly(Outcome::Rejected(Arc::clone(value)))
            }),
        );
        let notifier = self.clone();
        inner.register_progress(
            Strategy::Immediate,
            Arc::new(move |progress: &Arc<P>| notifier.notify_shared(Arc::clone(progress))),
        );
    }
}

impl<D: Payload, F: Payload, P: Payload> Inner<D, F, P> {
    fn deliver(&self, outcome: &Outcome<D, F>, drained: Drained<D, F>) {
        let Drained { done, fail, always } = drained;
        match outcome {
            Outcome::Resolved(value) => {
                for Registered { strategy, callback } in done {
                    self.fire_done(&strategy, callback, Arc::clone(value));
                }
            }
            Outcome::Rejected(value) => {
                for Registered { strategy, callback } in fail {
                    self.fire_fail(&strategy, callback, Arc::clone(value));
                }
            }
        }
        for Registered { strategy, callback } in always {
            self.fire_always(&strategy, callback, outcome.clone());
        }
    }

    fn fire_done(&self, strategy: &Strategy, callback: DoneFn<D>, value: Arc<D>) {
        self.dispatcher
            .dispatch(strategy, Channel::Done, Box::new(move || callback(&value)));
    }

    fn fire_fail(&self, strategy: &Strategy, callback: FailFn<F>, value: Arc<F>) {
        self.dispatcher
            .dispatch(strategy, Channel::Fail, Box::new(move || callback(&value)));
    }

    fn fire_progress(&self, strategy: &Strategy, callback: ProgressFn<P>, progress: Arc<P>) {
        self.dispatcher.dispatch(
            strategy,
            Channel::Progress,
            Box::new(move || callback(&progress)),
        );
    }

    fn fire_always(&self, strategy: &Strategy, callback: AlwaysFn<D, F>, outcome: Outcome<D, F>) {
        self.dispatcher
            .dispatch(strategy, Channel::Always, Box::new(move || callback(&outcome)));
    }
}

impl<D: Payload, F: Payload, P: Payload> Drop for Inner<D, F, P> {
    fn drop(&mut self) {
        // An unsettled chain owns its derived promises through these.
        registry::release(mem::take(&mut self.shared.get_mut().callbacks));
    }
}

impl<D: Payload, F: Payload, P: Payload> Promise<D, F, P> {
    pub fn state(&self) -> State {
        self.inner
            .shared
            .lock()
            .outcome
            .as_ref()
            .map_or(State::Pending, Outcome::state)
    }

    pub fn is_pending(&self) -> bool {
        self.state() == State::Pending
    }

    pub fn is_resolved(&self) -> bool {
        self.state() == State::Resolved
    }

    pub fn is_rejected(&self) -> bool {
        self.state() == State::Rejected
    }

    /// The settled value, if there is one yet.
    pub fn outcome(&self) -> Option<Outcome<D, F>> {
        self.inner.shared.lock().outcome.clone()
    }

    pub fn done(&self, callback: impl FnOnce(&D) + Send + 'static) -> &Self {
        self.done_on(Strategy::Immediate, callback)
    }

    pub fn done_on(
        &self,
        strategy: impl Into<Strategy>,
        callback: impl FnOnce(&D) + Send + 'static,
    ) -> &Self {
        self.register_done(
            strategy.into(),
            Box::new(move |value: &Arc<D>| callback(&**value)),
        );
        self
    }

    pub fn fail(&self, callback: impl FnOnce(&F) + Send + 'static) -> &Self {
        self.fail_on(Strategy::Immediate, callback)
    }

    pub fn fail_on(
        &self,
        strategy: impl Into<Strategy>,
        callback: impl FnOnce(&F) + Send + 'static,
    ) -> &Self {
        self.register_fail(
            strategy.into(),
            Box::new(move |value: &Arc<F>| callback(&**value)),
        );
        self
    }

    pub fn progress(&self, callback: impl Fn(&P) + Send + Sync + 'static) -> &Self {
        self.progress_on(Strategy::Immediate, callback)
    }

    pub fn progress_on(
        &self,
        strategy: impl Into<Strategy>,
        callback: impl Fn(&P) + Send + Sync + 'static,
    ) -> &Self {
        self.register_progress(
            strategy.into(),
            Arc::new(move |progress: &Arc<P>| callback(&**progress)),
        );
        self
    }

    pub fn always(&self, callback: impl FnOnce(&Outcome<D, F>) + Send + 'static) -> &Self {
        self.always_on(Strategy::Immediate, callback)
    }

    pub fn always_on(
        &self,
        strategy: impl Into<Strategy>,
        callback: impl FnOnce(&Outcome<D, F>) + Send + 'static,
    ) -> &Self {
        self.register_always(strategy.into(), Box::new(callback));
        self
    }

    /// Registers a done and a fail callback at once.
    pub fn then(
        &self,
        done: impl FnOnce(&D) + Send + 'static,
        fail: impl FnOnce(&F) + Send + 'static,
    ) -> &Self {
        self.done(done).fail(fail)
    }

    /// Like [`Promise::then`], also registering a progress callback.
    pub fn then_with_progress(
        &self,
        done: impl FnOnce(&D) + Send + 'static,
        fail: impl FnOnce(&F) + Send + 'static,
        progress: impl Fn(&P) + Send + Sync + 'static,
    ) -> &Self {
        self.progress(progress).then(done, fail)
    }

    pub(crate) fn register_done(&self, strategy: Strategy, callback: DoneFn<D>) {
        let mut guard = self.inner.shared.lock();
        let shared = &mut *guard;
        let value = match &shared.outcome {
            None => {
                shared.callbacks.done.push(Registered { strategy, callback });
                return;
            }
            Some(Outcome::Resolved(value)) => Arc::clone(value),
            Some(Outcome::Rejected(_)) => return,
        };
        drop(guard);
        self.inner.fire_done(&strategy, callback, value);
    }

    pub(crate) fn register_fail(&self, strategy: Strategy, callback: FailFn<F>) {
        let mut guard = self.inner.shared.lock();
        let shared = &mut *guard;
        let value = match &shared.outcome {
            None => {
                shared.callbacks.fail.push(Registered { strategy, callback });
                return;
            }
            Some(Outcome::Rejected(value)) => Arc::clone(value),
            Some(Outcome::Resolved(_)) => return,
        };
        drop(guard);
        self.inner.fire_fail(&strategy, callback, value);
    }

    pub(crate) fn register_progress(&self, strategy: Strategy, callback: ProgressFn<P>) {
        let mut shared = self.inner.shared.lock();
        if shared.outcome.is_none() {
            shared.callbacks.progress.push(Registered { strategy, callback });
        }
    }

    pub(crate) fn register_always(&self, strategy: Strategy, callback: AlwaysFn<D, F>) {
        let mut guard = self.inner.shared.lock();
        let shared = &mut *guard;
        let outcome = match &shared.outcome {
            None => {
                shared.callbacks.always.push(Registered { strategy, callback });
                return;
            }
            Some(outcome) => outcome.clone(),
        };
        drop(guard);
        self.inner.fire_always(&strategy, callback, outcome);
    }

    /// Drops every callback that has not been dispatched yet. The promise
    /// still settles normally.
    pub fn discard_callbacks(&self) {
        let discarded = mem::take(&mut self.inner.shared.lock().callbacks);
        registry::release(discarded);
    }

    /// Blocks until settled. See [`Promise::wait_until_settled`].
    pub fn wait(&self) -> Result<State, Error> {
        self.wait_until_settled(None)
    }

    /// Blocks the calling thread until the promise settles or `timeout`
    /// elapses, returning the state seen last. A timeout is not an error:
    /// `Ok(State::Pending)` comes back and the caller polls again.
    ///
    /// Fails with [`Error::Interrupted`] if [`Promise::interrupt_waiters`] is
    /// called while waiting. Must not be called from an immediate callback
    /// whose own dispatch is what settles this promise.
    pub fn wait_until_settled(&self, timeout: Option<Duration>) -> Result<State, Error> {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let mut shared = self.inner.shared.lock();
        let generation = shared.interrupts;
        loop {
            if let Some(outcome) = &shared.outcome {
                return Ok(outcome.state());
            }
            if shared.interrupts != generation {
                return Err(Error::Interrupted);
            }
            match deadline {
                None => self.inner.settled.wait(&mut shared),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Ok(State::Pending);
                    }
                    let _ = self.inner.settled.wait_until(&mut shared, deadline);
                }
            }
        }
    }

    /// Wakes every thread blocked in [`Promise::wait_until_settled`] on this
    /// promise with [`Error::Interrupted`].
    pub fn interrupt_waiters(&self) {
        {
            let mut shared = self.inner.shared.lock();
            shared.interrupts = shared.interrupts.wrapping_add(1);
        }
        self.inner.settled.notify_all();
    }

    /// A future that completes with the outcome once settled.
    pub fn settled(&self) -> Settled<D, F, P> {
        Settled {
            promise: self.clone(),
        }
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }
}

impl<D: Payload, F: Payload, P: Payload> fmt::Debug for Promise<D, F, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.inner.shared.lock();
        let state = shared.outcome.as_ref().map_or(State::Pending, Outcome::state);
        f.debug_struct("Promise")
            .field("state", &state)
            .field("callbacks", &shared.callbacks.len())
            .finish()
    }
}

impl<D: Payload, F: Payload, P: Payload> fmt::Debug for Deferred<D, F, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Deferred").field(&self.promise).finish()
    }
}

/// Returned by [`Promise::settled`].
pub struct Settled<D: Payload, F: Payload, P: Payload> {
    promise: Promise<D, F, P>,
}

impl<D: Payload, F: Payload, P: Payload> Future for Settled<D, F, P> {
    type Output = Outcome<D, F>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = self.promise.inner.shared.lock();
        let shared = &mut *guard;
        match &shared.outcome {
            Some(outcome) => Poll::Ready(outcome.clone()),
            None => {
                if !shared.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
                    shared.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Deferred, Promise};
    use crate::{Error, Outcome, State};
    use futures::executor::block_on;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_deferred_resolve() {
        let deferred = Deferred::<String, (), ()>::default();
        let promise = deferred.promise();
        let task1 = thread::spawn(move || block_on(promise.settled()));
        let task2 = thread::spawn(move || deferred.resolve(String::from("🍓")));
        task2
            .join()
            .expect("The task2 thread has panicked")
            .unwrap();
        let outcome = task1.join().expect("The task1 thread has panicked");
        assert_eq!(outcome.resolved().map(String::as_str), Some("🍓"));
    }

    #[test]
    fn test_two_waiters_resolve() {
        let deferred = Deferred::<String, (), ()>::default();
        let (a, b) = (deferred.promise(), deferred.promise());
        let task1 = thread::spawn(move || block_on(a.settled()).state());
        let task2 = thread::spawn(move || b.wait());
        deferred.resolve("🍓".into()).unwrap();
        assert_eq!(task1.join().expect("The task1 thread has panicked"), State::Resolved);
        assert_eq!(
            task2.join().expect("The task2 thread has panicked").unwrap(),
            State::Resolved
        );
    }

    #[test]
    fn test_deferred_reject() {
        let deferred = Deferred::<(), String, ()>::default();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        deferred.fail(move |err| *s.lock() = Some(err.clone()));
        deferred.done(|_| panic!("done must not fire on reject"));
        deferred.reject("reject!!".into()).unwrap();
        assert_eq!(seen.lock().as_deref(), Some("reject!!"));
        assert!(deferred.is_rejected());
    }

    #[test]
    fn test_resolve_twice() {
        let deferred = Deferred::<u8, u8, ()>::default();
        deferred.resolve(1).unwrap();
        assert!(matches!(
            deferred.resolve(2),
            Err(Error::AlreadySettled(State::Resolved))
        ));
        assert!(matches!(
            deferred.reject(3),
            Err(Error::AlreadySettled(State::Resolved))
        ));
        assert_eq!(deferred.outcome().unwrap().resolved(), Some(&1));
    }

    #[test]
    fn test_always_sees_outcome() {
        let deferred = Deferred::<u8, &'static str, ()>::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        deferred.always(move |outcome| s.lock().push(outcome.state()));
        deferred.reject("nope").unwrap();
        let s = seen.clone();
        deferred.always(move |outcome| {
            assert!(matches!(outcome, Outcome::Rejected(_)));
            s.lock().push(outcome.state());
        });
        assert_eq!(*seen.lock(), vec![State::Rejected, State::Rejected]);
    }

    #[test]
    fn test_callback_can_reenter_promise() {
        let deferred = Deferred::<u8, (), ()>::default();
        let promise = deferred.promise();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        deferred.done(move |_| {
            assert!(promise.is_resolved());
            let c = c.clone();
            promise.done(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            });
        });
        deferred.resolve(0).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_interrupt_waiters() {
        let deferred = Deferred::<(), (), ()>::default();
        let promise = deferred.promise();
        let waiter = thread::spawn(move || promise.wait());
        // Only waiters already blocked are interrupted.
        while !waiter.is_finished() {
            deferred.interrupt_waiters();
            thread::sleep(Duration::from_millis(10));
        }
        let result = waiter.join().expect("The waiter thread has panicked");
        assert!(matches!(result, Err(Error::Interrupted)));
        assert!(deferred.is_pending());
    }

    #[test]
    fn test_then_with_progress() {
        let deferred = Deferred::<u8, u8, u8>::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done, fail, progress) = (seen.clone(), seen.clone(), seen.clone());
        deferred.then_with_progress(
            move |v| done.lock().push(format!("done {v}")),
            move |v| fail.lock().push(format!("fail {v}")),
            move |p| progress.lock().push(format!("progress {p}")),
        );
        deferred.notify(50);
        deferred.resolve(1).unwrap();
        assert_eq!(*seen.lock(), vec!["progress 50".to_owned(), "done 1".to_owned()]);
    }

    /// Reads the promise it belongs to when dropped.
    struct Inspect(Promise<u8, (), ()>, Arc<Mutex<Vec<State>>>);

    impl Drop for Inspect {
        fn drop(&mut self) {
            self.1.lock().push(self.0.state());
        }
    }

    #[test]
    fn test_discarded_callback_may_touch_promise_on_drop() {
        let deferred = Deferred::<u8, (), ()>::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let inspect = Inspect(deferred.promise(), seen.clone());
        deferred.done(move |_| drop(inspect));
        deferred.discard_callbacks();
        assert_eq!(*seen.lock(), vec![State::Pending]);
    }

    #[test]
    fn test_unfired_callback_may_touch_promise_on_drop() {
        let deferred = Deferred::<u8, (), ()>::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let inspect = Inspect(deferred.promise(), seen.clone());
        deferred.fail(move |_| drop(inspect));
        deferred.resolve(1).unwrap();
        assert_eq!(*seen.lock(), vec![State::Resolved]);
    }

    #[test]
    fn test_debug_reports_state() {
        let deferred = Deferred::<u8, (), ()>::default();
        deferred.done(|_| ());
        assert_eq!(
            format!("{:?}", deferred.promise()),
            "Promise { state: Pending, callbacks: 1 }"
        );
    }
}
