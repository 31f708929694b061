//! Chaining a promise into follow-on asynchronous computations.
use crate::deferred::{Deferred, Payload, Promise};
use crate::{Outcome, Strategy};
use std::sync::Arc;

type Step<I, DO, FO, PO> = Box<dyn Fn(Arc<I>, &Deferred<DO, FO, PO>) + Send + Sync>;

/// Per-channel steps for [`Promise::pipe`].
///
/// A step turns the parent's value into a new promise, and the piped promise
/// then settles the way that one does. Channels without a step pass the
/// parent's value straight through.
///
/// # Examples
///
/// ```
/// use deferred::{Deferred, Pipe, Promise};
/// use std::thread;
///
/// fn fetch_len(url: &str) -> Promise<usize, String, ()> {
///     let deferred = Deferred::default();
///     let promise = deferred.promise();
///     let url = url.to_owned();
///     thread::spawn(move || deferred.resolve(url.len()));
///     promise
/// }
///
/// let deferred = Deferred::<String, String, ()>::default();
/// let len = deferred.pipe(Pipe::done(|url: &String| fetch_len(url)));
/// deferred.resolve("https://example.com".into()).unwrap();
/// len.wait().unwrap();
/// assert_eq!(len.outcome().unwrap().resolved(), Some(&19));
/// ```
pub struct Pipe<D, F, P, DO, FO, PO>
where
    D: Payload,
    F: Payload,
    P: Payload,
    DO: Payload,
    FO: Payload,
    PO: Payload,
{
    strategy: Strategy,
    done: Step<D, DO, FO, PO>,
    fail: Step<F, DO, FO, PO>,
    progress: Step<P, DO, FO, PO>,
}

fn resolve_through<D: Payload, F: Payload, P: Payload>() -> Step<D, D, F, P> {
    Box::new(|value: Arc<D>, child: &Deferred<D, F, P>| {
        child.settle_quietly(Outcome::Resolved(value))
    })
}

fn reject_through<D: Payload, F: Payload, P: Payload>() -> Step<F, D, F, P> {
    Box::new(|value: Arc<F>, child: &Deferred<D, F, P>| {
        child.settle_quietly(Outcome::Rejected(value))
    })
}

fn notify_through<D: Payload, F: Payload, P: Payload>() -> Step<P, D, F, P> {
    Box::new(|value: Arc<P>, child: &Deferred<D, F, P>| child.notify_shared(value))
}

fn chain<I, DO, FO, PO>(
    step: impl Fn(&I) -> Promise<DO, FO, PO> + Send + Sync + 'static,
) -> Step<I, DO, FO, PO>
where
    I: Payload,
    DO: Payload,
    FO: Payload,
    PO: Payload,
{
    Box::new(move |value: Arc<I>, child: &Deferred<DO, FO, PO>| child.follow(&step(&*value)))
}

impl<D: Payload, F: Payload, P: Payload, DO: Payload> Pipe<D, F, P, DO, F, P> {
    /// Pipes the resolved value; rejection and progress pass through.
    pub fn done(step: impl Fn(&D) -> Promise<DO, F, P> + Send + Sync + 'static) -> Self {
        Self {
            strategy: Strategy::Immediate,
            done: chain(step),
            fail: reject_through(),
            progress: notify_through(),
        }
    }
}

impl<D: Payload, F: Payload, P: Payload, FO: Payload> Pipe<D, F, P, D, FO, P> {
    /// Pipes the rejection, e.g. to recover from it; resolution and progress
    /// pass through.
    pub fn fail(step: impl Fn(&F) -> Promise<D, FO, P> + Send + Sync + 'static) -> Self {
        Self {
            strategy: Strategy::Immediate,
            done: resolve_through(),
            fail: chain(step),
            progress: notify_through(),
        }
    }
}

impl<D: Payload, F: Payload, P: Payload, PO: Payload> Pipe<D, F, P, D, F, PO> {
    pub fn progress(step: impl Fn(&P) -> Promise<D, F, PO> + Send + Sync + 'static) -> Self {
        Self {
            strategy: Strategy::Immediate,
            done: resolve_through(),
            fail: reject_through(),
            progress: chain(step),
        }
    }
}

impl<D, F, P, DO, FO, PO> Pipe<D, F, P, DO, FO, PO>
where
    D: Payload,
    F: Payload,
    P: Payload,
    DO: Payload,
    FO: Payload,
    PO: Payload,
{
    pub fn new(
        done: impl Fn(&D) -> Promise<DO, FO, PO> + Send + Sync + 'static,
        fail: impl Fn(&F) -> Promise<DO, FO, PO> + Send + Sync + 'static,
        progress: impl Fn(&P) -> Promise<DO, FO, PO> + Send + Sync + 'static,
    ) -> Self {
        Self {
            strategy: Strategy::Immediate,
            done: chain(done),
            fail: chain(fail),
            progress: chain(progress),
        }
    }

    pub fn with_done(mut self, step: impl Fn(&D) -> Promise<DO, FO, PO> + Send + Sync + 'static) -> Self {
        self.done = chain(step);
        self
    }

    pub fn with_fail(mut self, step: impl Fn(&F) -> Promise<DO, FO, PO> + Send + Sync + 'static) -> Self {
        self.fail = chain(step);
        self
    }

    pub fn with_progress(
        mut self,
        step: impl Fn(&P) -> Promise<DO, FO, PO> + Send + Sync + 'static,
    ) -> Self {
        self.progress = chain(step);
        self
    }

    /// Where the parent's internal listeners, and so the steps, run.
    pub fn on(mut self, strategy: impl Into<Strategy>) -> Self {
        self.strategy = strategy.into();
        self
    }
}

impl<D: Payload, F: Payload, P: Payload> Promise<D, F, P> {
    /// Derives a promise that follows whichever promise `pipe` produces for
    /// this one's outcome or progress.
    ///
    /// A progress step's promise settles the piped promise too; whichever
    /// settlement reaches it first wins.
    pub fn pipe<DO, FO, PO>(&self, pipe: Pipe<D, F, P, DO, FO, PO>) -> Promise<DO, FO, PO>
    where
        DO: Payload,
        FO: Payload,
        PO: Payload,
    {
        let Pipe {
            strategy,
            done,
            fail,
            progress,
        } = pipe;
        let child = Deferred::<DO, FO, PO>::new(self.dispatcher().clone());

        let resolver = child.clone();
        self.register_done(
            strategy.clone(),
            Box::new(move |value: &Arc<D>| done(Arc::clone(value), &resolver)),
        );
        let rejecter = child.clone();
        self.register_fail(
            strategy.clone(),
            Box::new(move |value: &Arc<F>| fail(Arc::clone(value), &rejecter)),
        );
        let notifier = child.clone();
        self.register_progress(
            strategy,
            Arc::new(move |value: &Arc<P>| progress(Arc::clone(value), &notifier)),
        );

        child.promise()
    }

    /// Chains a follow-on computation on the resolved value.
    pub fn and_then<DO: Payload>(
        &self,
        step: impl Fn(&D) -> Promise<DO, F, P> + Send + Sync + 'static,
    ) -> Promise<DO, F, P> {
        self.pipe(Pipe::done(step))
    }
}
