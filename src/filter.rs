//! Synchronous value mapping from one promise to a derived one.
use crate::deferred::{Deferred, Payload, Promise};
use crate::{Outcome, Strategy};
use std::sync::Arc;

type Map<I, O> = Box<dyn Fn(Arc<I>) -> Arc<O> + Send + Sync>;

/// Per-channel transforms for [`Promise::filter`].
///
/// Starts out as the identity; every channel without a transform passes the
/// parent's value through untouched, so its output type stays the input type.
///
/// # Examples
///
/// ```
/// use deferred::{Deferred, Filter};
///
/// let deferred = Deferred::<u32, String, f32>::default();
/// let child = deferred.filter(
///     Filter::new()
///         .done(|n: &u32| n.to_string())
///         .progress(|p: &f32| (p * 100.0) as u8),
/// );
/// deferred.resolve(7).unwrap();
/// assert_eq!(child.outcome().unwrap().resolved().map(String::as_str), Some("7"));
/// ```
pub struct Filter<D, F, P, DO = D, FO = F, PO = P> {
    strategy: Strategy,
    done: Map<D, DO>,
    fail: Map<F, FO>,
    progress: Map<P, PO>,
}

impl<D: Payload, F: Payload, P: Payload> Filter<D, F, P> {
    pub fn new() -> Self {
        Self {
            strategy: Strategy::Immediate,
            done: Box::new(|value: Arc<D>| value),
            fail: Box::new(|value: Arc<F>| value),
            progress: Box::new(|value: Arc<P>| value),
        }
    }
}

impl<D: Payload, F: Payload, P: Payload> Default for Filter<D, F, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D, F, P, DO, FO, PO> Filter<D, F, P, DO, FO, PO>
where
    D: Payload,
    F: Payload,
    P: Payload,
    DO: Payload,
    FO: Payload,
    PO: Payload,
{
    pub fn done<X: Payload>(
        self,
        map: impl Fn(&D) -> X + Send + Sync + 'static,
    ) -> Filter<D, F, P, X, FO, PO> {
        Filter {
            strategy: self.strategy,
            done: Box::new(move |value: Arc<D>| Arc::new(map(&*value))),
            fail: self.fail,
            progress: self.progress,
        }
    }

    pub fn fail<X: Payload>(
        self,
        map: impl Fn(&F) -> X + Send + Sync + 'static,
    ) -> Filter<D, F, P, DO, X, PO> {
        Filter {
            strategy: self.strategy,
            done: self.done,
            fail: Box::new(move |value: Arc<F>| Arc::new(map(&*value))),
            progress: self.progress,
        }
    }

    pub fn progress<X: Payload>(
        self,
        map: impl Fn(&P) -> X + Send + Sync + 'static,
    ) -> Filter<D, F, P, DO, FO, X> {
        Filter {
            strategy: self.strategy,
            done: self.done,
            fail: self.fail,
            progress: Box::new(move |value: Arc<P>| Arc::new(map(&*value))),
        }
    }

    /// Where the parent's internal listeners run. Immediate by default, so a
    /// filter adds no executor hop of its own.
    pub fn on(mut self, strategy: impl Into<Strategy>) -> Self {
        self.strategy = strategy.into();
        self
    }
}

impl<D: Payload, F: Payload, P: Payload> Promise<D, F, P> {
    /// Derives a promise whose outcome and progress are this one's passed
    /// through `filter`.
    pub fn filter<DO, FO, PO>(&self, filter: Filter<D, F, P, DO, FO, PO>) -> Promise<DO, FO, PO>
    where
        DO: Payload,
        FO: Payload,
        PO: Payload,
    {
        let Filter {
            strategy,
            done,
            fail,
            progress,
        } = filter;
        let child = Deferred::<DO, FO, PO>::new(self.dispatcher().clone());

        let resolver = child.clone();
        self.register_done(
            strategy.clone(),
            Box::new(move |value: &Arc<D>| {
                resolver.settle_quietly(Outcome::Resolved(done(Arc::clone(value))))
            }),
        );
        let rejecter = child.clone();
        self.register_fail(
            strategy.clone(),
            Box::new(move |value: &Arc<F>| {
                rejecter.settle_quietly(Outcome::Rejected(fail(Arc::clone(value))))
            }),
        );
        let notifier = child.clone();
        self.register_progress(
            strategy,
            Arc::new(move |value: &Arc<P>| notifier.notify_shared(progress(Arc::clone(value)))),
        );

        child.promise()
    }

    /// Maps the resolved value; rejection and progress pass through.
    pub fn map<DO: Payload>(
        &self,
        map: impl Fn(&D) -> DO + Send + Sync + 'static,
    ) -> Promise<DO, F, P> {
        self.filter(Filter::new().done(map))
    }
}

#[cfg(test)]
mod tests {
    use super::Filter;
    use crate::{Deferred, State};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_filter_done() {
        let deferred = Deferred::<u32, String, ()>::default();
        let child = deferred.map(|n| n * 2);
        assert!(child.is_pending());
        deferred.resolve(21).unwrap();
        assert_eq!(child.outcome().unwrap().resolved(), Some(&42));
    }

    #[test]
    fn test_filter_fail() {
        let deferred = Deferred::<(), String, ()>::default();
        let child = deferred.filter(Filter::new().fail(|e: &String| e.len()));
        deferred.reject("💥".into()).unwrap();
        assert_eq!(child.state(), State::Rejected);
        assert_eq!(child.outcome().unwrap().rejected(), Some(&4));
    }

    #[test]
    fn test_filter_passes_through_untransformed_channels() {
        let deferred = Deferred::<String, String, u8>::default();
        let child = deferred.map(|s: &String| s.len());
        let progress = Arc::new(Mutex::new(Vec::new()));
        let p = progress.clone();
        child.progress(move |n| p.lock().push(*n));

        deferred.notify(1);
        deferred.notify(2);
        deferred.reject("nope".into()).unwrap();

        assert_eq!(*progress.lock(), vec![1, 2]);
        let outcome = child.outcome().unwrap();
        assert_eq!(outcome.rejected().map(String::as_str), Some("nope"));
    }

    #[test]
    fn test_identity_filter_shares_value() {
        let deferred = Deferred::<String, (), ()>::default();
        let child = deferred.filter(Filter::new());
        deferred.resolve("🍓".into()).unwrap();
        let parent = deferred.outcome().unwrap();
        let child = child.outcome().unwrap();
        match (parent, child) {
            (crate::Outcome::Resolved(a), crate::Outcome::Resolved(b)) => assert!(Arc::ptr_eq(&a, &b)),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_filter_after_settlement() {
        let deferred = Deferred::<u8, (), ()>::default();
        deferred.resolve(1).unwrap();
        let child = deferred.map(|n| n + 1).map(|n| n + 1);
        assert_eq!(child.outcome().unwrap().resolved(), Some(&3));
    }

    #[test]
    fn test_filter_panic_leaves_child_pending() {
        let deferred = Deferred::<u8, (), ()>::default();
        let child = deferred.map(|_: &u8| -> u8 { panic!("bad map") });
        deferred.resolve(1).unwrap();
        assert!(deferred.is_resolved());
        assert!(child.is_pending());
    }
}
