//! Callback dispatch: where a registered callback runs, and what happens when
//! it panics.
use crate::executor::{Executor, ExecutorProvider, Lanes, Task};
use std::any::Any;
use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// A named execution context a callback can be routed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Lane {
    Ui,
    Computation,
    Disk,
    Network,
    Named(Cow<'static, str>),
}

impl Lane {
    pub fn named(name: impl Into<Cow<'static, str>>) -> Self {
        Lane::Named(name.into())
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lane::Ui => f.write_str("ui"),
            Lane::Computation => f.write_str("computation"),
            Lane::Disk => f.write_str("disk"),
            Lane::Network => f.write_str("network"),
            Lane::Named(name) => f.write_str(name),
        }
    }
}

/// How a callback is run, chosen when it is registered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// On the thread that settles the promise, or on the registering thread
    /// when the promise was already settled.
    #[default]
    Immediate,
    /// Submitted to the executor serving the lane.
    On(Lane),
}

impl From<Lane> for Strategy {
    fn from(lane: Lane) -> Self {
        Strategy::On(lane)
    }
}

/// The observation category a callback was registered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Channel {
    Done,
    Fail,
    Progress,
    Always,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Channel::Done => "done",
            Channel::Fail => "fail",
            Channel::Progress => "progress",
            Channel::Always => "always",
        })
    }
}

/// Sink for callback failures.
pub trait Logger: Send + Sync {
    fn error(&self, message: &str, cause: &str);
}

/// Reports through `tracing` at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn error(&self, message: &str, cause: &str) {
        tracing::error!(cause, "{message}");
    }
}

/// Routes callbacks to their strategy and contains their panics.
///
/// Built once and cloned into every promise; clones share the same
/// executors and logger.
///
/// # Examples
///
/// ```
/// use deferred::{Deferred, Dispatcher, Lane, ThreadExecutor};
/// use std::sync::{mpsc::channel, Arc};
///
/// let dispatcher = Dispatcher::builder()
///     .executor(Lane::Computation, Arc::new(ThreadExecutor::spawn("computation").unwrap()))
///     .build();
///
/// let deferred = Deferred::<u32, (), ()>::new(dispatcher);
/// let (tx, rx) = channel();
/// deferred.done_on(Lane::Computation, move |n| tx.send(n * 2).unwrap());
/// deferred.resolve(21).unwrap();
/// assert_eq!(rx.recv().unwrap(), 42);
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    executors: Arc<dyn ExecutorProvider>,
    logger: Arc<dyn Logger>,
}

impl Dispatcher {
    pub fn new(executors: impl ExecutorProvider + 'static) -> Self {
        Self {
            executors: Arc::new(executors),
            logger: Arc::new(TracingLogger),
        }
    }

    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    pub fn with_logger(mut self, logger: impl Logger + 'static) -> Self {
        self.logger = Arc::new(logger);
        self
    }

    pub(crate) fn dispatch(&self, strategy: &Strategy, channel: Channel, task: Task) {
        let task = self.guard(channel, task);
        match strategy {
            Strategy::Immediate => run_inline(task),
            Strategy::On(lane) => match self.executors.executor(lane) {
                Some(executor) => executor.submit(task),
                None => {
                    report(
                        &*self.logger,
                        &format!("no executor registered for lane {lane}"),
                        &format!("{channel} callback ran immediately instead"),
                    );
                    run_inline(task)
                }
            },
        }
    }

    fn guard(&self, channel: Channel, task: Task) -> Task {
        let logger = Arc::clone(&self.logger);
        Box::new(move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                report(
                    &*logger,
                    &format!("an uncaught panic occurred in a {channel} callback"),
                    panic_message(&*payload),
                );
            }
        })
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(Lanes::new())
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct DispatcherBuilder {
    lanes: Lanes,
    logger: Option<Arc<dyn Logger>>,
}

impl DispatcherBuilder {
    pub fn executor(mut self, lane: Lane, executor: Arc<dyn Executor>) -> Self {
        self.lanes.insert(lane, executor);
        self
    }

    pub fn logger(mut self, logger: impl Logger + 'static) -> Self {
        self.logger = Some(Arc::new(logger));
        self
    }

    pub fn build(self) -> Dispatcher {
        Dispatcher {
            executors: Arc::new(self.lanes),
            logger: self.logger.unwrap_or_else(|| Arc::new(TracingLogger)),
        }
    }
}

fn report(logger: &dyn Logger, message: &str, cause: &str) {
    // A panicking logger must not take the dispatch loop down with it.
    let _ = panic::catch_unwind(AssertUnwindSafe(|| logger.error(message, cause)));
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

thread_local! {
    static PENDING: RefCell<Option<VecDeque<Task>>> = const { RefCell::new(None) };
}

/// Runs `task` on this thread. A task submitted while another inline task is
/// running is queued and run by the outermost call once the current one
/// returns, so chains of promises settle in a loop instead of recursing.
fn run_inline(task: Task) {
    let first = PENDING.with(|pending| {
        let mut pending = pending.borrow_mut();
        if let Some(queue) = pending.as_mut() {
            queue.push_back(task);
            return None;
        }
        *pending = Some(VecDeque::new());
        Some(task)
    });
    let Some(mut task) = first else { return };

    struct Reset;
    impl Drop for Reset {
        fn drop(&mut self) {
            PENDING.with(|pending| pending.borrow_mut().take());
        }
    }
    let _reset = Reset;

    loop {
        task();
        match PENDING.with(|pending| pending.borrow_mut().as_mut().and_then(VecDeque::pop_front)) {
            Some(next) => task = next,
            None => break,
        }
    }
}
