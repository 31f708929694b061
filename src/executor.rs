//! Executors that lane strategies submit callbacks to.
//!
//! The crate never builds executors on its own: they are registered with a
//! [`Lanes`] map (or any other [`ExecutorProvider`]) that the
//! [`Dispatcher`](crate::Dispatcher) looks up by [`Lane`].
use crate::{Error, Lane};
use crossbeam_channel::{unbounded, Sender};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// A unit of work handed to an executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Accepts tasks for execution somewhere else. `submit` must not block on
/// the task's completion.
pub trait Executor: Send + Sync {
    fn submit(&self, task: Task);
}

impl<T> Executor for T
where
    T: Fn(Task) + Send + Sync,
{
    fn submit(&self, task: Task) {
        self(task)
    }
}

/// Resolves a lane to the executor that serves it.
pub trait ExecutorProvider: Send + Sync {
    fn executor(&self, lane: &Lane) -> Option<Arc<dyn Executor>>;
}

/// A lane → executor map.
#[derive(Default, Clone)]
pub struct Lanes {
    executors: HashMap<Lane, Arc<dyn Executor>>,
}

impl Lanes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `executor` for `lane`, replacing any previous one.
    pub fn insert(&mut self, lane: Lane, executor: Arc<dyn Executor>) -> &mut Self {
        self.executors.insert(lane, executor);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl ExecutorProvider for Lanes {
    fn executor(&self, lane: &Lane) -> Option<Arc<dyn Executor>> {
        self.executors.get(lane).cloned()
    }
}

impl fmt::Debug for Lanes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.executors.keys()).finish()
    }
}

/// A single named worker thread fed by an unbounded queue.
///
/// Tasks run in submission order. A panicking task is logged and the worker
/// moves on. Dropping the executor closes the queue, lets the worker finish
/// what is already queued, and joins it.
///
/// # Examples
///
/// ```
/// use deferred::{Executor, ThreadExecutor};
/// use std::sync::mpsc::channel;
///
/// let executor = ThreadExecutor::spawn("disk").unwrap();
/// let (tx, rx) = channel();
/// executor.submit(Box::new(move || {
///     tx.send(std::thread::current().name().map(str::to_owned)).unwrap();
/// }));
/// assert_eq!(rx.recv().unwrap().as_deref(), Some("disk"));
/// ```
pub struct ThreadExecutor {
    sender: Option<Sender<Task>>,
    thread: Option<JoinHandle<()>>,
}

impl ThreadExecutor {
    pub fn spawn(name: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();
        let (sender, receiver) = unbounded::<Task>();

        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            debug!("executor {name} started");
            for task in receiver {
                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    error!("a task panicked on executor {name}");
                }
            }
            debug!("executor {name} finished");
        })?;

        Ok(Self {
            sender: Some(sender),
            thread: Some(thread),
        })
    }
}

impl Executor for ThreadExecutor {
    fn submit(&self, task: Task) {
        if let Some(sender) = &self.sender {
            if let Err(err) = sender.send(task) {
                error!("executor worker is gone, task dropped: {err}");
            }
        }
    }
}

impl Drop for ThreadExecutor {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            // The last handle may be released by a task on the worker itself.
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl fmt::Debug for ThreadExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.thread.as_ref().and_then(|t| t.thread().name());
        f.debug_struct("ThreadExecutor").field("name", &name).finish()
    }
}
