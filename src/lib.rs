//! A deferred result that settles once, reports progress before that, and
//! delivers each outcome exactly once to every callback registered for it.
//!
//! [`Deferred`] is the settling side and [`Promise`] the observing side.
//! Callbacks run on the settling thread by default, or on the executor of a
//! [`Lane`] chosen when they are registered. [`Promise::filter`] and
//! [`Promise::pipe`] derive new promises from an existing one.
//!
//! # Examples
//!
//! ```
//! use deferred::Deferred;
//! use std::sync::mpsc::channel;
//!
//! let deferred = Deferred::<u32, String, u8>::default();
//! let (tx, rx) = channel();
//!
//! deferred
//!     .map(|n| n + 1)
//!     .and_then(|n| {
//!         let next = Deferred::default();
//!         next.resolve(n * 10).unwrap();
//!         next.promise()
//!     })
//!     .done(move |n| tx.send(*n).unwrap());
//!
//! deferred.resolve(1).unwrap();
//! assert_eq!(rx.recv().unwrap(), 20);
//! ```
mod deferred;
mod dispatch;
mod executor;
mod filter;
mod pipe;
mod registry;
mod state;

pub use deferred::{Deferred, Payload, Promise, Settled};
pub use dispatch::{Dispatcher, DispatcherBuilder, Lane, Logger, Strategy, TracingLogger};
pub use executor::{Executor, ExecutorProvider, Lanes, Task, ThreadExecutor};
pub use filter::Filter;
pub use pipe::Pipe;
pub use state::{Outcome, State};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Promise already {0}")]
    AlreadySettled(State),
    #[error("Interrupted while waiting for the promise to settle")]
    Interrupted,
    #[error("Failed to spawn executor thread")]
    Spawn(#[from] std::io::Error),
}
