//! Backpressure-aware streams for Rust. Water only flows down the hill as fast as the sink drinks it.
//!
//! This crate offers push/pull streams with explicit buffering limits, modeled after the
//! readable/writable/transform stream families found in event-loop runtimes.
//!
//! Main features:
//!
//! - A [`Readable`] buffers produced chunks up to a high-water mark and asks its producer for more only when there is room
//! - A [`Writable`] queues writes, dispatches them one at a time, and signals `drain` once the queue falls behind the mark
//! - Corking batches queued writes into a single dispatch
//! - A [`Transform`] couples both halves so a slow reader holds back the writer
//! - [`Readable::map`] and [`Readable::flat_map`] run async mappers with bounded concurrency, in order
//! - A shared teardown protocol: errors, `close`, and awaitable completion for every stream
//! - Single threaded. Streams are driven by a [`Scheduler`] on the current task
//!
//! Example:
//!
//! ```rust
//! use futures::{future, TryStreamExt};
//! use sluice::{Chunk, Encoding, FlatMapOptions, Pipeline, Scheduler, Transform, TransformDone, TransformOptions};
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let scheduler = Scheduler::new();
//!
//! let evens = Transform::new(
//!     &scheduler,
//!     TransformOptions::object(),
//!     |chunk: Chunk<u32>, _: Encoding, done: TransformDone<u32>| match chunk.into_value() {
//!         Some(n) if n % 2 == 0 => done.complete_with(Chunk::Value(n)),
//!         _ => done.ok(),
//!     },
//! );
//!
//! let (output, handle) = Pipeline::from_iter(&scheduler, 1..=6)
//!     .through(&evens)
//!     .map(|chunk, _| future::ready(Ok(Chunk::Value(chunk.into_value().unwrap_or(0) * 10))), FlatMapOptions::concurrent(4))
//!     .unwrap()
//!     .build();
//!
//! let out: Vec<_> = scheduler.run_until(output.try_collect::<Vec<_>>()).await.unwrap();
//! assert_eq!(out, vec![Chunk::Value(20), Chunk::Value(40), Chunk::Value(60)]);
//! assert_eq!(scheduler.run_until(handle.finished()).await, Ok(()));
//! # });
//! ```
//!
//! ## Scheduler
//!
//! Every notification a stream raises is delivered on a later turn of its [`Scheduler`], never
//! from inside the call that caused it. Nothing happens until the scheduler is driven:
//!
//! ```rust
//! use sluice::{Readable, Scheduler};
//! use std::{cell::RefCell, rc::Rc};
//!
//! let scheduler = Scheduler::new();
//! let readable = Readable::from_values(&scheduler, vec![1, 2, 3]);
//!
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! let log = seen.clone();
//! readable.on(move |event| log.borrow_mut().push(event.name()));
//! readable.resume();
//! assert!(seen.borrow().is_empty());
//!
//! scheduler.run_until_idle();
//! assert!(seen.borrow().contains(&"end"));
//! assert_eq!(seen.borrow().last(), Some(&"close"));
//! ```
//!
//! ## Writing
//!
//! A write reports whether the caller may keep writing. Once it returns `false`, wait for
//! [`Event::Drain`]:
//!
//! ```rust
//! use sluice::{Chunk, Done, Encoding, Scheduler, StreamOptions, Writable};
//!
//! let scheduler = Scheduler::new();
//! let writable = Writable::new(
//!     &scheduler,
//!     StreamOptions::object().high_water_mark(2),
//!     |_: Chunk<u8>, _: Encoding, done: Done| done.ok(),
//! );
//!
//! writable.cork();
//! assert_eq!(writable.write(Chunk::Value(1)), Ok(true));
//! assert_eq!(writable.write(Chunk::Value(2)), Ok(false));
//! assert!(writable.need_drain());
//! ```
//!
//! ## Teardown
//!
//! [`Readable::destroy`], [`Writable::destroy`] and [`Transform::destroy`] run the stream's
//! teardown hook once, emit `error` if an error was given, then `close`. The `finished()` and
//! `closed()` futures report how a stream ended.
mod chunk;
mod chunk_store;
mod destroy;
mod error;
mod events;
mod flat_map;
mod options;
mod pipeline;
mod readable;
mod scheduler;
mod transform;
mod writable;

#[cfg(test)]
mod test_utils;

pub use chunk::{Chunk, Encoding};
pub use chunk_store::ChunkStore;
pub use destroy::{Constructable, DisposeGuard, TeardownDone, Teardownable};
pub use error::{StreamError, StreamResult};
pub use events::{Event, ListenerId};
pub use flat_map::Mapped;
pub use options::{
    FlatMapOptions, StreamOptions, TransformOptions, DEFAULT_HIGH_WATER_MARK,
    DEFAULT_OBJECT_HIGH_WATER_MARK,
};
pub use pipeline::{Pipeline, PipelineHandle};
pub use readable::{Fillable, Readable, ReadableBuilder, WeakReadable, MAX_HIGH_WATER_MARK};
pub use scheduler::Scheduler;
pub use transform::{Transform, TransformDone, Transformer};
pub use writable::{
    BatchDispatchable, BatchEntry, Dispatchable, Done, Finalizable, Writable, WritableBuilder,
    WeakWritable, WriteCallback,
};
