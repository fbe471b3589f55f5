//! A writable half feeding a readable half through a user transformation.
//!
//! Both halves share one lifecycle: destroying either destroys the pair, and `Close` is
//! emitted once. A write is only acknowledged while the output buffer has room, so a slow
//! consumer of the readable half throttles producers of the writable half.

use std::{
    cell::{OnceCell, RefCell},
    future::Future,
    rc::Rc,
};

use futures::{future, TryFutureExt};

use crate::{
    chunk::{Chunk, Encoding},
    destroy::{DisposeGuard, Lifecycle, TeardownDone, Teardownable},
    error::StreamError,
    events::{Event, ListenerId},
    options::TransformOptions,
    readable::Readable,
    scheduler::Scheduler,
    writable::{Done, Hooks, WeakWritable, Writable},
};

/// Turns input chunks into output chunks.
///
/// `transform` may push any number of outputs through [`TransformDone::push`] before
/// completing. `flush` runs once after the last input, before the output ends.
pub trait Transformer<T, U: 'static> {
    fn transform(&mut self, chunk: Chunk<T>, encoding: Encoding, done: TransformDone<U>);

    fn flush(&mut self, done: TransformDone<U>) {
        done.ok()
    }
}

impl<T, U: 'static, F> Transformer<T, U> for F
where
    F: FnMut(Chunk<T>, Encoding, TransformDone<U>),
{
    fn transform(&mut self, chunk: Chunk<T>, encoding: Encoding, done: TransformDone<U>) {
        self(chunk, encoding, done)
    }
}

type Parked = Rc<RefCell<Option<Done>>>;

/// Wraps `hook` so a write acknowledgement held back by a full output fails with the
/// destroy error on a later turn. The writable half can then fail its queue.
fn release_on_teardown(
    parked: Parked,
    scheduler: Scheduler,
    hook: Option<Box<dyn Teardownable>>,
) -> impl Teardownable {
    move |err: Option<StreamError>, done: TeardownDone| {
        let held = parked.borrow_mut().take();
        if let Some(write) = held {
            let reason = err.clone().unwrap_or(StreamError::Destroyed("write"));
            scheduler.defer(move || write.fail(reason));
        }
        match hook {
            Some(hook) => hook.teardown(err, done),
            None => done.complete(err),
        }
    }
}

enum Completion {
    Write {
        done: Done,
        parked: Parked,
        input_ending: Rc<dyn Fn() -> bool>,
        length_before: usize,
    },
    Flush {
        done: Done,
    },
}

/// Completion token for one [`Transformer`] call.
pub struct TransformDone<U> {
    output: Readable<U>,
    completion: Completion,
}

impl<U: 'static> TransformDone<U> {
    /// Adds a chunk to the output. Returns `false` while the output is over its threshold.
    pub fn push(&self, chunk: impl Into<Chunk<U>>) -> bool {
        self.output.push(chunk)
    }

    /// Completes the call, pushing `Some` output first.
    pub fn complete(self, result: Result<Option<Chunk<U>>, StreamError>) {
        let output = self.output;
        match (self.completion, result) {
            (Completion::Write { done, .. } | Completion::Flush { done }, Err(err)) => {
                done.fail(err)
            }
            (
                Completion::Write {
                    done,
                    parked,
                    input_ending,
                    length_before,
                },
                Ok(chunk),
            ) => {
                if let Some(chunk) = chunk {
                    output.push(chunk);
                }
                let length = output.readable_length();
                if input_ending() || length == length_before || length < output.high_water_mark() {
                    done.ok();
                } else {
                    tracing::trace!(length, "output full, holding write acknowledgement");
                    *parked.borrow_mut() = Some(done);
                }
            }
            (Completion::Flush { done }, Ok(chunk)) => {
                if let Some(chunk) = chunk {
                    output.push(chunk);
                }
                output.push_end();
                done.ok();
            }
        }
    }

    pub fn ok(self) {
        self.complete(Ok(None))
    }

    pub fn complete_with(self, chunk: impl Into<Chunk<U>>) {
        self.complete(Ok(Some(chunk.into())))
    }

    pub fn fail(self, err: StreamError) {
        self.complete(Err(err))
    }
}

/// A transform stage. Write into [`Transform::writable`], read from [`Transform::readable`].
///
/// Example:
///
/// ```rust
/// use sluice::{Chunk, Encoding, Scheduler, Transform, TransformDone, TransformOptions};
///
/// let scheduler = Scheduler::new();
/// let doubler = Transform::new(
///     &scheduler,
///     TransformOptions::object(),
///     |chunk: Chunk<i32>, _: Encoding, done: TransformDone<i32>| match chunk.into_value() {
///         Some(n) => done.complete_with(Chunk::Value(n * 2)),
///         None => done.ok(),
///     },
/// );
///
/// doubler.write(Chunk::Value(21)).unwrap();
/// doubler.end();
/// scheduler.run_until_idle();
///
/// assert_eq!(doubler.read(None), Some(Chunk::Value(42)));
/// ```
pub struct Transform<T, U> {
    writable: Writable<T>,
    readable: Readable<U>,
    parked: Parked,
}

impl<T, U> Clone for Transform<T, U> {
    fn clone(&self) -> Self {
        Self {
            writable: self.writable.clone(),
            readable: self.readable.clone(),
            parked: self.parked.clone(),
        }
    }
}

impl<T: 'static, U: 'static> Transform<T, U> {
    pub fn new(
        scheduler: &Scheduler,
        options: TransformOptions,
        transformer: impl Transformer<T, U> + 'static,
    ) -> Self {
        let lifecycle = Lifecycle::new(
            scheduler.clone(),
            options.readable.auto_destroy && options.writable.auto_destroy,
            options.readable.emit_close && options.writable.emit_close,
        );

        let parked: Parked = Rc::new(RefCell::new(None));
        let input: Rc<OnceCell<WeakWritable<T>>> = Rc::new(OnceCell::new());

        let release = parked.clone();
        let fill = move |_: &Readable<U>, _size: usize| {
            let parked = release.borrow_mut().take();
            if let Some(done) = parked {
                done.ok();
            }
        };
        let readable = Readable::with_lifecycle(lifecycle.clone(), &options.readable, Some(Box::new(fill)));
        readable.mark_async();

        let transformer: Rc<RefCell<dyn Transformer<T, U>>> = Rc::new(RefCell::new(transformer));

        let input_ending: Rc<dyn Fn() -> bool> = {
            let input = input.clone();
            Rc::new(move || {
                input
                    .get()
                    .and_then(WeakWritable::upgrade)
                    .map_or(true, |writable| writable.is_ending())
            })
        };

        let output = readable.clone();
        let stage = transformer.clone();
        let held = parked.clone();
        let dispatch = move |chunk: Chunk<T>, encoding: Encoding, done: Done| {
            let done = TransformDone {
                output: output.clone(),
                completion: Completion::Write {
                    done,
                    parked: held.clone(),
                    input_ending: input_ending.clone(),
                    length_before: output.readable_length(),
                },
            };
            stage.borrow_mut().transform(chunk, encoding, done);
        };

        let output = readable.clone();
        let finalize = move |done: Done| {
            tracing::trace!("flush");
            let done = TransformDone {
                output,
                completion: Completion::Flush { done },
            };
            transformer.borrow_mut().flush(done);
        };

        lifecycle.set_teardown(Box::new(release_on_teardown(parked.clone(), scheduler.clone(), None)));
        let writable = Writable::with_lifecycle(
            lifecycle,
            &options.writable,
            Hooks {
                dispatch: Some(Box::new(dispatch)),
                batch: None,
                finalize: Some(Box::new(finalize)),
            },
        );
        let _ = input.set(writable.downgrade());

        Self {
            writable,
            readable,
            parked,
        }
    }

    /// Installs the hook that releases resources when the stage is destroyed.
    pub fn teardown(self, hook: impl Teardownable + 'static) -> Self {
        let hook = release_on_teardown(self.parked.clone(), self.scheduler().clone(), Some(Box::new(hook)));
        self.lifecycle().set_teardown(Box::new(hook));
        self
    }

    fn lifecycle(&self) -> &Rc<Lifecycle> {
        self.writable.lifecycle()
    }

    pub fn writable(&self) -> &Writable<T> {
        &self.writable
    }

    pub fn readable(&self) -> &Readable<U> {
        &self.readable
    }

    pub fn scheduler(&self) -> &Scheduler {
        self.writable.scheduler()
    }

    pub fn write(&self, chunk: impl Into<Chunk<T>>) -> Result<bool, StreamError> {
        self.writable.write(chunk)
    }

    pub fn end(&self) {
        self.writable.end()
    }

    pub fn read(&self, n: Option<usize>) -> Option<Chunk<U>> {
        self.readable.read(n)
    }

    pub fn on(&self, listener: impl Fn(&Event) + 'static) -> ListenerId {
        self.lifecycle().on(Rc::new(listener))
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.lifecycle().off(id)
    }

    pub fn is_destroyed(&self) -> bool {
        self.lifecycle().is_destroyed()
    }

    pub fn destroy(&self, err: Option<StreamError>) {
        self.lifecycle().destroy(err);
    }

    pub fn try_destroy(&self, err: Option<StreamError>) -> Result<(), StreamError> {
        self.lifecycle().try_destroy(err)
    }

    pub fn scoped(&self) -> DisposeGuard {
        DisposeGuard::new(self.lifecycle().clone())
    }

    pub fn closed(&self) -> impl Future<Output = Result<(), StreamError>> {
        self.lifecycle().closed()
    }

    /// Resolves once the input finished and the output ended.
    pub fn finished(&self) -> impl Future<Output = Result<(), StreamError>> {
        future::try_join(self.writable.finished(), self.readable.finished()).map_ok(|_| ())
    }
}

impl<T: 'static> Transform<T, T> {
    /// Forwards every chunk unchanged.
    pub fn pass_through(scheduler: &Scheduler, options: TransformOptions) -> Self {
        Transform::new(
            scheduler,
            options,
            |chunk: Chunk<T>, _: Encoding, done: TransformDone<T>| done.complete_with(chunk),
        )
    }
}
