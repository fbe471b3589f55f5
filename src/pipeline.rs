use std::{
    any::Any,
    future::Future,
    rc::{Rc, Weak},
};

use futures::{
    future::{self, Either},
    Stream,
};
use tokio_util::sync::CancellationToken;

use crate::{
    chunk::Chunk,
    destroy::Lifecycle,
    error::StreamError,
    events::Event,
    flat_map::Mapped,
    options::{FlatMapOptions, StreamOptions},
    readable::Readable,
    scheduler::Scheduler,
    transform::Transform,
    writable::Writable,
};

/// A `Pipeline` is the builder API for a chain of piped streams.
///
/// A Pipeline starts from a [`Readable`], an `Iterator` or a `Stream`. After constructing the
/// pipeline, transforms and mapping stages can be attached to it. Each stage is piped into the
/// next one, so backpressure travels from the last stage back to the source.
/// The chain is closed either with `.into_sink()`, which pipes it into a [`Writable`], or with
/// `.build()`, which hands back the last readable stage.
///
/// ## Teardown
/// The stages of a pipeline live and die together: when any stage errors, every other stage
/// is destroyed with the same error. A stage that closes before completing destroys the others
/// with [`StreamError::PrematureClose`].
///
/// # Example
/// ```rust
/// use futures::future;
/// use sluice::{Chunk, Done, Encoding, FlatMapOptions, Pipeline, Scheduler, StreamOptions, Writable};
/// use std::{cell::RefCell, rc::Rc};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let scheduler = Scheduler::new();
/// let seen = Rc::new(RefCell::new(Vec::new()));
/// let out = seen.clone();
/// let sink = Writable::new(&scheduler, StreamOptions::object(), move |chunk: Chunk<i32>, _: Encoding, done: Done| {
///     out.borrow_mut().extend(chunk.into_value());
///     done.ok()
/// });
///
/// let handle = Pipeline::from_iter(&scheduler, vec![1, 2, 3])
///     .map(|chunk, _| future::ready(Ok(Chunk::Value(chunk.into_value().unwrap_or(0) * 10))), FlatMapOptions::serial())
///     .unwrap()
///     .into_sink(&sink);
///
/// assert_eq!(scheduler.run_until(handle.finished()).await, Ok(()));
/// assert_eq!(*seen.borrow(), vec![10, 20, 30]);
/// # });
/// ```
pub struct Pipeline<T> {
    tail: Readable<T>,
    stages: Vec<Stage>,
}

/// One link of the chain. The handle keeps the stream alive as long as the pipeline is.
struct Stage {
    lifecycle: Rc<Lifecycle>,
    _handle: Box<dyn Any>,
}

impl Stage {
    fn new<H: Any>(lifecycle: &Rc<Lifecycle>, handle: H) -> Self {
        Self {
            lifecycle: lifecycle.clone(),
            _handle: Box::new(handle),
        }
    }
}

impl<T: 'static> From<Readable<T>> for Pipeline<T> {
    fn from(source: Readable<T>) -> Self {
        let stage = Stage::new(source.lifecycle(), source.clone());
        Pipeline {
            tail: source,
            stages: vec![stage],
        }
    }
}

impl<T: 'static> Pipeline<T> {
    /// Construct a [`Pipeline`] over plain values.
    ///
    /// # Example
    /// ```rust
    /// use futures::TryStreamExt;
    /// use sluice::{Chunk, Pipeline, Scheduler};
    ///
    /// # tokio::runtime::Runtime::new().unwrap().block_on(async {
    /// let scheduler = Scheduler::new();
    /// let (output, _handle) = Pipeline::from_iter(&scheduler, vec![1, 2, 3]).build();
    ///
    /// let out: Vec<_> = scheduler.run_until(output.try_collect::<Vec<_>>()).await.unwrap();
    /// assert_eq!(out, vec![Chunk::Value(1), Chunk::Value(2), Chunk::Value(3)]);
    /// # });
    /// ```
    #[allow(clippy::should_implement_trait)]
    pub fn from_iter<I>(scheduler: &Scheduler, iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: 'static,
    {
        Readable::from_values(scheduler, iter).into()
    }

    /// Construct a [`Pipeline`] pulling from an async stream of values. The stream is polled
    /// only while the first stage has room.
    pub fn from_stream<S>(scheduler: &Scheduler, stream: S) -> Self
    where
        S: Stream<Item = T> + 'static,
    {
        use futures::StreamExt;

        let chunks = stream.map(|value| Ok(Chunk::Value(value)));
        Readable::from_stream(scheduler, chunks, StreamOptions::object()).into()
    }

    /// Attach a [`Transform`] stage. The current tail is piped into its writable side and its
    /// readable side becomes the new tail.
    pub fn through<U: 'static>(mut self, transform: &Transform<T, U>) -> Pipeline<U>
    where
        T: Clone,
    {
        self.tail.pipe(transform.writable());
        self.stages
            .push(Stage::new(transform.readable().lifecycle(), transform.clone()));

        Pipeline {
            tail: transform.readable().clone(),
            stages: self.stages,
        }
    }

    /// Attach a mapping stage. See [`Readable::map`] for the options.
    pub fn map<U, F, Fut>(self, mapper: F, options: FlatMapOptions) -> Result<Pipeline<U>, StreamError>
    where
        U: 'static,
        F: FnMut(Chunk<T>, CancellationToken) -> Fut + 'static,
        Fut: Future<Output = Result<Chunk<U>, StreamError>> + 'static,
    {
        let mapped = self.tail.map(mapper, options)?;
        Ok(self.push_readable(mapped))
    }

    /// Attach a flattening stage. See [`Readable::flat_map`] for the options.
    ///
    /// # Example
    /// ```rust
    /// use futures::{future, TryStreamExt};
    /// use sluice::{Chunk, FlatMapOptions, Mapped, Pipeline, Scheduler};
    ///
    /// # tokio::runtime::Runtime::new().unwrap().block_on(async {
    /// let scheduler = Scheduler::new();
    /// let (output, _handle) = Pipeline::from_iter(&scheduler, vec![1, 2])
    ///     .flat_map(
    ///         |chunk, _| {
    ///             let n = chunk.into_value().unwrap_or(0);
    ///             future::ready(Ok(Mapped::values(vec![n, -n])))
    ///         },
    ///         FlatMapOptions::concurrent(2),
    ///     )
    ///     .unwrap()
    ///     .build();
    ///
    /// let out: Vec<_> = scheduler.run_until(output.try_collect::<Vec<_>>()).await.unwrap();
    /// assert_eq!(out, vec![Chunk::Value(1), Chunk::Value(-1), Chunk::Value(2), Chunk::Value(-2)]);
    /// # });
    /// ```
    pub fn flat_map<U, F, Fut>(self, mapper: F, options: FlatMapOptions) -> Result<Pipeline<U>, StreamError>
    where
        U: 'static,
        F: FnMut(Chunk<T>, CancellationToken) -> Fut + 'static,
        Fut: Future<Output = Result<Mapped<U>, StreamError>> + 'static,
    {
        let mapped = self.tail.flat_map(mapper, options)?;
        Ok(self.push_readable(mapped))
    }

    fn push_readable<U: 'static>(mut self, readable: Readable<U>) -> Pipeline<U> {
        self.stages
            .push(Stage::new(readable.lifecycle(), readable.clone()));
        Pipeline {
            tail: readable,
            stages: self.stages,
        }
    }

    /// Pipe the chain into `sink`. The returned handle resolves once the sink finishes.
    pub fn into_sink(mut self, sink: &Writable<T>) -> PipelineHandle
    where
        T: Clone,
    {
        self.tail.pipe(sink);
        self.stages.push(Stage::new(sink.lifecycle(), sink.clone()));

        link(&self.stages);
        PipelineHandle {
            stages: self.stages,
            done: (Lifecycle::is_finished, Event::Finish),
        }
    }

    /// Close the chain without a sink. Returns the last readable stage and a handle that
    /// resolves once that stage ends.
    pub fn build(self) -> (Readable<T>, PipelineHandle) {
        link(&self.stages);
        let handle = PipelineHandle {
            stages: self.stages,
            done: (Lifecycle::end_emitted, Event::End),
        };
        (self.tail, handle)
    }
}

/// Destroys every other stage when one of them errors or closes early.
fn link(stages: &[Stage]) {
    let all: Rc<[Weak<Lifecycle>]> = stages
        .iter()
        .map(|stage| Rc::downgrade(&stage.lifecycle))
        .collect();

    for (idx, stage) in stages.iter().enumerate() {
        let all = all.clone();
        let this = Rc::downgrade(&stage.lifecycle);
        stage.lifecycle.on(Rc::new(move |event: &Event| {
            let err = match event {
                Event::Error(err) => err.clone(),
                Event::Close if this.upgrade().is_some_and(|stage| !stage.completed()) => {
                    StreamError::PrematureClose
                }
                _ => return,
            };

            tracing::debug!(stage = idx, error = %err, "tearing down pipeline");
            for (other, weak) in all.iter().enumerate() {
                if other == idx {
                    continue;
                }
                if let Some(lifecycle) = weak.upgrade() {
                    lifecycle.destroy(Some(err.clone()));
                }
            }
        }));
    }
}

/// Keeps the stages of a built [`Pipeline`] alive and reports how it ended.
#[must_use = "the pipeline stages are dropped with the handle"]
pub struct PipelineHandle {
    stages: Vec<Stage>,
    done: (fn(&Lifecycle) -> bool, Event),
}

impl PipelineHandle {
    /// Resolves with `Ok(())` when the last stage completes, or with the error that tore the
    /// pipeline down.
    pub fn finished(&self) -> impl Future<Output = Result<(), StreamError>> {
        let (is_done, event) = self.done.clone();
        match self.stages.last() {
            Some(stage) => Either::Left(stage.lifecycle.completion(is_done, event)),
            None => Either::Right(future::ready(Ok(()))),
        }
    }

    /// Destroys every stage.
    pub fn destroy(&self, err: Option<StreamError>) {
        for stage in &self.stages {
            stage.lifecycle.destroy(err.clone());
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.stages
            .iter()
            .all(|stage| stage.lifecycle.is_destroyed())
    }
}
