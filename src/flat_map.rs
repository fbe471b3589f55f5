//! Order-preserving `map` / `flat_map` over a [`Readable`].
//!
//! Up to `concurrency` mapper futures run at once. Results are flattened into the output
//! strictly in input order, and the window only advances while the output has room.

use std::{future::Future, rc::Rc};

use futures::{stream::FuturesOrdered, StreamExt, TryFutureExt};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{
    chunk::Chunk,
    destroy::TeardownDone,
    error::StreamError,
    options::{FlatMapOptions, StreamOptions},
    readable::{Readable, WeakReadable},
};

/// What one mapper call expands to.
pub enum Mapped<U> {
    /// Exactly one output chunk.
    Scalar(Chunk<U>),
    /// Zero or more chunks, in order.
    Sequence(Vec<Chunk<U>>),
    /// Every chunk of another stream, drained to its end.
    Nested(Readable<U>),
}

impl<U> Mapped<U> {
    pub fn value(value: U) -> Self {
        Mapped::Scalar(Chunk::Value(value))
    }

    pub fn values(values: impl IntoIterator<Item = U>) -> Self {
        Mapped::Sequence(values.into_iter().map(Chunk::Value).collect())
    }

    pub fn empty() -> Self {
        Mapped::Sequence(Vec::new())
    }
}

impl<T: 'static> Readable<T> {
    /// Maps every chunk through `mapper`, one output chunk per input chunk.
    ///
    /// See [`Readable::flat_map`] for the concurrency and cancellation rules.
    pub fn map<U, F, Fut>(&self, mut mapper: F, options: FlatMapOptions) -> Result<Readable<U>, StreamError>
    where
        U: 'static,
        F: FnMut(Chunk<T>, CancellationToken) -> Fut + 'static,
        Fut: Future<Output = Result<Chunk<U>, StreamError>> + 'static,
    {
        self.flat_map(
            move |chunk, signal| mapper(chunk, signal).map_ok(Mapped::Scalar),
            options,
        )
    }

    /// Maps every chunk through `mapper` and flattens the results into one object-mode
    /// stream.
    ///
    /// Fails up front with [`StreamError::InvalidArg`] for a zero concurrency, and with
    /// [`StreamError::Aborted`] if the signal already fired; the mapper is not called in
    /// either case. Nothing is pulled from this stream until the output is read.
    ///
    /// Mapper calls receive a token that fires when the output is destroyed or the signal
    /// fires. A mapper error, an upstream error, or the signal destroys the output with
    /// that error ([`StreamError::Aborted`] for the signal) and destroys this stream.
    ///
    /// Example:
    ///
    /// ```rust
    /// use futures::{future, TryStreamExt};
    /// use sluice::{Chunk, FlatMapOptions, Mapped, Readable, Scheduler};
    ///
    /// # tokio::runtime::Runtime::new().unwrap().block_on(async {
    /// let scheduler = Scheduler::new();
    /// let words = Readable::from_values(&scheduler, vec!["a b", "c"]);
    ///
    /// let split = words
    ///     .flat_map(
    ///         |chunk: Chunk<&str>, _| {
    ///             let line = chunk.into_value().unwrap_or_default();
    ///             future::ready(Ok(Mapped::values(line.split(' '))))
    ///         },
    ///         FlatMapOptions::serial(),
    ///     )
    ///     .unwrap();
    ///
    /// let out: Vec<_> = scheduler.run_until(split.try_collect::<Vec<_>>()).await.unwrap();
    /// assert_eq!(out, vec![Chunk::Value("a"), Chunk::Value("b"), Chunk::Value("c")]);
    /// # });
    /// ```
    pub fn flat_map<U, F, Fut>(&self, mapper: F, options: FlatMapOptions) -> Result<Readable<U>, StreamError>
    where
        U: 'static,
        F: FnMut(Chunk<T>, CancellationToken) -> Fut + 'static,
        Fut: Future<Output = Result<Mapped<U>, StreamError>> + 'static,
    {
        options.validate()?;

        let token = match &options.signal {
            Some(signal) if signal.is_cancelled() => return Err(StreamError::Aborted),
            Some(signal) => signal.child_token(),
            None => CancellationToken::new(),
        };

        let demand = Rc::new(Notify::new());
        let spawner = self.scheduler().clone();
        let concurrency = options.concurrency;
        let mut pending = Some((self.clone(), mapper));

        let fill_demand = demand.clone();
        let fill_token = token.clone();
        let fill = move |output: &Readable<U>, _size: usize| {
            if let Some((upstream, mapper)) = pending.take() {
                tracing::trace!(concurrency, "starting flat_map driver");
                spawner.spawn_local(drive(
                    upstream,
                    output.downgrade(),
                    mapper,
                    Window {
                        concurrency,
                        demand: fill_demand.clone(),
                        token: fill_token.clone(),
                    },
                ));
            }
            fill_demand.notify_one();
        };

        let output = Readable::builder(self.scheduler())
            .options(StreamOptions::object().high_water_mark(options.backpressure))
            .fill(fill)
            .teardown(move |err: Option<StreamError>, done: TeardownDone| {
                token.cancel();
                done.complete(err);
            })
            .build();
        output.mark_async();

        Ok(output)
    }
}

struct Window {
    concurrency: usize,
    demand: Rc<Notify>,
    token: CancellationToken,
}

async fn drive<T, U, F, Fut>(mut upstream: Readable<T>, output: WeakReadable<U>, mut mapper: F, window: Window)
where
    T: 'static,
    U: 'static,
    F: FnMut(Chunk<T>, CancellationToken) -> Fut,
    Fut: Future<Output = Result<Mapped<U>, StreamError>>,
{
    let mut in_progress = FuturesOrdered::new();
    let mut upstream_done = false;

    let outcome = loop {
        if upstream_done && in_progress.is_empty() {
            break Ok(());
        }

        let in_progress_len = in_progress.len();
        tokio::select! {
            biased;

            _ = window.token.cancelled() => break Err(StreamError::Aborted),
            item = upstream.next(), if !upstream_done && in_progress_len < window.concurrency => {
                match item {
                    Some(Ok(chunk)) => in_progress.push_back(mapper(chunk, window.token.clone())),
                    Some(Err(err)) => break Err(err),
                    None => upstream_done = true,
                }
            },
            Some(result) = in_progress.next(), if in_progress_len > 0 => {
                if let Err(err) = emit(&output, result, &window).await {
                    break Err(err);
                }
            },
        }
    };

    match outcome {
        Ok(()) => {
            tracing::trace!("flat_map upstream exhausted");
            if let Some(output) = output.upgrade() {
                output.push_end();
            }
        }
        Err(err) => {
            tracing::debug!(error = %err, "flat_map stopped");
            window.token.cancel();
            if let Some(output) = output.upgrade() {
                output.destroy(Some(err));
            }
            upstream.destroy(None);
        }
    }
}

async fn emit<U: 'static>(
    output: &WeakReadable<U>,
    mapped: Result<Mapped<U>, StreamError>,
    window: &Window,
) -> Result<(), StreamError> {
    match mapped? {
        Mapped::Scalar(chunk) => push(output, chunk, window).await,
        Mapped::Sequence(chunks) => {
            for chunk in chunks {
                push(output, chunk, window).await?;
            }
            Ok(())
        }
        Mapped::Nested(mut nested) => {
            loop {
                let item = tokio::select! {
                    biased;
                    _ = window.token.cancelled() => return Err(StreamError::Aborted),
                    item = nested.next() => item,
                };
                match item {
                    Some(chunk) => push(output, chunk?, window).await?,
                    None => return Ok(()),
                }
            }
        }
    }
}

/// Pushes one chunk, then waits for the consumer while the output is full.
async fn push<U: 'static>(output: &WeakReadable<U>, chunk: Chunk<U>, window: &Window) -> Result<(), StreamError> {
    let has_room = {
        let Some(output) = output.upgrade() else {
            return Err(StreamError::Aborted);
        };
        if output.is_destroyed() {
            return Err(output.errored().unwrap_or(StreamError::Aborted));
        }
        output.push(chunk)
    };

    if !has_room {
        tokio::select! {
            biased;
            _ = window.token.cancelled() => return Err(StreamError::Aborted),
            _ = window.demand.notified() => {},
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        cell::{Cell, RefCell},
        time::Duration,
    };

    use futures::{future, TryStreamExt};

    use super::*;
    use crate::scheduler::Scheduler;

    fn counted<U: 'static>(
        calls: &Rc<Cell<usize>>,
        f: impl Fn(i32) -> Mapped<U> + 'static,
    ) -> impl FnMut(Chunk<i32>, CancellationToken) -> future::Ready<Result<Mapped<U>, StreamError>> {
        let calls = calls.clone();
        move |chunk, _| {
            calls.set(calls.get() + 1);
            future::ready(Ok(f(chunk.into_value().unwrap_or_default())))
        }
    }

    async fn collect<U: 'static>(scheduler: &Scheduler, readable: Readable<U>) -> Result<Vec<Chunk<U>>, StreamError> {
        scheduler.run_until(readable.try_collect::<Vec<_>>()).await
    }

    #[tokio::test]
    async fn singleton_sequences_are_the_identity() {
        let scheduler = Scheduler::new();
        let calls = Rc::new(Cell::new(0));
        let source = Readable::from_values(&scheduler, vec![1, 2, 3]);

        let out = (&source)
            .flat_map(counted(&calls, |n| Mapped::values([n])), FlatMapOptions::serial())
            .unwrap();

        assert_eq!(
            collect(&scheduler, out).await,
            Ok(vec![Chunk::Value(1), Chunk::Value(2), Chunk::Value(3)])
        );
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn empty_sequences_produce_nothing() {
        let scheduler = Scheduler::new();
        let calls = Rc::new(Cell::new(0));
        let source = Readable::from_values(&scheduler, vec![1, 2, 3]);

        let out = (&source)
            .flat_map(counted(&calls, |_| Mapped::<i32>::empty()), FlatMapOptions::serial())
            .unwrap();

        assert_eq!(collect(&scheduler, out).await, Ok(vec![]));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn already_aborted_signal_never_calls_the_mapper() {
        let scheduler = Scheduler::new();
        let calls = Rc::new(Cell::new(0));
        let source = Readable::from_values(&scheduler, vec![1, 2, 3]);
        let signal = CancellationToken::new();
        signal.cancel();

        let result = (&source).flat_map(
            counted(&calls, Mapped::value),
            FlatMapOptions::serial().signal(signal),
        );
        scheduler.run_until_idle();

        assert!(matches!(result, Err(StreamError::Aborted)));
        assert_eq!(calls.get(), 0);
        assert_eq!(source.readable_length(), 0, "nothing was pulled");
    }

    #[test]
    fn zero_concurrency_is_rejected_up_front() {
        let scheduler = Scheduler::new();
        let calls = Rc::new(Cell::new(0));
        let source = Readable::from_values(&scheduler, vec![1]);

        let result = (&source).flat_map(counted(&calls, Mapped::value), FlatMapOptions::concurrent(0));

        assert!(matches!(
            result,
            Err(StreamError::InvalidArg { name: "concurrency", .. })
        ));
        assert_eq!(calls.get(), 0);
    }

    #[tokio::test]
    async fn nested_streams_are_drained_in_order() {
        let scheduler = Scheduler::new();
        let source = Readable::from_values(&scheduler, vec![1, 2]);

        let nested_scheduler = scheduler.clone();
        let out = (&source)
            .flat_map(
                move |chunk: Chunk<i32>, _| {
                    let n = chunk.into_value().unwrap_or_default();
                    let nested = Readable::from_values(&nested_scheduler, vec![n, n * 10]);
                    future::ready(Ok(Mapped::Nested(nested)))
                },
                FlatMapOptions::concurrent(2),
            )
            .unwrap();

        assert_eq!(
            collect(&scheduler, out).await,
            Ok(vec![
                Chunk::Value(1),
                Chunk::Value(10),
                Chunk::Value(2),
                Chunk::Value(20)
            ])
        );
    }

    #[tokio::test]
    async fn concurrent_mappers_keep_input_order() {
        let scheduler = Scheduler::new();
        let source = Readable::from_values(&scheduler, vec![30u64, 20, 10]);
        let active = Rc::new(Cell::new(0));
        let peak = Rc::new(Cell::new(0));
        let started = Rc::new(RefCell::new(Vec::new()));

        let (a, p, s) = (active.clone(), peak.clone(), started.clone());
        let out = (&source)
            .map(
                move |chunk: Chunk<u64>, _| {
                    let (active, peak) = (a.clone(), p.clone());
                    let ms = chunk.into_value().unwrap_or_default();
                    s.borrow_mut().push(ms);
                    async move {
                        active.set(active.get() + 1);
                        peak.set(peak.get().max(active.get()));
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        active.set(active.get() - 1);
                        Ok(Chunk::Value(ms))
                    }
                },
                FlatMapOptions::concurrent(2),
            )
            .unwrap();

        assert_eq!(
            collect(&scheduler, out).await,
            Ok(vec![Chunk::Value(30), Chunk::Value(20), Chunk::Value(10)])
        );
        assert_eq!(peak.get(), 2);
        assert_eq!(*started.borrow(), vec![30, 20, 10]);
    }

    #[tokio::test]
    async fn mapper_error_destroys_both_ends() {
        let scheduler = Scheduler::new();
        let source = Readable::from_values(&scheduler, vec![1, 2, 3]);
        let err = StreamError::msg("unmappable");

        let e = err.clone();
        let out = (&source)
            .map(
                move |chunk: Chunk<i32>, _| {
                    let result = match chunk.into_value() {
                        Some(2) => Err(e.clone()),
                        other => Ok(Chunk::Value(other.unwrap_or_default())),
                    };
                    future::ready(result)
                },
                FlatMapOptions::serial(),
            )
            .unwrap();

        assert_eq!(collect(&scheduler, out).await, Err(err));
        scheduler.run_until_idle();
        assert!(source.is_destroyed());
    }

    #[tokio::test]
    async fn abort_while_in_flight_rejects_with_cancellation() {
        let scheduler = Scheduler::new();
        let source = Readable::from_values(&scheduler, vec![1, 2, 3]);
        let signal = CancellationToken::new();

        let mut out = (&source)
            .map(
                |chunk: Chunk<i32>, token: CancellationToken| async move {
                    if chunk.into_value() == Some(1) {
                        return Ok(Chunk::Value(1));
                    }
                    token.cancelled().await;
                    Err(StreamError::Aborted)
                },
                FlatMapOptions::serial().signal(signal.clone()),
            )
            .unwrap();

        let (first, rest) = scheduler
            .run_until(async {
                let first = out.next().await;
                signal.cancel();
                let rest = out.next().await;
                (first, rest)
            })
            .await;

        assert_eq!(first, Some(Ok(Chunk::Value(1))));
        let rest = rest.unwrap().unwrap_err();
        assert!(rest.is_cancellation());
        assert!(out.is_destroyed());
    }

    #[tokio::test]
    async fn a_full_output_stops_pulling_upstream() {
        let scheduler = Scheduler::new();
        let calls = Rc::new(Cell::new(0));
        let source = Readable::from_values(&scheduler, 0..100);

        let mut out = (&source)
            .flat_map(
                counted(&calls, Mapped::value),
                FlatMapOptions::serial().backpressure(1),
            )
            .unwrap();

        let first = scheduler.run_until(out.next()).await;
        scheduler.run_until_idle();

        assert_eq!(first, Some(Ok(Chunk::Value(0))));
        assert!(calls.get() < 10, "mapped {} chunks", calls.get());
    }
}
