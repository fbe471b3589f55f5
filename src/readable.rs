//! Pull-based source with a bounded buffer.
//!
//! A [`Readable`] asks its producer for data through the [`Fillable`] hook whenever the
//! buffer drops below the high-water mark, and hands data out either on demand (`read`) or,
//! once resumed, to every data listener in order. Nothing a producer does is observed by a
//! consumer on the same turn: availability, end-of-data and flowing delivery are all
//! deferred through the stream's [`Scheduler`].

use std::{
    cell::{Cell, RefCell},
    future::Future,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll, Waker},
};

use futures::{stream::LocalBoxStream, Stream, StreamExt};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{
    chunk::{Chunk, Encoding, TextDecoder},
    chunk_store::ChunkStore,
    destroy::{Constructable, DisposeGuard, Half, Lifecycle, TeardownDone, Teardownable},
    error::StreamError,
    events::{Event, ListenerId, Listeners},
    options::StreamOptions,
    scheduler::Scheduler,
    writable::{WeakWritable, Writable},
};

/// Largest high-water mark `read(n)` may raise the threshold to.
pub const MAX_HIGH_WATER_MARK: usize = 1 << 30;

/// Producer side of a [`Readable`].
///
/// Called with the current high-water mark as an advisory size whenever the stream wants
/// more data. The hook answers by calling [`Readable::push`] (now or later) and signals
/// end-of-data with [`Readable::push_end`]. It is not called again until it has pushed.
pub trait Fillable<T> {
    fn fill(&mut self, stream: &Readable<T>, size: usize);
}

impl<T, F> Fillable<T> for F
where
    F: FnMut(&Readable<T>, usize),
{
    fn fill(&mut self, stream: &Readable<T>, size: usize) {
        self(stream, size)
    }
}

/// Handle to a readable stream. Clones share the stream.
pub struct Readable<T> {
    inner: Rc<Inner<T>>,
}

impl<T> Clone for Readable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Non-owning handle, for hooks that must not keep their own stream alive.
pub struct WeakReadable<T> {
    inner: Weak<Inner<T>>,
}

impl<T> Clone for WeakReadable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> WeakReadable<T> {
    pub fn upgrade(&self) -> Option<Readable<T>> {
        self.inner.upgrade().map(|inner| Readable { inner })
    }
}

struct Inner<T> {
    lifecycle: Rc<Lifecycle>,
    state: RefCell<State<T>>,
    data: Listeners<Chunk<T>>,
    fill: RefCell<Option<Box<dyn Fillable<T>>>>,
    waker: RefCell<Option<Waker>>,
    pipes: RefCell<Vec<PipeLink<T>>>,
}

/// Listeners installed by one `pipe` call, removed together by `unpipe`.
struct PipeLink<T> {
    dest: WeakWritable<T>,
    data: ListenerId,
    end: ListenerId,
    drain: ListenerId,
    unpipe: ListenerId,
}

struct State<T> {
    store: ChunkStore<T>,
    /// Buffered units: bytes, chars when decoding, chunks in object mode.
    length: usize,
    high_water_mark: usize,
    object_mode: bool,
    decoder: Option<TextDecoder>,
    /// `None` until the consumer picks a mode.
    flowing: Option<bool>,
    paused: bool,
    ended: bool,
    end_emitted: bool,
    reading: bool,
    /// Set while the fill hook runs, so pushes made inside it defer their effects.
    sync: bool,
    need_readable: bool,
    emitted_readable: bool,
    reading_more: bool,
    resume_scheduled: bool,
    data_emitted: bool,
    terminal_yielded: bool,
}

impl<T> State<T> {
    fn new(options: &StreamOptions) -> Self {
        Self {
            store: ChunkStore::new(),
            length: 0,
            high_water_mark: options.effective_high_water_mark(),
            object_mode: options.object_mode,
            decoder: if options.object_mode {
                None
            } else {
                options.encoding.map(TextDecoder::new)
            },
            flowing: None,
            paused: false,
            ended: false,
            end_emitted: false,
            reading: false,
            sync: true,
            need_readable: false,
            emitted_readable: false,
            reading_more: false,
            resume_scheduled: false,
            data_emitted: false,
            terminal_yielded: false,
        }
    }

    fn can_push_more(&self) -> bool {
        !self.ended && (self.length < self.high_water_mark || self.length == 0)
    }

    fn how_much_to_read(&self, n: Option<usize>) -> usize {
        if n == Some(0) || (self.length == 0 && self.ended) {
            return 0;
        }
        if self.object_mode {
            return 1;
        }
        match n {
            None if self.flowing == Some(true) && self.length > 0 => {
                self.store.first().map(Chunk::units).unwrap_or(0)
            }
            None => self.length,
            Some(n) if n <= self.length => n,
            Some(_) if self.ended => self.length,
            Some(_) => 0,
        }
    }

    /// Takes `n` units off the buffer. The caller adjusts `length`.
    fn take(&mut self, n: usize) -> Option<Chunk<T>> {
        if self.length == 0 {
            return None;
        }
        if self.object_mode {
            return self.store.shift();
        }

        let label = self.decoder.as_ref().map(TextDecoder::encoding);
        let chunk = if n >= self.length {
            let chunk = if self.store.len() == 1 {
                self.store.shift()
            } else if label.is_some() {
                Some(Chunk::text(self.store.join("")))
            } else {
                Some(Chunk::Bytes(self.store.concat(self.length)))
            };
            self.store.clear();
            chunk
        } else {
            self.store.consume(n, label.is_some())
        };

        match (chunk, label) {
            (Some(Chunk::Text { text, .. }), Some(encoding)) => Some(Chunk::Text { text, encoding }),
            (chunk, _) => chunk,
        }
    }
}

/// Next power of two at or above `n`, refusing anything above [`MAX_HIGH_WATER_MARK`].
fn compute_new_high_water_mark(n: usize) -> Result<usize, StreamError> {
    if n > MAX_HIGH_WATER_MARK {
        return Err(StreamError::OutOfRange {
            name: "size",
            range: "<= 1GiB",
            received: n,
        });
    }
    Ok(n.next_power_of_two())
}

/// Configures a [`Readable`] before it is created.
pub struct ReadableBuilder<T> {
    scheduler: Scheduler,
    options: StreamOptions,
    fill: Option<Box<dyn Fillable<T>>>,
    construct: Option<Box<dyn Constructable>>,
    teardown: Option<Box<dyn Teardownable>>,
}

impl<T: 'static> ReadableBuilder<T> {
    pub fn options(self, options: StreamOptions) -> Self {
        Self { options, ..self }
    }

    pub fn fill(self, hook: impl Fillable<T> + 'static) -> Self {
        Self {
            fill: Some(Box::new(hook)),
            ..self
        }
    }

    /// Holds back `fill` until the hook completes its [`Done`](crate::Done).
    pub fn construct(self, hook: impl Constructable + 'static) -> Self {
        Self {
            construct: Some(Box::new(hook)),
            ..self
        }
    }

    pub fn teardown(self, hook: impl Teardownable + 'static) -> Self {
        Self {
            teardown: Some(Box::new(hook)),
            ..self
        }
    }

    pub fn build(self) -> Readable<T> {
        let lifecycle = Lifecycle::new(
            self.scheduler,
            self.options.auto_destroy,
            self.options.emit_close,
        );
        if let Some(teardown) = self.teardown {
            lifecycle.set_teardown(teardown);
        }
        if let Some(construct) = self.construct {
            lifecycle.construct(construct);
        }
        Readable::with_lifecycle(lifecycle, &self.options, self.fill)
    }
}

impl<T: 'static> Readable<T> {
    pub fn builder(scheduler: &Scheduler) -> ReadableBuilder<T> {
        ReadableBuilder {
            scheduler: scheduler.clone(),
            options: StreamOptions::default(),
            fill: None,
            construct: None,
            teardown: None,
        }
    }

    pub fn new(scheduler: &Scheduler, options: StreamOptions, fill: impl Fillable<T> + 'static) -> Self {
        Self::builder(scheduler).options(options).fill(fill).build()
    }

    /// A readable half that shares `lifecycle` with other halves.
    pub(crate) fn with_lifecycle(
        lifecycle: Rc<Lifecycle>,
        options: &StreamOptions,
        fill: Option<Box<dyn Fillable<T>>>,
    ) -> Self {
        let inner = Rc::new(Inner {
            lifecycle: lifecycle.clone(),
            state: RefCell::new(State::new(options)),
            data: Listeners::default(),
            fill: RefCell::new(fill),
            waker: RefCell::new(None),
            pipes: RefCell::new(Vec::new()),
        });
        let weak = Rc::downgrade(&inner);
        let half: Weak<dyn Half> = weak;
        lifecycle.attach_readable(half);
        Self { inner }
    }

    /// A readable that pushes every item of `iter`, then ends.
    pub fn from_iter<I>(scheduler: &Scheduler, iter: I, options: StreamOptions) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Chunk<T>>,
        I::IntoIter: 'static,
    {
        let mut iter = iter.into_iter();
        Self::new(scheduler, options, move |stream: &Readable<T>, _size: usize| loop {
            match iter.next() {
                Some(chunk) => {
                    if !stream.push(chunk) {
                        break;
                    }
                }
                None => {
                    stream.push_end();
                    break;
                }
            }
        })
    }

    /// An object-mode readable over plain values.
    pub fn from_values<I>(scheduler: &Scheduler, values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: 'static,
    {
        Self::from_iter(
            scheduler,
            values.into_iter().map(Chunk::Value),
            StreamOptions::object(),
        )
    }

    /// A readable fed by an async stream, pulled only while the buffer has room.
    pub fn from_stream<S>(scheduler: &Scheduler, stream: S, options: StreamOptions) -> Self
    where
        S: Stream<Item = Result<Chunk<T>, StreamError>> + 'static,
    {
        let demand = Rc::new(Notify::new());
        let cancel = CancellationToken::new();
        let spawner = scheduler.clone();
        let mut source = Some(stream.boxed_local());

        let fill_demand = demand.clone();
        let fill_cancel = cancel.clone();
        let fill = move |readable: &Readable<T>, _size: usize| {
            if let Some(source) = source.take() {
                spawner.spawn_local(pump_source(
                    source,
                    readable.downgrade(),
                    fill_demand.clone(),
                    fill_cancel.clone(),
                ));
            }
            fill_demand.notify_one();
        };

        Self::builder(scheduler)
            .options(options)
            .fill(fill)
            .teardown(move |err: Option<StreamError>, done: TeardownDone| {
                cancel.cancel();
                done.complete(err);
            })
            .build()
    }

    pub fn downgrade(&self) -> WeakReadable<T> {
        WeakReadable {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        self.inner.lifecycle.scheduler()
    }

    pub(crate) fn lifecycle(&self) -> &Rc<Lifecycle> {
        &self.inner.lifecycle
    }

    /// For halves fed from outside any fill call: end-of-data then always takes the
    /// deferred path.
    pub(crate) fn mark_async(&self) {
        self.inner.state.borrow_mut().sync = false;
    }

    /// Buffered units.
    pub fn readable_length(&self) -> usize {
        self.inner.state.borrow().length
    }

    pub fn high_water_mark(&self) -> usize {
        self.inner.state.borrow().high_water_mark
    }

    pub fn is_object_mode(&self) -> bool {
        self.inner.state.borrow().object_mode
    }

    /// `None` until the consumer either resumed or paused the stream.
    pub fn flowing(&self) -> Option<bool> {
        self.inner.state.borrow().flowing
    }

    pub fn is_paused(&self) -> bool {
        let st = self.inner.state.borrow();
        st.paused || st.flowing == Some(false)
    }

    /// End-of-data was delivered to consumers.
    pub fn is_ended(&self) -> bool {
        self.inner.state.borrow().end_emitted
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.lifecycle.is_destroyed()
    }

    pub fn errored(&self) -> Option<StreamError> {
        self.inner.lifecycle.errored()
    }

    /// Whether any data was ever handed to a consumer.
    pub fn data_emitted(&self) -> bool {
        self.inner.state.borrow().data_emitted
    }

    /// Buffers `chunk`. Returns `false` once the buffer reached the high-water mark, or when
    /// the stream can no longer accept data.
    pub fn push(&self, chunk: impl Into<Chunk<T>>) -> bool {
        self.add_chunk(Some(chunk.into()), false)
    }

    /// Signals end-of-data. Buffered chunks stay readable.
    pub fn push_end(&self) -> bool {
        self.add_chunk(None, false)
    }

    /// Puts `chunk` back at the front of the buffer.
    pub fn unshift(&self, chunk: impl Into<Chunk<T>>) -> bool {
        self.add_chunk(Some(chunk.into()), true)
    }

    fn add_chunk(&self, chunk: Option<Chunk<T>>, add_to_front: bool) -> bool {
        let lifecycle = &self.inner.lifecycle;

        let Some(chunk) = chunk else {
            tracing::trace!("push end of data");
            self.inner.state.borrow_mut().reading = false;
            self.on_eof_chunk();
            return false;
        };

        let mut st = self.inner.state.borrow_mut();

        let chunk = if st.object_mode {
            chunk
        } else {
            match normalize(chunk, st.decoder.as_ref().map(TextDecoder::encoding)) {
                Ok(chunk) => chunk,
                Err(err) => {
                    drop(st);
                    lifecycle.error_or_destroy(err);
                    return false;
                }
            }
        };

        if !st.object_mode && chunk.is_empty() {
            st.reading = false;
            let more = st.can_push_more();
            drop(st);
            self.maybe_read_more();
            return more;
        }

        if add_to_front {
            if st.end_emitted {
                drop(st);
                lifecycle.error_or_destroy(StreamError::UnshiftAfterEnd);
                return false;
            }
        } else if st.ended {
            drop(st);
            lifecycle.error_or_destroy(StreamError::PushAfterEof);
            return false;
        }

        if lifecycle.is_destroyed() || lifecycle.is_errored() {
            return false;
        }

        let chunk = match (&mut st.decoder, chunk) {
            (Some(decoder), Chunk::Bytes(bytes)) => {
                let text = if add_to_front {
                    decoder.encoding().decode(&bytes)
                } else {
                    decoder.write(&bytes)
                };
                Chunk::Text {
                    text,
                    encoding: decoder.encoding(),
                }
            }
            (_, chunk) => chunk,
        };

        if !add_to_front {
            st.reading = false;
        }

        if !st.object_mode && chunk.is_empty() {
            let more = st.can_push_more();
            drop(st);
            self.maybe_read_more();
            return more;
        }

        st.length += if st.object_mode { 1 } else { chunk.units() };
        if add_to_front {
            st.store.unshift(chunk);
        } else {
            st.store.push(chunk);
        }
        tracing::trace!(length = st.length, add_to_front, "buffered chunk");

        let need_readable = st.need_readable;
        let more = st.can_push_more();
        drop(st);

        if need_readable {
            self.emit_readable();
        }
        self.maybe_read_more();
        more
    }

    fn on_eof_chunk(&self) {
        let mut st = self.inner.state.borrow_mut();
        if st.ended {
            return;
        }

        if let Some(decoder) = &mut st.decoder {
            let encoding = decoder.encoding();
            let tail = decoder.end();
            if !tail.is_empty() {
                st.length += tail.chars().count();
                st.store.push(Chunk::Text {
                    text: tail,
                    encoding,
                });
            }
        }
        st.ended = true;

        if st.sync {
            drop(st);
            self.emit_readable();
        } else {
            st.need_readable = false;
            st.emitted_readable = true;
            drop(st);
            let this = self.clone();
            self.scheduler().defer(move || this.emit_readable_now());
        }
    }

    /// Schedules a `Readable` notification (or a flowing delivery) for the next turn.
    fn emit_readable(&self) {
        let mut st = self.inner.state.borrow_mut();
        st.need_readable = false;
        if st.emitted_readable {
            return;
        }
        st.emitted_readable = true;
        drop(st);

        let this = self.clone();
        self.scheduler().defer(move || this.emit_readable_now());
    }

    fn emit_readable_now(&self) {
        let lifecycle = &self.inner.lifecycle;
        let st = self.inner.state.borrow();
        let available = !lifecycle.is_destroyed()
            && !lifecycle.is_errored()
            && (st.length > 0 || st.ended);
        let flowing = st.flowing == Some(true);
        drop(st);

        if available {
            if !flowing {
                lifecycle.emit(Event::Readable);
            }
            self.inner.state.borrow_mut().emitted_readable = false;
        }

        {
            let mut st = self.inner.state.borrow_mut();
            st.need_readable =
                st.flowing != Some(true) && !st.ended && st.length <= st.high_water_mark;
        }

        self.inner.wake();
        self.flow();
    }

    fn maybe_read_more(&self) {
        let mut st = self.inner.state.borrow_mut();
        if st.reading_more {
            return;
        }
        st.reading_more = true;
        drop(st);

        let this = self.clone();
        self.scheduler().defer(move || this.maybe_read_more_now());
    }

    /// Keeps asking the producer for data while the buffer is below the threshold.
    fn maybe_read_more_now(&self) {
        loop {
            let before = {
                let st = self.inner.state.borrow();
                let wants_more = !st.reading
                    && !st.ended
                    && (st.length < st.high_water_mark
                        || (st.flowing == Some(true) && st.length == 0));
                if !wants_more {
                    break;
                }
                st.length
            };

            self.read(Some(0));

            if before == self.inner.state.borrow().length {
                break;
            }
        }
        self.inner.state.borrow_mut().reading_more = false;
    }

    /// Takes data from the buffer.
    ///
    /// `None` asks for everything buffered (one chunk in object mode, or the head chunk while
    /// flowing). `Some(n)` asks for exactly `n` units and returns nothing until that many are
    /// buffered, unless the stream ended. `Some(0)` only triggers a refill. Returned data is
    /// also delivered to data listeners.
    pub fn read(&self, n: Option<usize>) -> Option<Chunk<T>> {
        let lifecycle = self.inner.lifecycle.clone();

        if let Some(n) = n {
            let mut st = self.inner.state.borrow_mut();
            if n > st.high_water_mark {
                match compute_new_high_water_mark(n) {
                    Ok(hwm) => st.high_water_mark = hwm,
                    Err(err) => {
                        drop(st);
                        lifecycle.error_or_destroy(err);
                        return None;
                    }
                }
            }
        }

        let mut st = self.inner.state.borrow_mut();
        if n != Some(0) {
            st.emitted_readable = false;
        }

        if n == Some(0) && st.need_readable {
            let enough = if st.high_water_mark != 0 {
                st.length >= st.high_water_mark
            } else {
                st.length > 0
            };
            if enough || st.ended {
                let finished = st.length == 0 && st.ended;
                drop(st);
                if finished {
                    self.end_readable();
                } else {
                    self.emit_readable();
                }
                return None;
            }
        }

        let mut to_read = st.how_much_to_read(n);

        if to_read == 0 && st.ended {
            let empty = st.length == 0;
            drop(st);
            if empty {
                self.end_readable();
            }
            return None;
        }

        let do_read = (st.need_readable
            || st.length == 0
            || st.length - to_read < st.high_water_mark)
            && !st.reading
            && !st.ended
            && lifecycle.is_constructed()
            && !lifecycle.is_destroyed()
            && !lifecycle.is_errored();

        if do_read {
            st.reading = true;
            st.sync = true;
            if st.length == 0 {
                st.need_readable = true;
            }
            let size = st.high_water_mark;
            drop(st);

            self.call_fill(size);

            st = self.inner.state.borrow_mut();
            st.sync = false;
            if !st.reading {
                to_read = st.how_much_to_read(n);
            }
        }

        let ret = if to_read > 0 { st.take(to_read) } else { None };

        if ret.is_none() {
            st.need_readable = st.length <= st.high_water_mark;
            to_read = 0;
        } else {
            st.length = st.length.saturating_sub(to_read);
        }

        let mut end_now = false;
        if st.length == 0 {
            if !st.ended {
                st.need_readable = true;
            }
            if n != Some(to_read) && st.ended {
                end_now = true;
            }
        }

        let deliver = ret.is_some() && !lifecycle.error_emitted() && !lifecycle.close_emitted();
        if deliver {
            st.data_emitted = true;
        }
        drop(st);

        if end_now {
            self.end_readable();
        }

        if deliver {
            if let Some(chunk) = &ret {
                tracing::trace!(units = to_read, "deliver chunk");
                self.inner.data.emit(chunk);
            }
        }

        ret
    }

    fn call_fill(&self, size: usize) {
        let hook = self.inner.fill.borrow_mut().take();
        let Some(mut hook) = hook else {
            return;
        };

        tracing::trace!(size, "fill");
        hook.fill(self, size);

        let mut slot = self.inner.fill.borrow_mut();
        if slot.is_none() {
            *slot = Some(hook);
        }
    }

    fn end_readable(&self) {
        let mut st = self.inner.state.borrow_mut();
        if st.end_emitted {
            return;
        }
        st.ended = true;
        drop(st);

        let this = self.clone();
        self.scheduler().defer(move || this.end_readable_now());
    }

    fn end_readable_now(&self) {
        let lifecycle = &self.inner.lifecycle;
        let mut st = self.inner.state.borrow_mut();
        let can_end = !lifecycle.is_errored()
            && !lifecycle.close_emitted()
            && !lifecycle.is_destroyed()
            && !st.end_emitted
            && st.length == 0;
        if !can_end {
            return;
        }
        st.end_emitted = true;
        drop(st);

        tracing::debug!("end of data");
        lifecycle.mark_end_emitted();
        lifecycle.emit(Event::End);
        self.inner.wake();
        lifecycle.maybe_auto_destroy();
    }

    fn flow(&self) {
        while self.inner.state.borrow().flowing == Some(true) {
            if self.read(None).is_none() {
                break;
            }
        }
    }

    /// Switches to flowing mode: buffered and future data goes to data listeners.
    pub fn resume(&self) -> &Self {
        let mut st = self.inner.state.borrow_mut();
        if st.flowing != Some(true) {
            tracing::trace!("resume");
            st.flowing = Some(true);
            if !st.resume_scheduled {
                st.resume_scheduled = true;
                drop(st);
                let this = self.clone();
                self.scheduler().defer(move || this.resume_now());
                st = self.inner.state.borrow_mut();
            }
        }
        st.paused = false;
        self
    }

    fn resume_now(&self) {
        let reading = self.inner.state.borrow().reading;
        if !reading {
            self.read(Some(0));
        }

        self.inner.state.borrow_mut().resume_scheduled = false;
        self.inner.lifecycle.emit(Event::Resume);
        self.flow();

        let st = self.inner.state.borrow();
        let read_again = st.flowing == Some(true) && !st.reading;
        drop(st);
        if read_again {
            self.read(Some(0));
        }
    }

    /// Stops flowing delivery. Data keeps buffering up to the high-water mark.
    pub fn pause(&self) -> &Self {
        let mut st = self.inner.state.borrow_mut();
        if st.flowing != Some(false) {
            tracing::trace!("pause");
            st.flowing = Some(false);
            drop(st);
            self.inner.lifecycle.emit_deferred(Event::Pause);
            st = self.inner.state.borrow_mut();
        }
        st.paused = true;
        self
    }

    /// Decodes buffered and future bytes into text.
    pub fn set_encoding(&self, encoding: Encoding) -> &Self {
        let mut st = self.inner.state.borrow_mut();
        if st.object_mode {
            return self;
        }

        let mut decoder = TextDecoder::new(encoding);
        let mut content = String::new();
        while let Some(chunk) = st.store.shift() {
            if let Ok(Chunk::Bytes(bytes)) = chunk.into_bytes_chunk() {
                content.push_str(&decoder.write(&bytes));
            }
        }

        st.length = content.chars().count();
        if !content.is_empty() {
            st.store.push(Chunk::Text {
                text: content,
                encoding,
            });
        }
        st.decoder = Some(decoder);
        self
    }

    /// Subscribes to lifecycle notifications. Never changes the flowing mode.
    pub fn on(&self, listener: impl Fn(&Event) + 'static) -> ListenerId {
        self.inner.lifecycle.on(Rc::new(listener))
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.lifecycle.off(id)
    }

    /// Subscribes to data delivery. Never changes the flowing mode; call
    /// [`Readable::resume`] to start flowing.
    pub fn on_data(&self, listener: impl Fn(&Chunk<T>) + 'static) -> ListenerId {
        self.inner.data.add(Rc::new(listener))
    }

    pub fn off_data(&self, id: ListenerId) -> bool {
        self.inner.data.remove(id)
    }

    pub fn destroy(&self, err: Option<StreamError>) {
        self.inner.lifecycle.destroy(err);
    }

    /// Like [`Readable::destroy`], but reports a repeated destroy carrying a different error.
    pub fn try_destroy(&self, err: Option<StreamError>) -> Result<(), StreamError> {
        self.inner.lifecycle.try_destroy(err)
    }

    /// Destroys the stream when the guard drops: quietly if it already ended, with
    /// [`StreamError::Aborted`] otherwise.
    pub fn scoped(&self) -> DisposeGuard {
        DisposeGuard::new(self.inner.lifecycle.clone())
    }

    /// Resolves once the stream closed.
    pub fn closed(&self) -> impl Future<Output = Result<(), StreamError>> {
        self.inner.lifecycle.closed()
    }

    /// Resolves when end-of-data was delivered, or with the error (or a premature close)
    /// that prevented it.
    pub fn finished(&self) -> impl Future<Output = Result<(), StreamError>> {
        self.inner
            .lifecycle
            .completion(Lifecycle::end_emitted, Event::End)
    }

    /// Forwards every chunk to `dest`, pausing while `dest` reports backpressure and ending
    /// it when this stream ends. Starts flowing. The link is dropped once `dest` finishes,
    /// closes or fails, or on [`Readable::unpipe`].
    pub fn pipe(&self, dest: &Writable<T>) -> Writable<T>
    where
        T: Clone,
    {
        let paused_by_pipe = Rc::new(Cell::new(false));

        let sink = dest.clone();
        let src = self.downgrade();
        let paused = paused_by_pipe.clone();
        let data = self.on_data(move |chunk| {
            if !matches!(sink.write(chunk.clone()), Ok(true)) {
                if let Some(src) = src.upgrade() {
                    tracing::trace!("pipe backpressure");
                    paused.set(true);
                    src.pause();
                }
            }
        });

        let src = self.downgrade();
        let paused = paused_by_pipe;
        let drain = dest.on(move |event| {
            if matches!(event, Event::Drain) && paused.replace(false) {
                if let Some(src) = src.upgrade() {
                    src.resume();
                }
            }
        });

        let sink = dest.clone();
        let end = self.on(move |event| {
            if matches!(event, Event::End) {
                sink.end();
            }
        });

        let src = self.downgrade();
        let sink = dest.downgrade();
        let unpipe = dest.on(move |event| {
            if !matches!(event, Event::Close | Event::Finish | Event::Error(_)) {
                return;
            }
            if let (Some(src), Some(sink)) = (src.upgrade(), sink.upgrade()) {
                tracing::trace!(event = event.name(), "destination done");
                src.unpipe(&sink);
            }
        });

        self.inner.pipes.borrow_mut().push(PipeLink {
            dest: dest.downgrade(),
            data,
            end,
            drain,
            unpipe,
        });

        if self.flowing() != Some(true) {
            self.resume();
        }
        dest.clone()
    }

    /// Detaches `dest` from a previous [`Readable::pipe`]. The stream pauses once its last
    /// destination is gone. Returns `false` if `dest` was not piped.
    pub fn unpipe(&self, dest: &Writable<T>) -> bool {
        let link = {
            let mut pipes = self.inner.pipes.borrow_mut();
            let Some(idx) = pipes.iter().position(|link| link.dest.refers_to(dest)) else {
                return false;
            };
            pipes.remove(idx)
        };

        tracing::trace!("unpipe");
        self.off_data(link.data);
        self.off(link.end);
        dest.off(link.drain);
        dest.off(link.unpipe);

        let last = self.inner.pipes.borrow().is_empty();
        let st = self.inner.state.borrow();
        let pause = last && st.flowing == Some(true) && !st.end_emitted;
        drop(st);
        if pause {
            self.pause();
        }
        true
    }
}

/// Converts a byte-mode chunk to what the buffer holds: bytes, or text already in the
/// decoder's encoding.
fn normalize<T>(chunk: Chunk<T>, decoding: Option<Encoding>) -> Result<Chunk<T>, StreamError> {
    match chunk {
        Chunk::Value(_) => Err(StreamError::InvalidChunk),
        Chunk::Text { encoding, .. } if Some(encoding) == decoding => Ok(chunk),
        Chunk::Text { text, encoding } => encoding.encode(&text).map(Chunk::Bytes),
        bytes => Ok(bytes),
    }
}

impl<T> Inner<T> {
    fn wake(&self) {
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

impl<T: 'static> Half for Inner<T> {
    fn on_destroy(self: Rc<Self>) {
        let mut st = self.state.borrow_mut();
        st.store.clear();
        st.length = 0;
        drop(st);
        self.wake();
    }

    fn complete_gracefully(self: Rc<Self>) {
        let mut st = self.state.borrow_mut();
        if st.end_emitted {
            return;
        }
        st.ended = true;
        st.end_emitted = true;
        drop(st);

        self.lifecycle.mark_end_emitted();
        self.lifecycle.emit(Event::End);
    }

    fn on_close(self: Rc<Self>) {
        self.wake();
    }

    fn on_constructed(self: Rc<Self>) {
        let need_readable = self.state.borrow().need_readable;
        if need_readable {
            Readable { inner: self }.maybe_read_more();
        }
    }
}

impl<T: 'static> Stream for Readable<T> {
    type Item = Result<Chunk<T>, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(chunk) = this.read(None) {
            return Poll::Ready(Some(Ok(chunk)));
        }

        let lifecycle = &this.inner.lifecycle;
        let mut st = this.inner.state.borrow_mut();

        if st.end_emitted || (st.ended && st.length == 0 && !lifecycle.is_destroyed()) {
            return Poll::Ready(None);
        }

        if lifecycle.is_errored() || lifecycle.is_destroyed() {
            if st.terminal_yielded {
                return Poll::Ready(None);
            }
            st.terminal_yielded = true;
            let err = lifecycle.errored().unwrap_or(StreamError::PrematureClose);
            return Poll::Ready(Some(Err(err)));
        }

        drop(st);
        *this.inner.waker.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }
}

async fn pump_source<T: 'static>(
    mut source: LocalBoxStream<'static, Result<Chunk<T>, StreamError>>,
    readable: WeakReadable<T>,
    demand: Rc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = demand.notified() => {}
        }

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                item = source.next() => item,
            };

            let Some(readable) = readable.upgrade() else {
                return;
            };

            match item {
                Some(Ok(chunk)) => {
                    if !readable.push(chunk) {
                        break;
                    }
                }
                Some(Err(err)) => {
                    readable.destroy(Some(err));
                    return;
                }
                None => {
                    readable.push_end();
                    return;
                }
            }
        }
    }
}
