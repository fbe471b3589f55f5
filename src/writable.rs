//! Push-based sink with write coalescing.
//!
//! Writes go straight to the dispatch hook while it is idle and queue up behind it
//! otherwise. A corked stream only queues; once the last cork is removed the whole queue
//! goes out as one [`BatchDispatchable::write_batch`] call when that hook is present.
//! Callbacks fire in write order, always on a later turn than the call that queued them.

use std::{
    cell::RefCell,
    collections::VecDeque,
    future::Future,
    rc::{Rc, Weak},
};

use crate::{
    chunk::{Chunk, Encoding},
    destroy::{Constructable, DisposeGuard, Half, Lifecycle, Teardownable},
    error::StreamError,
    events::{Event, ListenerId},
    options::StreamOptions,
    scheduler::Scheduler,
};

/// Per-write (or per-`end`) completion callback.
pub type WriteCallback = Box<dyn FnOnce(Result<(), StreamError>)>;

/// Completion token handed to dispatch and finalize hooks. Consumed by completing it.
pub struct Done {
    hook: &'static str,
    complete: Option<Box<dyn FnOnce(Result<(), StreamError>)>>,
}

impl Done {
    pub(crate) fn new(
        hook: &'static str,
        complete: impl FnOnce(Result<(), StreamError>) + 'static,
    ) -> Self {
        Self {
            hook,
            complete: Some(Box::new(complete)),
        }
    }

    pub fn complete(mut self, result: Result<(), StreamError>) {
        if let Some(complete) = self.complete.take() {
            complete(result);
        }
    }

    pub fn ok(self) {
        self.complete(Ok(()))
    }

    pub fn fail(self, err: StreamError) {
        self.complete(Err(err))
    }
}

impl Drop for Done {
    fn drop(&mut self) {
        if self.complete.is_some() {
            tracing::warn!(hook = self.hook, "completion dropped without being called");
        }
    }
}

/// One queued write as seen by [`BatchDispatchable::write_batch`].
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry<T> {
    pub chunk: Chunk<T>,
    pub encoding: Encoding,
}

/// Writes a single chunk to the underlying resource.
pub trait Dispatchable<T> {
    fn write_one(&mut self, chunk: Chunk<T>, encoding: Encoding, done: Done);
}

impl<T, F> Dispatchable<T> for F
where
    F: FnMut(Chunk<T>, Encoding, Done),
{
    fn write_one(&mut self, chunk: Chunk<T>, encoding: Encoding, done: Done) {
        self(chunk, encoding, done)
    }
}

/// Writes several queued chunks in one go.
pub trait BatchDispatchable<T> {
    fn write_batch(&mut self, entries: Vec<BatchEntry<T>>, done: Done);
}

impl<T, F> BatchDispatchable<T> for F
where
    F: FnMut(Vec<BatchEntry<T>>, Done),
{
    fn write_batch(&mut self, entries: Vec<BatchEntry<T>>, done: Done) {
        self(entries, done)
    }
}

/// Runs once after every write completed, before `Finish`.
pub trait Finalizable {
    fn finalize(self: Box<Self>, done: Done);
}

impl<F> Finalizable for F
where
    F: FnOnce(Done) + 'static,
{
    fn finalize(self: Box<Self>, done: Done) {
        (*self)(done)
    }
}

pub(crate) struct Hooks<T> {
    pub(crate) dispatch: Option<Box<dyn Dispatchable<T>>>,
    pub(crate) batch: Option<Box<dyn BatchDispatchable<T>>>,
    pub(crate) finalize: Option<Box<dyn Finalizable>>,
}

impl<T> Default for Hooks<T> {
    fn default() -> Self {
        Self {
            dispatch: None,
            batch: None,
            finalize: None,
        }
    }
}

/// Handle to a writable stream. Clones share the stream.
pub struct Writable<T> {
    inner: Rc<Inner<T>>,
}

impl<T> Clone for Writable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub struct WeakWritable<T> {
    inner: Weak<Inner<T>>,
}

impl<T> Clone for WeakWritable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> WeakWritable<T> {
    pub fn upgrade(&self) -> Option<Writable<T>> {
        self.inner.upgrade().map(|inner| Writable { inner })
    }

    pub(crate) fn refers_to(&self, writable: &Writable<T>) -> bool {
        std::ptr::eq(self.inner.as_ptr(), Rc::as_ptr(&writable.inner))
    }
}

struct Inner<T> {
    lifecycle: Rc<Lifecycle>,
    state: RefCell<State<T>>,
    dispatch: RefCell<Option<Box<dyn Dispatchable<T>>>>,
    batch: RefCell<Option<Box<dyn BatchDispatchable<T>>>>,
    finalize: RefCell<Option<Box<dyn Finalizable>>>,
}

struct PendingWrite<T> {
    chunk: Chunk<T>,
    encoding: Encoding,
    units: usize,
    callback: Option<WriteCallback>,
}

enum Payload<T> {
    One(Chunk<T>, Encoding),
    Batch(Vec<BatchEntry<T>>),
}

struct State<T> {
    queue: VecDeque<PendingWrite<T>>,
    high_water_mark: usize,
    object_mode: bool,
    decode_strings: bool,
    default_encoding: Encoding,
    corked: usize,
    /// Units queued or in flight.
    length: usize,
    writing: bool,
    write_len: usize,
    in_flight: Vec<Option<WriteCallback>>,
    /// Set while a hook runs; completions signalled inside it are deferred.
    sync: bool,
    buffer_processing: bool,
    need_drain: bool,
    ending: bool,
    ended: bool,
    finished: bool,
    final_called: bool,
    prefinished: bool,
    /// Callbacks not yet invoked, including the one reserved for `finish`.
    pending_cb: usize,
    end_callbacks: Vec<WriteCallback>,
}

impl<T> State<T> {
    fn new(options: &StreamOptions) -> Self {
        Self {
            queue: VecDeque::new(),
            high_water_mark: options.effective_high_water_mark(),
            object_mode: options.object_mode,
            decode_strings: options.decode_strings,
            default_encoding: options.default_encoding,
            corked: 0,
            length: 0,
            writing: false,
            write_len: 0,
            in_flight: Vec::new(),
            sync: true,
            buffer_processing: false,
            need_drain: false,
            ending: false,
            ended: false,
            finished: false,
            final_called: false,
            prefinished: false,
            pending_cb: 0,
            end_callbacks: Vec::new(),
        }
    }
}

/// Configures a [`Writable`] before it is created.
pub struct WritableBuilder<T> {
    scheduler: Scheduler,
    options: StreamOptions,
    hooks: Hooks<T>,
    construct: Option<Box<dyn Constructable>>,
    teardown: Option<Box<dyn Teardownable>>,
}

impl<T: 'static> WritableBuilder<T> {
    pub fn options(self, options: StreamOptions) -> Self {
        Self { options, ..self }
    }

    pub fn dispatch(mut self, hook: impl Dispatchable<T> + 'static) -> Self {
        self.hooks.dispatch = Some(Box::new(hook));
        self
    }

    pub fn batch(mut self, hook: impl BatchDispatchable<T> + 'static) -> Self {
        self.hooks.batch = Some(Box::new(hook));
        self
    }

    pub fn finalize(mut self, hook: impl Finalizable + 'static) -> Self {
        self.hooks.finalize = Some(Box::new(hook));
        self
    }

    /// Queues writes until the hook completes its [`Done`]. Nothing is dispatched before.
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

    pub fn build(self) -> Writable<T> {
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
        Writable::with_lifecycle(lifecycle, &self.options, self.hooks)
    }
}

impl<T: 'static> Writable<T> {
    pub fn builder(scheduler: &Scheduler) -> WritableBuilder<T> {
        WritableBuilder {
            scheduler: scheduler.clone(),
            options: StreamOptions::default(),
            hooks: Hooks::default(),
            construct: None,
            teardown: None,
        }
    }

    pub fn new(
        scheduler: &Scheduler,
        options: StreamOptions,
        dispatch: impl Dispatchable<T> + 'static,
    ) -> Self {
        Self::builder(scheduler).options(options).dispatch(dispatch).build()
    }

    pub(crate) fn with_lifecycle(
        lifecycle: Rc<Lifecycle>,
        options: &StreamOptions,
        hooks: Hooks<T>,
    ) -> Self {
        let inner = Rc::new(Inner {
            lifecycle: lifecycle.clone(),
            state: RefCell::new(State::new(options)),
            dispatch: RefCell::new(hooks.dispatch),
            batch: RefCell::new(hooks.batch),
            finalize: RefCell::new(hooks.finalize),
        });
        let weak = Rc::downgrade(&inner);
        let half: Weak<dyn Half> = weak;
        lifecycle.attach_writable(half);
        Self { inner }
    }

    pub fn downgrade(&self) -> WeakWritable<T> {
        WeakWritable {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        self.inner.lifecycle.scheduler()
    }

    pub(crate) fn lifecycle(&self) -> &Rc<Lifecycle> {
        &self.inner.lifecycle
    }

    /// Units queued or in flight.
    pub fn writable_length(&self) -> usize {
        self.inner.state.borrow().length
    }

    pub fn high_water_mark(&self) -> usize {
        self.inner.state.borrow().high_water_mark
    }

    pub fn is_object_mode(&self) -> bool {
        self.inner.state.borrow().object_mode
    }

    /// Current cork depth.
    pub fn corked(&self) -> usize {
        self.inner.state.borrow().corked
    }

    pub fn need_drain(&self) -> bool {
        self.inner.state.borrow().need_drain
    }

    /// `end` was called.
    pub fn is_ending(&self) -> bool {
        self.inner.state.borrow().ending
    }

    /// `end` returned. Unlike [`Writable::is_ending`] this stays false while the final
    /// chunk and the uncork it triggers are still being processed.
    pub fn is_ended(&self) -> bool {
        self.inner.state.borrow().ended
    }

    pub fn is_finished(&self) -> bool {
        self.inner.state.borrow().finished
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.lifecycle.is_destroyed()
    }

    pub fn errored(&self) -> Option<StreamError> {
        self.inner.lifecycle.errored()
    }

    /// Whether `write` may still be called.
    pub fn is_writable(&self) -> bool {
        !self.is_destroyed() && !self.inner.lifecycle.is_errored() && !self.is_ending()
    }

    pub fn set_default_encoding(&self, encoding: Encoding) -> &Self {
        self.inner.state.borrow_mut().default_encoding = encoding;
        self
    }

    /// Queues `chunk`. `Ok(false)` asks the caller to wait for `Drain` before writing more.
    ///
    /// A value chunk on a byte stream and undecodable text fail here, synchronously.
    /// Writing after `end` or after destroy also fails here, and errors the stream.
    pub fn write(&self, chunk: impl Into<Chunk<T>>) -> Result<bool, StreamError> {
        self.write_chunk(chunk.into(), None)
    }

    /// Like [`Writable::write`], with a callback invoked once the chunk was handled.
    pub fn write_with(
        &self,
        chunk: impl Into<Chunk<T>>,
        callback: impl FnOnce(Result<(), StreamError>) + 'static,
    ) -> Result<bool, StreamError> {
        self.write_chunk(chunk.into(), Some(Box::new(callback)))
    }

    /// Writes text labelled with the stream's default encoding.
    pub fn write_str(&self, text: impl Into<String>) -> Result<bool, StreamError> {
        let encoding = self.inner.state.borrow().default_encoding;
        self.write_chunk(Chunk::encoded(text, encoding), None)
    }

    fn write_chunk(
        &self,
        chunk: Chunk<T>,
        callback: Option<WriteCallback>,
    ) -> Result<bool, StreamError> {
        let lifecycle = &self.inner.lifecycle;
        let mut st = self.inner.state.borrow_mut();

        let checked = match chunk {
            Chunk::Value(_) if !st.object_mode => Err(StreamError::InvalidChunk),
            text @ Chunk::Text { .. } if !st.object_mode && st.decode_strings => {
                text.into_bytes_chunk()
            }
            other => Ok(other),
        };
        let chunk = match checked {
            Ok(chunk) => chunk,
            Err(err) => {
                drop(st);
                tracing::debug!(error = %err, "invalid chunk");
                if let Some(callback) = callback {
                    let e = err.clone();
                    self.scheduler().defer(move || callback(Err(e)));
                }
                return Err(err);
            }
        };

        let rejected = if st.ending {
            Some(StreamError::WriteAfterEnd)
        } else if lifecycle.is_destroyed() {
            Some(StreamError::Destroyed("write"))
        } else {
            None
        };

        if let Some(err) = rejected {
            drop(st);
            tracing::debug!(error = %err, "write rejected");
            if let Some(callback) = callback {
                let e = err.clone();
                self.scheduler().defer(move || callback(Err(e)));
            }
            lifecycle.error_or_destroy(err.clone());
            return Err(err);
        }

        st.pending_cb += 1;
        drop(st);
        Ok(self.write_or_buffer(chunk, callback))
    }

    fn write_or_buffer(&self, chunk: Chunk<T>, callback: Option<WriteCallback>) -> bool {
        let lifecycle = &self.inner.lifecycle;
        let mut st = self.inner.state.borrow_mut();

        let units = if st.object_mode { 1 } else { chunk.units() };
        let encoding = chunk.encoding();
        st.length += units;

        let ret = st.length < st.high_water_mark;
        if !ret {
            st.need_drain = true;
        }

        if st.writing || st.corked > 0 || lifecycle.is_errored() || !lifecycle.is_constructed() {
            tracing::trace!(units, queued = st.queue.len() + 1, "queue write");
            st.queue.push_back(PendingWrite {
                chunk,
                encoding,
                units,
                callback,
            });
            drop(st);
        } else {
            drop(st);
            self.do_write(Payload::One(chunk, encoding), units, vec![callback]);
        }

        ret && !lifecycle.is_errored() && !lifecycle.is_destroyed()
    }

    fn do_write(&self, payload: Payload<T>, len: usize, callbacks: Vec<Option<WriteCallback>>) {
        {
            let mut st = self.inner.state.borrow_mut();
            st.write_len = len;
            st.in_flight = callbacks;
            st.writing = true;
            st.sync = true;
        }

        let done = self.write_done();
        if self.inner.lifecycle.is_destroyed() {
            done.fail(StreamError::Destroyed("write"));
        } else {
            let has_dispatch = self.inner.dispatch.borrow().is_some();
            match payload {
                Payload::One(chunk, encoding) if has_dispatch => {
                    tracing::trace!(len, "dispatch one");
                    if let Some(hook) = self.inner.dispatch.borrow_mut().as_mut() {
                        hook.write_one(chunk, encoding, done);
                    }
                }
                Payload::One(chunk, encoding) => {
                    self.dispatch_batch(vec![BatchEntry { chunk, encoding }], done)
                }
                Payload::Batch(entries) => self.dispatch_batch(entries, done),
            }
        }

        self.inner.state.borrow_mut().sync = false;
    }

    fn dispatch_batch(&self, entries: Vec<BatchEntry<T>>, done: Done) {
        let mut batch = self.inner.batch.borrow_mut();
        match batch.as_mut() {
            Some(hook) => {
                tracing::trace!(entries = entries.len(), "dispatch batch");
                hook.write_batch(entries, done);
            }
            None => done.fail(StreamError::InvalidArg {
                name: "dispatch",
                reason: "no dispatch hook configured".into(),
            }),
        }
    }

    fn write_done(&self) -> Done {
        let weak = self.downgrade();
        Done::new("write", move |result| {
            if let Some(this) = weak.upgrade() {
                this.on_write(result);
            }
        })
    }

    fn on_write(&self, result: Result<(), StreamError>) {
        if self.inner.state.borrow().sync {
            let this = self.clone();
            self.scheduler().defer(move || this.on_write_now(result));
        } else {
            self.on_write_now(result);
        }
    }

    fn on_write_now(&self, result: Result<(), StreamError>) {
        let lifecycle = self.inner.lifecycle.clone();
        let mut st = self.inner.state.borrow_mut();

        st.writing = false;
        let callbacks = std::mem::take(&mut st.in_flight);
        st.length = st.length.saturating_sub(st.write_len);
        st.write_len = 0;

        match result {
            Err(err) => {
                tracing::debug!(error = %err, "write failed");
                if !lifecycle.is_destroyed() {
                    lifecycle.set_errored(&err);
                }
                st.pending_cb = st.pending_cb.saturating_sub(callbacks.len());
                drop(st);

                for callback in callbacks.into_iter().flatten() {
                    callback(Err(err.clone()));
                }
                self.error_buffer();
                lifecycle.error_or_destroy(err);
            }
            Ok(()) => {
                let buffered = !st.queue.is_empty();
                drop(st);

                if buffered {
                    self.clear_buffer();
                }
                self.after_write(callbacks);
            }
        }
    }

    fn after_write(&self, callbacks: Vec<Option<WriteCallback>>) {
        let lifecycle = self.inner.lifecycle.clone();
        let mut st = self.inner.state.borrow_mut();

        let drain =
            !st.ending && !lifecycle.is_destroyed() && st.length == 0 && st.need_drain;
        if drain {
            st.need_drain = false;
        }
        drop(st);

        if drain {
            lifecycle.emit(Event::Drain);
        }

        for callback in callbacks {
            {
                let mut st = self.inner.state.borrow_mut();
                st.pending_cb = st.pending_cb.saturating_sub(1);
            }
            if let Some(callback) = callback {
                callback(Ok(()));
            }
        }

        if lifecycle.is_destroyed() {
            self.error_buffer();
        }

        self.finish_maybe();
    }

    /// Sends queued writes to the hooks: one batch when several are queued and a batch
    /// hook exists, else the head write alone.
    fn clear_buffer(&self) {
        let mut st = self.inner.state.borrow_mut();
        if st.corked > 0
            || st.buffer_processing
            || self.inner.lifecycle.is_destroyed()
            || !self.inner.lifecycle.is_constructed()
            || st.queue.is_empty()
        {
            return;
        }
        st.buffer_processing = true;

        let batched = st.queue.len() > 1 && self.inner.batch.borrow().is_some();
        if batched {
            let len = st.length;
            let mut entries = Vec::with_capacity(st.queue.len());
            let mut callbacks = Vec::with_capacity(st.queue.len());
            for pending in st.queue.drain(..) {
                entries.push(BatchEntry {
                    chunk: pending.chunk,
                    encoding: pending.encoding,
                });
                callbacks.push(pending.callback);
            }
            drop(st);
            self.do_write(Payload::Batch(entries), len, callbacks);
        } else if let Some(pending) = st.queue.pop_front() {
            drop(st);
            self.do_write(
                Payload::One(pending.chunk, pending.encoding),
                pending.units,
                vec![pending.callback],
            );
        } else {
            drop(st);
        }

        self.inner.state.borrow_mut().buffer_processing = false;
    }

    /// Fails every queued write and pending `end` callback with the stream's error.
    fn error_buffer(&self) {
        let err = self.inner.lifecycle.errored();
        let mut st = self.inner.state.borrow_mut();
        if st.writing {
            return;
        }

        let queued: Vec<_> = st.queue.drain(..).collect();
        for pending in &queued {
            st.length = st.length.saturating_sub(pending.units);
        }
        st.pending_cb = st.pending_cb.saturating_sub(queued.len());
        let end_callbacks = std::mem::take(&mut st.end_callbacks);
        drop(st);

        for pending in queued {
            if let Some(callback) = pending.callback {
                callback(Err(err.clone().unwrap_or(StreamError::Destroyed("write"))));
            }
        }
        for callback in end_callbacks {
            callback(Err(err.clone().unwrap_or(StreamError::Destroyed("end"))));
        }
    }

    /// Queues writes until a matching [`Writable::uncork`].
    pub fn cork(&self) {
        self.inner.state.borrow_mut().corked += 1;
    }

    /// Removes one cork. The last one flushes the queue.
    pub fn uncork(&self) {
        let mut st = self.inner.state.borrow_mut();
        if st.corked == 0 {
            return;
        }
        st.corked -= 1;
        let writing = st.writing;
        drop(st);

        if !writing {
            self.clear_buffer();
        }
    }

    /// Signals that no more data will be written. Fully uncorks the stream.
    pub fn end(&self) {
        self.end_inner(None, None);
    }

    /// Writes a final chunk, then ends.
    pub fn end_with(&self, chunk: impl Into<Chunk<T>>) {
        self.end_inner(Some(chunk.into()), None);
    }

    /// Ends, invoking `callback` once the stream finished or failed.
    pub fn end_then(&self, callback: impl FnOnce(Result<(), StreamError>) + 'static) {
        self.end_inner(None, Some(Box::new(callback)));
    }

    fn end_inner(&self, chunk: Option<Chunk<T>>, callback: Option<WriteCallback>) {
        let lifecycle = self.inner.lifecycle.clone();
        let mut err = chunk.and_then(|chunk| self.write_chunk(chunk, None).err());

        let corked = self.inner.state.borrow().corked > 0;
        if corked {
            self.inner.state.borrow_mut().corked = 1;
            self.uncork();
        }

        if err.is_none() {
            let (ending, finished) = {
                let st = self.inner.state.borrow();
                (st.ending, st.finished)
            };
            if !ending && !lifecycle.is_errored() {
                tracing::debug!("end");
                self.inner.state.borrow_mut().ending = true;
                self.finish_maybe();
                self.inner.state.borrow_mut().ended = true;
            } else if finished {
                err = Some(StreamError::AlreadyFinished("end"));
            } else if lifecycle.is_destroyed() {
                err = Some(StreamError::Destroyed("end"));
            }
        }

        let Some(callback) = callback else {
            return;
        };

        let mut st = self.inner.state.borrow_mut();
        let outcome = match err.or_else(|| lifecycle.errored()) {
            Some(err) => Some(Err(err)),
            None if st.finished => Some(Ok(())),
            None => None,
        };
        match outcome {
            Some(outcome) => {
                drop(st);
                self.scheduler().defer(move || callback(outcome));
            }
            None => st.end_callbacks.push(callback),
        }
    }

    fn need_finish(&self) -> bool {
        let lifecycle = &self.inner.lifecycle;
        let st = self.inner.state.borrow();
        st.ending
            && lifecycle.is_constructed()
            && !lifecycle.is_destroyed()
            && !st.finished
            && !st.writing
            && !lifecycle.error_emitted()
            && !lifecycle.close_emitted()
            && !lifecycle.is_errored()
            && st.queue.is_empty()
            && st.length == 0
    }

    fn finish_maybe(&self) {
        if !self.need_finish() {
            return;
        }
        self.prefinish();

        let mut st = self.inner.state.borrow_mut();
        if st.pending_cb != 0 {
            return;
        }
        st.pending_cb += 1;
        drop(st);

        let this = self.clone();
        self.scheduler().defer(move || {
            if this.need_finish() {
                this.finish();
            } else {
                let mut st = this.inner.state.borrow_mut();
                st.pending_cb = st.pending_cb.saturating_sub(1);
            }
        });
    }

    fn prefinish(&self) {
        let mut st = self.inner.state.borrow_mut();
        if st.prefinished || st.final_called {
            return;
        }
        st.final_called = true;

        let hook = self.inner.finalize.borrow_mut().take();
        match hook {
            Some(hook) if !self.inner.lifecycle.is_destroyed() => {
                st.sync = true;
                st.pending_cb += 1;
                drop(st);

                tracing::trace!("finalize");
                hook.finalize(self.final_done());
                self.inner.state.borrow_mut().sync = false;
            }
            _ => {
                st.prefinished = true;
                drop(st);
                self.inner.lifecycle.emit_deferred(Event::Prefinish);
            }
        }
    }

    fn final_done(&self) -> Done {
        let weak = self.downgrade();
        Done::new("finalize", move |result| {
            let Some(this) = weak.upgrade() else {
                return;
            };
            if this.inner.state.borrow().sync {
                let deferred = this.clone();
                this.scheduler()
                    .defer(move || deferred.on_final(result));
            } else {
                this.on_final(result);
            }
        })
    }

    fn on_final(&self, result: Result<(), StreamError>) {
        let lifecycle = self.inner.lifecycle.clone();
        let mut st = self.inner.state.borrow_mut();
        st.pending_cb = st.pending_cb.saturating_sub(1);

        match result {
            Err(err) => {
                tracing::debug!(error = %err, "finalize failed");
                let end_callbacks = std::mem::take(&mut st.end_callbacks);
                drop(st);
                for callback in end_callbacks {
                    callback(Err(err.clone()));
                }
                lifecycle.error_or_destroy(err);
            }
            Ok(()) => {
                drop(st);
                if !self.need_finish() {
                    return;
                }
                {
                    let mut st = self.inner.state.borrow_mut();
                    st.prefinished = true;
                    st.pending_cb += 1;
                }
                lifecycle.emit(Event::Prefinish);
                let this = self.clone();
                self.scheduler().defer(move || {
                    if this.need_finish() {
                        this.finish();
                    } else {
                        let mut st = this.inner.state.borrow_mut();
                        st.pending_cb = st.pending_cb.saturating_sub(1);
                    }
                });
            }
        }
    }

    fn finish(&self) {
        let lifecycle = self.inner.lifecycle.clone();
        let mut st = self.inner.state.borrow_mut();
        st.pending_cb = st.pending_cb.saturating_sub(1);
        st.finished = true;
        let end_callbacks = std::mem::take(&mut st.end_callbacks);
        drop(st);

        tracing::debug!("finish");
        lifecycle.mark_finished();
        for callback in end_callbacks {
            callback(Ok(()));
        }
        lifecycle.emit(Event::Finish);
        lifecycle.maybe_auto_destroy();
    }

    pub fn on(&self, listener: impl Fn(&Event) + 'static) -> ListenerId {
        self.inner.lifecycle.on(Rc::new(listener))
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.lifecycle.off(id)
    }

    pub fn destroy(&self, err: Option<StreamError>) {
        self.inner.lifecycle.destroy(err);
    }

    /// Like [`Writable::destroy`], but reports a repeated destroy carrying a different error.
    pub fn try_destroy(&self, err: Option<StreamError>) -> Result<(), StreamError> {
        self.inner.lifecycle.try_destroy(err)
    }

    /// Destroys the stream when the guard drops: quietly if it already finished, with
    /// [`StreamError::Aborted`] otherwise.
    pub fn scoped(&self) -> DisposeGuard {
        DisposeGuard::new(self.inner.lifecycle.clone())
    }

    pub fn closed(&self) -> impl Future<Output = Result<(), StreamError>> {
        self.inner.lifecycle.closed()
    }

    /// Resolves on `Finish`, or with the error (or premature close) that prevented it.
    pub fn finished(&self) -> impl Future<Output = Result<(), StreamError>> {
        self.inner
            .lifecycle
            .completion(Lifecycle::is_finished, Event::Finish)
    }
}

impl<T: 'static> Half for Inner<T> {
    fn on_destroy(self: Rc<Self>) {
        let st = self.state.borrow();
        let pending = !st.queue.is_empty() || !st.end_callbacks.is_empty();
        drop(st);

        if pending {
            let this = Writable { inner: self };
            let scheduler = this.scheduler().clone();
            scheduler.defer(move || this.error_buffer());
        }
    }

    fn complete_gracefully(self: Rc<Self>) {
        let mut st = self.state.borrow_mut();
        if st.finished {
            return;
        }
        st.finished = true;
        let end_callbacks = std::mem::take(&mut st.end_callbacks);
        drop(st);

        self.lifecycle.mark_finished();
        for callback in end_callbacks {
            callback(Ok(()));
        }
        self.lifecycle.emit(Event::Finish);
    }

    fn on_close(self: Rc<Self>) {}

    fn on_constructed(self: Rc<Self>) {
        let this = Writable { inner: self };
        let writing = this.inner.state.borrow().writing;
        if !writing {
            this.clear_buffer();
        }
        this.finish_maybe();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use bytes::Bytes;

    use super::*;
    use crate::test_utils::EventLog;

    type Parked = Rc<RefCell<Vec<Done>>>;

    /// A writable whose dispatch hook records chunks and parks completions.
    fn parking(scheduler: &Scheduler, options: StreamOptions) -> (Writable<()>, Rc<RefCell<Vec<Chunk<()>>>>, Parked) {
        let written = Rc::new(RefCell::new(Vec::new()));
        let parked: Parked = Rc::new(RefCell::new(Vec::new()));

        let w = written.clone();
        let p = parked.clone();
        let writable = Writable::new(scheduler, options, move |chunk: Chunk<()>, _: Encoding, done: Done| {
            w.borrow_mut().push(chunk);
            p.borrow_mut().push(done);
        });
        (writable, written, parked)
    }

    fn release(parked: &Parked) {
        let all: Vec<_> = parked.borrow_mut().drain(..).collect();
        for done in all {
            done.ok();
        }
    }

    fn callback(log: &EventLog, name: &'static str) -> impl FnOnce(Result<(), StreamError>) + 'static {
        let log = log.clone();
        move |result| match result {
            Ok(()) => log.note(name),
            Err(err) => log.note(format!("{name}: {err}")),
        }
    }

    #[test]
    fn callbacks_fire_in_order_on_a_later_turn() {
        let scheduler = Scheduler::new();
        let log = EventLog::new();
        let writable: Writable<()> = Writable::new(
            &scheduler,
            StreamOptions::default(),
            |_: Chunk<()>, _: Encoding, done: Done| done.ok(),
        );

        writable.write_with("a", callback(&log, "a")).unwrap();
        writable.write_with("b", callback(&log, "b")).unwrap();
        writable.write_with("c", callback(&log, "c")).unwrap();
        assert!(log.names().is_empty());

        scheduler.run_until_idle();
        assert_eq!(log.names(), vec!["a", "b", "c"]);
    }

    #[test]
    fn backpressure_then_drain() {
        let scheduler = Scheduler::new();
        let log = EventLog::new();
        let (writable, written, parked) = parking(&scheduler, StreamOptions::default().high_water_mark(3));
        writable.on(log.recorder());

        assert_eq!(writable.write("ab"), Ok(true));
        assert_eq!(writable.write("cd"), Ok(false));
        assert!(writable.need_drain());
        assert_eq!(writable.writable_length(), 4);

        release(&parked);
        scheduler.run_until_idle();
        assert!(log.names().is_empty(), "one write still in flight");

        release(&parked);
        scheduler.run_until_idle();
        assert_eq!(log.names(), vec!["drain"]);
        assert_eq!(
            *written.borrow(),
            vec![Chunk::bytes("ab"), Chunk::bytes("cd")]
        );
    }

    #[test]
    fn nested_corks_flush_once_as_one_batch() {
        let scheduler = Scheduler::new();
        let batches = Rc::new(RefCell::new(Vec::new()));
        let singles = Rc::new(Cell::new(0));

        let b = batches.clone();
        let s = singles.clone();
        let writable: Writable<()> = Writable::builder(&scheduler)
            .dispatch(move |_: Chunk<()>, _: Encoding, done: Done| {
                s.set(s.get() + 1);
                done.ok();
            })
            .batch(move |entries: Vec<BatchEntry<()>>, done: Done| {
                b.borrow_mut().push(entries);
                done.ok();
            })
            .build();

        writable.cork();
        writable.write("a").unwrap();
        writable.write("b").unwrap();
        writable.cork();
        writable.write("c").unwrap();
        writable.uncork();
        assert!(batches.borrow().is_empty());
        writable.write("d").unwrap();
        writable.uncork();
        scheduler.run_until_idle();

        let batches = batches.borrow();
        assert_eq!(batches.len(), 1);
        let chunks: Vec<_> = batches[0].iter().map(|e| e.chunk.clone()).collect();
        assert_eq!(
            chunks,
            vec![
                Chunk::bytes("a"),
                Chunk::bytes("b"),
                Chunk::bytes("c"),
                Chunk::bytes("d")
            ]
        );
        assert_eq!(singles.get(), 0);
    }

    #[test]
    fn write_after_end_fails_synchronously_and_errors_the_stream() {
        let scheduler = Scheduler::new();
        let log = EventLog::new();
        let (writable, _, _) = parking(&scheduler, StreamOptions::default());
        writable.on(log.recorder());

        writable.end();
        let result = writable.write_with("late", callback(&log, "late"));
        assert_eq!(result, Err(StreamError::WriteAfterEnd));
        assert!(log.names().is_empty());

        scheduler.run_until_idle();
        assert_eq!(
            log.names(),
            vec!["prefinish", "late: write after end", "error", "close"]
        );
    }

    #[test]
    fn values_are_rejected_in_byte_mode() {
        let scheduler = Scheduler::new();
        let writable: Writable<u8> = Writable::new(
            &scheduler,
            StreamOptions::default(),
            |_: Chunk<u8>, _: Encoding, done: Done| done.ok(),
        );

        assert_eq!(writable.write(Chunk::Value(1)), Err(StreamError::InvalidChunk));
        assert!(!writable.is_destroyed());
    }

    #[test]
    fn rejected_chunks_still_get_their_callback() {
        let scheduler = Scheduler::new();
        let log = EventLog::new();
        let writable: Writable<u8> = Writable::new(
            &scheduler,
            StreamOptions::default(),
            |_: Chunk<u8>, _: Encoding, done: Done| done.ok(),
        );

        assert_eq!(
            writable.write_with(Chunk::Value(1), callback(&log, "value")),
            Err(StreamError::InvalidChunk)
        );
        assert!(writable
            .write_with(Chunk::encoded("zz", Encoding::Hex), callback(&log, "hex"))
            .is_err());
        assert!(log.names().is_empty());
        scheduler.run_until_idle();

        let names = log.names();
        assert_eq!(names.len(), 2);
        assert_eq!(names[0], format!("value: {}", StreamError::InvalidChunk));
        assert!(names[1].starts_with("hex: "), "{names:?}");
        assert_eq!(writable.writable_length(), 0);
        assert!(!writable.is_destroyed());
    }

    #[test]
    fn text_is_decoded_by_its_label() {
        let scheduler = Scheduler::new();
        let (writable, written, _) = parking(&scheduler, StreamOptions::default());

        writable
            .write(Chunk::encoded("facebea7", Encoding::Hex))
            .unwrap();
        assert_eq!(
            *written.borrow(),
            vec![Chunk::Bytes(Bytes::from_static(&[0xfa, 0xce, 0xbe, 0xa7]))]
        );
        assert!(matches!(
            writable.write(Chunk::encoded("zz", Encoding::Hex)),
            Err(StreamError::InvalidEncoding { .. })
        ));
    }

    #[test]
    fn default_encoding_labels_plain_text() {
        let scheduler = Scheduler::new();
        let (writable, written, parked) = parking(&scheduler, StreamOptions::default().decode_strings(false));
        writable.set_default_encoding(Encoding::Latin1);

        writable.write_str("caf\u{e9}").unwrap();
        release(&parked);
        assert_eq!(
            *written.borrow(),
            vec![Chunk::encoded("caf\u{e9}", Encoding::Latin1)]
        );
    }

    #[test]
    fn finalize_runs_before_finish() {
        let scheduler = Scheduler::new();
        let log = EventLog::new();

        let l = log.clone();
        let writable: Writable<()> = Writable::builder(&scheduler)
            .dispatch(|_: Chunk<()>, _: Encoding, done: Done| done.ok())
            .finalize(move |done: Done| {
                l.note("finalize");
                done.ok();
            })
            .build();
        writable.on(log.recorder());

        writable.write("x").unwrap();
        writable.end_then(callback(&log, "end"));
        scheduler.run_until_idle();

        assert_eq!(
            log.names(),
            vec!["finalize", "prefinish", "end", "finish", "close"]
        );
    }

    #[test]
    fn destroy_after_an_async_finalize_never_finishes() {
        let scheduler = Scheduler::new();
        let log = EventLog::new();
        let parked: Rc<RefCell<Option<Done>>> = Rc::new(RefCell::new(None));

        let p = parked.clone();
        let writable: Writable<()> = Writable::builder(&scheduler)
            .dispatch(|_: Chunk<()>, _: Encoding, done: Done| done.ok())
            .finalize(move |done: Done| *p.borrow_mut() = Some(done))
            .build();
        writable.on(log.recorder());

        writable.end();
        scheduler.run_until_idle();
        assert!(log.names().is_empty());

        let done = parked.borrow_mut().take().unwrap();
        done.ok();
        writable.destroy(None);
        scheduler.run_until_idle();

        assert_eq!(log.names(), vec!["prefinish", "close"]);
        assert!(!writable.is_finished());
    }

    #[test]
    fn dispatch_waits_for_construct() {
        let scheduler = Scheduler::new();
        let log = EventLog::new();
        let parked: Rc<RefCell<Option<Done>>> = Rc::new(RefCell::new(None));

        let p = parked.clone();
        let l = log.clone();
        let writable: Writable<()> = Writable::builder(&scheduler)
            .construct(move |done: Done| *p.borrow_mut() = Some(done))
            .dispatch(move |chunk: Chunk<()>, _: Encoding, done: Done| {
                let bytes = chunk.as_bytes().cloned().unwrap_or_default();
                l.note(format!("dispatch {}", String::from_utf8_lossy(&bytes)));
                done.ok()
            })
            .build();
        writable.on(log.recorder());

        assert_eq!(writable.write_with("a", callback(&log, "a")), Ok(true));
        writable.write_with("b", callback(&log, "b")).unwrap();
        writable.end_then(callback(&log, "end"));
        scheduler.run_until_idle();
        assert!(log.names().is_empty());
        assert_eq!(writable.writable_length(), 2);

        let done = parked.borrow_mut().take().unwrap();
        done.ok();
        scheduler.run_until_idle();

        assert_eq!(
            log.names(),
            vec!["dispatch a", "dispatch b", "a", "b", "prefinish", "end", "finish", "close"]
        );
    }

    #[test]
    fn end_after_finish_reports_already_finished() {
        let scheduler = Scheduler::new();
        let log = EventLog::new();
        let writable: Writable<()> = Writable::builder(&scheduler)
            .options(StreamOptions::default().auto_destroy(false))
            .dispatch(|_: Chunk<()>, _: Encoding, done: Done| done.ok())
            .build();

        writable.end();
        scheduler.run_until_idle();
        assert!(writable.is_finished());

        writable.end_then(callback(&log, "again"));
        scheduler.run_until_idle();
        assert_eq!(
            log.names(),
            vec!["again: cannot call end after a stream was finished"]
        );
    }

    #[test]
    fn destroy_fails_queued_writes_and_end_callbacks() {
        let scheduler = Scheduler::new();
        let log = EventLog::new();
        let (writable, _, parked) = parking(&scheduler, StreamOptions::default());

        writable.write_with("in flight", callback(&log, "first")).unwrap();
        writable.write_with("queued", callback(&log, "second")).unwrap();
        writable.end_then(callback(&log, "end"));

        writable.destroy(Some(StreamError::msg("gone")));
        scheduler.run_until_idle();
        assert!(log.names().is_empty(), "queued work waits for the write in flight");

        release(&parked);
        scheduler.run_until_idle();
        assert_eq!(log.names(), vec!["first", "second: gone", "end: gone"]);
    }

    #[test]
    fn hook_failure_errors_the_stream() {
        let scheduler = Scheduler::new();
        let log = EventLog::new();
        let err = StreamError::msg("disk full");

        let e = err.clone();
        let writable: Writable<()> = Writable::new(
            &scheduler,
            StreamOptions::default(),
            move |_: Chunk<()>, _: Encoding, done: Done| done.fail(e.clone()),
        );
        writable.on(log.recorder());

        writable.write_with("a", callback(&log, "a")).unwrap();
        scheduler.run_until_idle();

        assert_eq!(log.names(), vec!["a: disk full", "error", "close"]);
        assert_eq!(writable.errored(), Some(err));
    }

    #[tokio::test]
    async fn finished_resolves_after_finish() {
        let scheduler = Scheduler::new();
        let writable: Writable<()> = Writable::new(
            &scheduler,
            StreamOptions::default(),
            |_: Chunk<()>, _: Encoding, done: Done| done.ok(),
        );

        let finished = writable.finished();
        writable.write("a").unwrap();
        writable.end();

        assert_eq!(scheduler.run_until(finished).await, Ok(()));
        assert_eq!(scheduler.run_until(writable.finished()).await, Ok(()));
    }

    #[tokio::test]
    async fn finished_reports_disposal() {
        let scheduler = Scheduler::new();
        let (writable, _, _) = parking(&scheduler, StreamOptions::default());

        let finished = writable.finished();
        drop(writable.scoped());

        assert_eq!(
            scheduler.run_until(finished).await,
            Err(StreamError::Aborted)
        );
    }
}
