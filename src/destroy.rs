//! Teardown shared by every stream shape.
//!
//! A [`Lifecycle`] is owned by reference by the readable half, the writable half, or both
//! halves of a transform. It turns any terminal condition into one idempotent sequence:
//! mark destroyed, drop buffered data, run the teardown hook once, then emit `Error`
//! (unless the hook swallowed it) and `Close` exactly once on a later turn.

use std::{
    cell::{Cell, RefCell},
    future::Future,
    rc::{Rc, Weak},
};

use futures::{channel::oneshot, future::Either, FutureExt};

use crate::{
    error::StreamError,
    events::{Event, ListenerId, Listeners},
    scheduler::Scheduler,
    writable::Done,
};

/// Opens the underlying resource. `fill` and dispatch hooks are held back until `done`
/// completes; an error destroys the stream.
pub trait Constructable {
    fn construct(self: Box<Self>, done: Done);
}

impl<F> Constructable for F
where
    F: FnOnce(Done) + 'static,
{
    fn construct(self: Box<Self>, done: Done) {
        (*self)(done)
    }
}

/// Releases a stream's resources. Invoked exactly once per stream.
pub trait Teardownable {
    /// `err` is the error that triggered the destroy, if any. Completing `done` with
    /// `None` suppresses the `Error` notification.
    fn teardown(self: Box<Self>, err: Option<StreamError>, done: TeardownDone);
}

impl<F> Teardownable for F
where
    F: FnOnce(Option<StreamError>, TeardownDone) + 'static,
{
    fn teardown(self: Box<Self>, err: Option<StreamError>, done: TeardownDone) {
        (*self)(err, done)
    }
}

/// Completion token handed to a [`Teardownable`] hook.
pub struct TeardownDone {
    lifecycle: Option<Rc<Lifecycle>>,
    graceful: bool,
}

impl TeardownDone {
    /// Emit the natural `End` / `Finish` notifications before `Close`.
    ///
    /// Lets a graceful shutdown report a completed stream even though it was destroyed.
    pub fn graceful(mut self) -> Self {
        self.graceful = true;
        self
    }

    /// Signals teardown completion. `Some(err)` is reported through `Error`, `None`
    /// suppresses whatever error triggered the destroy.
    pub fn complete(mut self, err: Option<StreamError>) {
        if let Some(lifecycle) = self.lifecycle.take() {
            lifecycle.on_teardown_done(err, self.graceful);
        }
    }

    pub fn ok(self) {
        self.complete(None)
    }

    pub fn fail(self, err: StreamError) {
        self.complete(Some(err))
    }
}

impl Drop for TeardownDone {
    fn drop(&mut self) {
        if self.lifecycle.is_some() {
            tracing::warn!("teardown completion dropped without being called, close will never be emitted");
        }
    }
}

/// The readable or writable half of a stream, as seen by its lifecycle.
pub(crate) trait Half {
    /// Destroy has begun: drop buffered data and fail queued work.
    fn on_destroy(self: Rc<Self>);
    /// Graceful teardown: emit the natural terminal notification if it has not fired.
    fn complete_gracefully(self: Rc<Self>);
    /// Close was emitted: wake anything parked on the stream.
    fn on_close(self: Rc<Self>);
    /// The construct hook completed: start the work it held back.
    fn on_constructed(self: Rc<Self>);
}

pub(crate) struct Lifecycle {
    scheduler: Scheduler,
    pub(crate) events: Listeners<Event>,
    auto_destroy: Cell<bool>,
    emit_close: Cell<bool>,
    destroyed: Cell<bool>,
    constructed: Cell<bool>,
    close_emitted: Cell<bool>,
    error_emitted: Cell<bool>,
    errored: RefCell<Option<StreamError>>,
    destroy_error: RefCell<Option<StreamError>>,
    teardown: RefCell<Option<Box<dyn Teardownable>>>,
    halves: RefCell<Vec<Weak<dyn Half>>>,
    has_readable: Cell<bool>,
    has_writable: Cell<bool>,
    end_emitted: Cell<bool>,
    finished: Cell<bool>,
    close_waiters: RefCell<Vec<oneshot::Sender<Result<(), StreamError>>>>,
}

impl Lifecycle {
    pub(crate) fn new(scheduler: Scheduler, auto_destroy: bool, emit_close: bool) -> Rc<Self> {
        Rc::new(Self {
            scheduler,
            events: Listeners::default(),
            auto_destroy: Cell::new(auto_destroy),
            emit_close: Cell::new(emit_close),
            destroyed: Cell::new(false),
            constructed: Cell::new(true),
            close_emitted: Cell::new(false),
            error_emitted: Cell::new(false),
            errored: RefCell::new(None),
            destroy_error: RefCell::new(None),
            teardown: RefCell::new(None),
            halves: RefCell::new(Vec::new()),
            has_readable: Cell::new(false),
            has_writable: Cell::new(false),
            end_emitted: Cell::new(false),
            finished: Cell::new(false),
            close_waiters: RefCell::new(Vec::new()),
        })
    }

    pub(crate) fn attach_readable(&self, half: Weak<dyn Half>) {
        self.has_readable.set(true);
        self.halves.borrow_mut().push(half);
    }

    pub(crate) fn attach_writable(&self, half: Weak<dyn Half>) {
        self.has_writable.set(true);
        self.halves.borrow_mut().push(half);
    }

    pub(crate) fn set_teardown(&self, hook: Box<dyn Teardownable>) {
        *self.teardown.borrow_mut() = Some(hook);
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    pub(crate) fn is_constructed(&self) -> bool {
        self.constructed.get()
    }

    pub(crate) fn close_emitted(&self) -> bool {
        self.close_emitted.get()
    }

    pub(crate) fn error_emitted(&self) -> bool {
        self.error_emitted.get()
    }

    pub(crate) fn errored(&self) -> Option<StreamError> {
        self.errored.borrow().clone()
    }

    pub(crate) fn is_errored(&self) -> bool {
        self.errored.borrow().is_some()
    }

    pub(crate) fn set_errored(&self, err: &StreamError) {
        let mut errored = self.errored.borrow_mut();
        if errored.is_none() {
            *errored = Some(err.clone());
        }
    }

    pub(crate) fn end_emitted(&self) -> bool {
        self.end_emitted.get()
    }

    pub(crate) fn mark_end_emitted(&self) {
        self.end_emitted.set(true);
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.get()
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.set(true);
    }

    pub(crate) fn on(&self, listener: Rc<dyn Fn(&Event)>) -> ListenerId {
        self.events.add(listener)
    }

    pub(crate) fn off(&self, id: ListenerId) -> bool {
        self.events.remove(id)
    }

    pub(crate) fn emit(&self, event: Event) {
        self.events.emit_event(event);
    }

    pub(crate) fn emit_deferred(self: &Rc<Self>, event: Event) {
        let this = self.clone();
        self.scheduler.defer(move || this.emit(event));
    }

    /// Runs `hook` on the next turn. Until it completes the stream reports itself as not
    /// constructed. A stream destroyed first never runs the hook.
    pub(crate) fn construct(self: &Rc<Self>, hook: Box<dyn Constructable>) {
        self.constructed.set(false);
        let this = self.clone();
        self.scheduler.defer(move || {
            if this.destroyed.get() {
                return;
            }
            let weak = Rc::downgrade(&this);
            let done = Done::new("construct", move |result| {
                if let Some(lifecycle) = weak.upgrade() {
                    let scheduler = lifecycle.scheduler.clone();
                    scheduler.defer(move || lifecycle.on_constructed(result));
                }
            });
            tracing::trace!("construct");
            hook.construct(done);
        });
    }

    fn on_constructed(self: &Rc<Self>, result: Result<(), StreamError>) {
        if self.destroyed.get() {
            return;
        }
        match result {
            Ok(()) => {
                tracing::debug!("constructed");
                self.constructed.set(true);
                for half in self.live_halves() {
                    half.on_constructed();
                }
            }
            Err(err) => {
                tracing::debug!(error = %err, "construct failed");
                self.error_or_destroy(err);
            }
        }
    }

    /// Every present half reached its natural end.
    pub(crate) fn completed(&self) -> bool {
        (!self.has_readable.get() || self.end_emitted.get())
            && (!self.has_writable.get() || self.finished.get())
    }

    /// Destroys once both halves completed, when configured to.
    pub(crate) fn maybe_auto_destroy(self: &Rc<Self>) {
        if self.auto_destroy.get() && !self.destroyed.get() && self.completed() {
            tracing::debug!("auto destroy");
            self.destroy(None);
        }
    }

    /// Idempotent destroy. See [`Lifecycle::try_destroy`] for the checked variant.
    pub(crate) fn destroy(self: &Rc<Self>, err: Option<StreamError>) {
        if let Err(violation) = self.try_destroy(err) {
            tracing::debug!(error = %violation, "ignoring repeated destroy");
        }
    }

    /// Like `destroy`, but reports a repeated destroy that carries a different error.
    pub(crate) fn try_destroy(self: &Rc<Self>, err: Option<StreamError>) -> Result<(), StreamError> {
        if self.destroyed.get() {
            let first = self.destroy_error.borrow();
            return match (&err, first.as_ref()) {
                (Some(new), Some(first)) if new == first => Ok(()),
                (Some(_), _) => Err(StreamError::Destroyed("destroy")),
                (None, _) => Ok(()),
            };
        }

        tracing::debug!(error = ?err, "destroy");

        if let Some(err) = &err {
            self.set_errored(err);
        }
        *self.destroy_error.borrow_mut() = err.clone();
        self.destroyed.set(true);

        for half in self.live_halves() {
            half.on_destroy();
        }

        let done = TeardownDone {
            lifecycle: Some(self.clone()),
            graceful: false,
        };
        let hook = self.teardown.borrow_mut().take();
        match hook {
            Some(hook) => hook.teardown(err, done),
            None => done.complete(err),
        }

        Ok(())
    }

    /// Reports `err` by destroying when auto destroy is on, or by emitting `Error` otherwise.
    pub(crate) fn error_or_destroy(self: &Rc<Self>, err: StreamError) {
        if self.destroyed.get() {
            return;
        }

        if self.auto_destroy.get() {
            self.destroy(Some(err));
        } else {
            self.set_errored(&err);
            let this = self.clone();
            self.scheduler.defer(move || this.emit_error(err));
        }
    }

    /// Drop-time disposal: completed streams close quietly, others abort.
    pub(crate) fn dispose(self: &Rc<Self>) {
        if self.destroyed.get() {
            return;
        }
        let err = (!self.completed()).then_some(StreamError::Aborted);
        self.destroy(err);
    }

    fn on_teardown_done(self: &Rc<Self>, err: Option<StreamError>, graceful: bool) {
        tracing::debug!(error = ?err, graceful, "teardown complete");
        if let Some(err) = &err {
            self.set_errored(err);
        }

        let this = self.clone();
        self.scheduler.defer(move || {
            if graceful {
                for half in this.live_halves() {
                    half.complete_gracefully();
                }
            }
            if let Some(err) = err {
                this.emit_error(err);
            }
            this.emit_close();
        });
    }

    fn emit_error(&self, err: StreamError) {
        if self.error_emitted.get() {
            return;
        }
        self.error_emitted.set(true);
        self.emit(Event::Error(err));
    }

    fn emit_close(&self) {
        if self.close_emitted.get() {
            return;
        }
        self.close_emitted.set(true);
        if self.emit_close.get() {
            self.emit(Event::Close);
        }

        for half in self.live_halves() {
            half.on_close();
        }

        let outcome = match self.errored() {
            Some(err) => Err(err),
            None => Ok(()),
        };
        for waiter in self.close_waiters.borrow_mut().drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }

    /// Resolves once close was emitted, with the stream's error if it had one.
    pub(crate) fn closed(self: &Rc<Self>) -> impl Future<Output = Result<(), StreamError>> {
        if self.close_emitted.get() {
            let outcome = match self.errored() {
                Some(err) => Err(err),
                None => Ok(()),
            };
            return Either::Left(futures::future::ready(outcome));
        }

        let (tx, rx) = oneshot::channel();
        self.close_waiters.borrow_mut().push(tx);
        Either::Right(rx.map(|outcome| outcome.unwrap_or(Err(StreamError::PrematureClose))))
    }

    /// Resolves when `done_event` fires, or with the error or premature close that came
    /// first.
    pub(crate) fn completion(
        self: &Rc<Self>,
        is_done: fn(&Lifecycle) -> bool,
        done_event: Event,
    ) -> impl Future<Output = Result<(), StreamError>> {
        if is_done(self) {
            return Either::Left(futures::future::ready(Ok(())));
        }
        if self.error_emitted.get() || self.close_emitted.get() {
            let err = self.errored().unwrap_or(StreamError::PrematureClose);
            return Either::Left(futures::future::ready(Err(err)));
        }

        let (tx, rx) = oneshot::channel();
        let tx = RefCell::new(Some(tx));
        let id_slot = Rc::new(Cell::new(None));
        let weak = Rc::downgrade(self);

        let slot = id_slot.clone();
        let id = self.on(Rc::new(move |event: &Event| {
            let outcome = match event {
                event if *event == done_event => Ok(()),
                Event::Error(err) => Err(err.clone()),
                Event::Close => Err(StreamError::PrematureClose),
                _ => return,
            };
            if let Some(tx) = tx.borrow_mut().take() {
                let _ = tx.send(outcome);
            }
            if let (Some(lifecycle), Some(id)) = (weak.upgrade(), slot.take()) {
                lifecycle.off(id);
            }
        }));
        id_slot.set(Some(id));

        Either::Right(rx.map(|outcome| outcome.unwrap_or(Err(StreamError::PrematureClose))))
    }

    fn live_halves(&self) -> Vec<Rc<dyn Half>> {
        self.halves
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

/// Destroys its stream when dropped, unless the stream already was.
///
/// A stream that has not completed is destroyed with [`StreamError::Aborted`].
#[must_use = "the stream is destroyed as soon as the guard is dropped"]
pub struct DisposeGuard {
    lifecycle: Rc<Lifecycle>,
}

impl DisposeGuard {
    pub(crate) fn new(lifecycle: Rc<Lifecycle>) -> Self {
        Self { lifecycle }
    }
}

impl Drop for DisposeGuard {
    fn drop(&mut self) {
        self.lifecycle.dispose();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use super::*;
    use crate::test_utils::EventLog;

    fn lifecycle(scheduler: &Scheduler) -> (Rc<Lifecycle>, EventLog) {
        let lifecycle = Lifecycle::new(scheduler.clone(), true, true);
        let log = EventLog::new();
        lifecycle.on(Rc::new(log.recorder()));
        (lifecycle, log)
    }

    #[test]
    fn destroy_twice_closes_once() {
        let scheduler = Scheduler::new();
        let (lifecycle, log) = lifecycle(&scheduler);

        lifecycle.destroy(None);
        lifecycle.destroy(None);
        scheduler.run_until_idle();

        assert_eq!(log.names(), vec!["close"]);
    }

    #[test]
    fn destroy_with_error_emits_error_then_close() {
        let scheduler = Scheduler::new();
        let (lifecycle, log) = lifecycle(&scheduler);
        let err = StreamError::msg("kaboom");

        lifecycle.destroy(Some(err.clone()));
        assert!(log.names().is_empty(), "notifications are deferred");
        scheduler.run_until_idle();

        assert_eq!(log.events(), vec![Event::Error(err), Event::Close]);
    }

    #[test]
    fn teardown_runs_once_and_can_swallow_the_error() {
        let scheduler = Scheduler::new();
        let (lifecycle, log) = lifecycle(&scheduler);
        let calls = Rc::new(RefCell::new(Vec::new()));

        let c = calls.clone();
        lifecycle.set_teardown(Box::new(move |err: Option<StreamError>, done: TeardownDone| {
            c.borrow_mut().push(err);
            done.ok();
        }));

        let err = StreamError::msg("kaboom");
        lifecycle.destroy(Some(err.clone()));
        lifecycle.destroy(Some(err.clone()));
        scheduler.run_until_idle();

        assert_eq!(*calls.borrow(), vec![Some(err)]);
        assert_eq!(log.names(), vec!["close"]);
    }

    #[test]
    fn close_waits_for_teardown_completion() {
        let scheduler = Scheduler::new();
        let (lifecycle, log) = lifecycle(&scheduler);
        let parked = Rc::new(RefCell::new(None));

        let p = parked.clone();
        lifecycle.set_teardown(Box::new(move |_err: Option<StreamError>, done: TeardownDone| {
            *p.borrow_mut() = Some(done);
        }));

        lifecycle.destroy(None);
        scheduler.run_until_idle();
        assert!(log.names().is_empty());

        let done = parked.borrow_mut().take().unwrap();
        done.ok();
        scheduler.run_until_idle();
        assert_eq!(log.names(), vec!["close"]);
    }

    #[test]
    fn failed_construct_destroys_the_stream() {
        let scheduler = Scheduler::new();
        let (lifecycle, log) = lifecycle(&scheduler);
        let err = StreamError::msg("no such file");

        let e = err.clone();
        lifecycle.construct(Box::new(move |done: Done| done.fail(e)));
        assert!(!lifecycle.is_constructed());
        scheduler.run_until_idle();

        assert!(lifecycle.is_destroyed());
        assert!(!lifecycle.is_constructed());
        assert_eq!(log.events(), vec![Event::Error(err), Event::Close]);
    }

    #[test]
    fn construct_is_skipped_once_destroyed() {
        let scheduler = Scheduler::new();
        let (lifecycle, log) = lifecycle(&scheduler);
        let ran = Rc::new(Cell::new(false));

        let r = ran.clone();
        lifecycle.construct(Box::new(move |done: Done| {
            r.set(true);
            done.ok();
        }));
        lifecycle.destroy(None);
        scheduler.run_until_idle();

        assert!(!ran.get());
        assert_eq!(log.names(), vec!["close"]);
    }

    #[test]
    fn repeated_destroy_with_a_different_error_is_reported() {
        let scheduler = Scheduler::new();
        let (lifecycle, _log) = lifecycle(&scheduler);
        let first = StreamError::msg("first");

        assert!(lifecycle.try_destroy(Some(first.clone())).is_ok());
        assert!(lifecycle.try_destroy(Some(first)).is_ok());
        assert!(lifecycle.try_destroy(None).is_ok());
        assert_eq!(
            lifecycle.try_destroy(Some(StreamError::msg("second"))),
            Err(StreamError::Destroyed("destroy"))
        );
    }

    #[test]
    fn dispose_aborts_an_incomplete_stream() {
        let scheduler = Scheduler::new();
        let (lifecycle, log) = lifecycle(&scheduler);
        lifecycle.has_writable.set(true);

        drop(DisposeGuard::new(lifecycle.clone()));
        scheduler.run_until_idle();

        assert_eq!(log.events(), vec![Event::Error(StreamError::Aborted), Event::Close]);
    }

    #[test]
    fn dispose_closes_a_completed_stream_quietly() {
        let scheduler = Scheduler::new();
        let (lifecycle, log) = lifecycle(&scheduler);
        lifecycle.has_writable.set(true);
        lifecycle.mark_finished();

        drop(DisposeGuard::new(lifecycle.clone()));
        scheduler.run_until_idle();

        assert_eq!(log.names(), vec!["close"]);
    }

    #[tokio::test]
    async fn closed_resolves_with_the_error() {
        let scheduler = Scheduler::new();
        let (lifecycle, _log) = lifecycle(&scheduler);
        let err = StreamError::msg("kaboom");

        let closed = lifecycle.closed();
        lifecycle.destroy(Some(err.clone()));

        assert_eq!(scheduler.run_until(closed).await, Err(err));
    }
}
