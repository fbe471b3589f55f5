//! Cooperative, single-threaded task queue.
//!
//! Every consumer-visible notification in this crate is deferred through a [`Scheduler`]
//! rather than fired inline, so nothing a hook does can re-enter the state machine that
//! invoked it. Two kinds of work are queued:
//!
//! - ticks: plain closures, run in FIFO order, each on a later "turn" than the code that
//!   queued it;
//! - local futures: async producers and mappers, polled whenever they are woken.
//!
//! Tests drive the queue deterministically with [`Scheduler::run_until_idle`]; async code
//! drives it with [`Scheduler::run_until`] or [`Scheduler::run`] from inside any executor.

use std::{
    cell::RefCell,
    collections::VecDeque,
    future::Future,
    pin::pin,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use futures::{
    future::{poll_fn, LocalBoxFuture},
    stream::FuturesUnordered,
    task::{waker, ArcWake, AtomicWaker},
    FutureExt, StreamExt,
};

type Tick = Box<dyn FnOnce()>;

/// Handle to a cooperative task queue. Cloning shares the queue.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<Inner>,
}

struct Inner {
    ticks: RefCell<VecDeque<Tick>>,
    tasks: RefCell<FuturesUnordered<LocalBoxFuture<'static, ()>>>,
    spawned: RefCell<Vec<LocalBoxFuture<'static, ()>>>,
    wake: Arc<Wake>,
}

struct Wake {
    woken: AtomicBool,
    outer: AtomicWaker,
}

impl ArcWake for Wake {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.woken.store(true, Ordering::SeqCst);
        arc_self.outer.wake();
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(Inner {
                ticks: RefCell::new(VecDeque::new()),
                tasks: RefCell::new(FuturesUnordered::new()),
                spawned: RefCell::new(Vec::new()),
                wake: Arc::new(Wake {
                    woken: AtomicBool::new(false),
                    outer: AtomicWaker::new(),
                }),
            }),
        }
    }

    /// Queues `f` to run on a later turn.
    pub fn defer(&self, f: impl FnOnce() + 'static) {
        self.inner.ticks.borrow_mut().push_back(Box::new(f));
        self.inner.wake.outer.wake();
    }

    /// Adds a future to the local task set. It is first polled on the next turn.
    pub fn spawn_local(&self, fut: impl Future<Output = ()> + 'static) {
        self.inner.spawned.borrow_mut().push(fut.boxed_local());
        ArcWake::wake_by_ref(&self.inner.wake);
    }

    /// True when no tick is queued and no local future is alive.
    pub fn is_idle(&self) -> bool {
        self.inner.ticks.borrow().is_empty()
            && self.inner.spawned.borrow().is_empty()
            && self.inner.tasks.borrow().is_empty()
    }

    /// Runs queued work until nothing is runnable without outside help.
    ///
    /// Local futures waiting on timers or I/O stay parked; use [`Scheduler::run`] for those.
    pub fn run_until_idle(&self) {
        let waker = waker(self.inner.wake.clone());
        let mut cx = Context::from_waker(&waker);
        self.turn(&mut cx);
    }

    /// Drives the queue while waiting for `fut`, returning its output.
    ///
    /// Must not be nested inside a tick or local task of the same scheduler.
    pub async fn run_until<F: Future>(&self, fut: F) -> F::Output {
        let mut fut = pin!(fut);
        let waker = waker(self.inner.wake.clone());

        poll_fn(|cx| {
            self.inner.wake.outer.register(cx.waker());
            let mut inner_cx = Context::from_waker(&waker);

            loop {
                self.turn(&mut inner_cx);

                if let Poll::Ready(output) = fut.as_mut().poll(&mut inner_cx) {
                    return Poll::Ready(output);
                }

                if !self.has_runnable_work() {
                    return Poll::Pending;
                }
            }
        })
        .await
    }

    /// Drives the queue until every tick ran and every local future finished.
    pub async fn run(&self) {
        let this = self.clone();
        self.run_until(poll_fn(move |_| {
            if this.is_idle() {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        }))
        .await
    }

    fn has_runnable_work(&self) -> bool {
        !self.inner.ticks.borrow().is_empty()
            || !self.inner.spawned.borrow().is_empty()
            || self.inner.wake.woken.load(Ordering::SeqCst)
    }

    fn turn(&self, cx: &mut Context<'_>) {
        loop {
            let ran = self.run_ticks();
            let woken = self.inner.wake.woken.swap(false, Ordering::SeqCst);
            let spawned = !self.inner.spawned.borrow().is_empty();

            if woken || spawned {
                self.poll_tasks(cx);
            }

            if ran == 0 && !woken && !spawned {
                return;
            }
        }
    }

    fn run_ticks(&self) -> usize {
        let mut ran = 0;
        loop {
            let tick = self.inner.ticks.borrow_mut().pop_front();
            match tick {
                Some(tick) => {
                    tick();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    fn poll_tasks(&self, cx: &mut Context<'_>) {
        let spawned: Vec<_> = self.inner.spawned.borrow_mut().drain(..).collect();
        let mut tasks = self.inner.tasks.borrow_mut();
        if !spawned.is_empty() {
            tracing::trace!(count = spawned.len(), "scheduling local tasks");
            tasks.extend(spawned);
        }

        while let Poll::Ready(Some(())) = tasks.poll_next_unpin(cx) {}
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc, time::Duration};

    use super::*;

    #[test]
    fn ticks_run_in_fifo_order_on_a_later_turn() {
        let scheduler = Scheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let l = log.clone();
        let s = scheduler.clone();
        scheduler.defer(move || {
            l.borrow_mut().push(1);
            let l = l.clone();
            s.defer(move || l.borrow_mut().push(3));
        });
        let l = log.clone();
        scheduler.defer(move || l.borrow_mut().push(2));

        assert!(log.borrow().is_empty());
        scheduler.run_until_idle();
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn local_tasks_interleave_with_ticks() {
        let scheduler = Scheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let (tx, rx) = futures::channel::oneshot::channel::<u32>();

        let l = log.clone();
        scheduler.spawn_local(async move {
            let value = rx.await.unwrap_or_default();
            l.borrow_mut().push(value);
        });

        let l = log.clone();
        scheduler.defer(move || {
            l.borrow_mut().push(1);
            let _ = tx.send(2);
        });

        scheduler.run_until_idle();
        assert_eq!(*log.borrow(), vec![1, 2]);
        assert!(scheduler.is_idle());
    }

    #[tokio::test]
    async fn run_waits_for_timers() {
        let scheduler = Scheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let l = log.clone();
        scheduler.spawn_local(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            l.borrow_mut().push("slept");
        });

        scheduler.run_until_idle();
        assert!(log.borrow().is_empty());

        scheduler.run().await;
        assert_eq!(*log.borrow(), vec!["slept"]);
    }

    #[tokio::test]
    async fn run_until_returns_output() {
        let scheduler = Scheduler::new();
        let (tx, rx) = futures::channel::oneshot::channel();
        scheduler.defer(move || {
            let _ = tx.send(42);
        });

        assert_eq!(scheduler.run_until(rx).await, Ok(42));
    }
}
