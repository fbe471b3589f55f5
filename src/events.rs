use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use crate::error::StreamError;

/// Lifecycle notifications. Data delivery is observed separately because it carries a
/// typed chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Data (or end-of-data) is available to `read()`.
    Readable,
    /// End-of-data was consumed.
    End,
    Resume,
    Pause,
    /// The write buffer emptied after `write` reported backpressure.
    Drain,
    /// Every write completed and the finalize hook is about to run.
    Prefinish,
    Finish,
    Close,
    Error(StreamError),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Readable => "readable",
            Event::End => "end",
            Event::Resume => "resume",
            Event::Pause => "pause",
            Event::Drain => "drain",
            Event::Prefinish => "prefinish",
            Event::Finish => "finish",
            Event::Close => "close",
            Event::Error(_) => "error",
        }
    }
}

/// Handle returned by subscription calls, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(usize);

/// Ordered list of subscribers for one kind of payload.
///
/// Listeners are snapshotted before dispatch, so a listener may subscribe, unsubscribe, or
/// call back into the stream while it runs.
pub(crate) struct Listeners<E: ?Sized> {
    entries: RefCell<Vec<(ListenerId, Rc<dyn Fn(&E)>)>>,
    next_id: Cell<usize>,
}

impl<E: ?Sized> Default for Listeners<E> {
    fn default() -> Self {
        Self {
            entries: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
        }
    }
}

impl<E: ?Sized> Listeners<E> {
    pub(crate) fn add(&self, listener: Rc<dyn Fn(&E)>) -> ListenerId {
        let id = ListenerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.entries.borrow_mut().push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub(crate) fn emit(&self, payload: &E) {
        let snapshot: Vec<_> = self
            .entries
            .borrow()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in snapshot {
            listener(payload);
        }
    }
}

impl Listeners<Event> {
    pub(crate) fn emit_event(&self, event: Event) {
        tracing::trace!(event = event.name(), listeners = self.len(), "emit");
        if let Event::Error(err) = &event {
            if self.is_empty() {
                tracing::warn!(error = %err, "stream error with no error listener");
            }
        }
        self.emit(&event);
    }
}
