use std::{cell::RefCell, rc::Rc, sync::Once};

use crate::events::Event;

static INIT_LOGGING: Once = Once::new();

/// Routes `tracing` output through the test harness. Filter with `RUST_LOG`.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Ordered record of notifications and hook calls, shared by clones.
#[derive(Clone, Default)]
pub struct EventLog {
    entries: Rc<RefCell<Vec<String>>>,
    events: Rc<RefCell<Vec<Event>>>,
}

impl EventLog {
    pub fn new() -> Self {
        init_test_logging();
        Self::default()
    }

    /// Listener that records every lifecycle notification.
    pub fn recorder(&self) -> impl Fn(&Event) + 'static {
        let log = self.clone();
        move |event| {
            log.entries.borrow_mut().push(event.name().to_string());
            log.events.borrow_mut().push(event.clone());
        }
    }

    /// Records a free-form entry, e.g. a hook invocation.
    pub fn note(&self, entry: impl Into<String>) {
        self.entries.borrow_mut().push(entry.into());
    }

    /// Notification names and notes, in order.
    pub fn names(&self) -> Vec<String> {
        self.entries.borrow().clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
        self.events.borrow_mut().clear();
    }
}
