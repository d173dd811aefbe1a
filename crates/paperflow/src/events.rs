//! Scan lifecycle events and the bus that delivers them.

use std::sync::{Arc, RwLock};

use crate::error::{ErrorKind, ScanError};
use crate::processed::ProcessedImage;

/// One lifecycle or progress notification of a `scan` call.
///
/// Page numbers start at 1 and increase once per started page.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    ScanStart,
    PageStart { page: u32 },
    PageProgress { page: u32, progress: f64 },
    PageEnd { page: u32, image: ProcessedImage },
    ScanError { kind: ErrorKind, message: String },
    /// Fired exactly once per scan, whatever the outcome.
    ScanEnd { pages: u32 },
}

impl ScanEvent {
    pub fn error(err: &ScanError) -> Self {
        ScanEvent::ScanError {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

type Listener = Arc<dyn Fn(&ScanEvent) + Send + Sync>;

/// Subscribers to the events of one controller.
#[derive(Clone, Default)]
pub struct ScanEventBus {
    listeners: Arc<RwLock<Vec<Listener>>>,
}

impl ScanEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: impl Fn(&ScanEvent) + Send + Sync + 'static) {
        let mut listeners = match self.listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        listeners.push(Arc::new(listener));
    }

    /// Deliver `event` to every subscriber, in subscription order.
    pub fn emit(&self, event: &ScanEvent) {
        // Snapshot so listeners may subscribe from inside a callback.
        let listeners: Vec<Listener> = match self.listeners.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        match self.listeners.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl std::fmt::Debug for ScanEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanEventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn events_reach_every_subscriber_in_order() {
        let bus = ScanEventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b"] {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |event| {
                if let ScanEvent::PageStart { page } = event {
                    seen.lock().unwrap().push(format!("{}{}", tag, page));
                }
            });
        }

        bus.emit(&ScanEvent::PageStart { page: 1 });
        bus.emit(&ScanEvent::ScanEnd { pages: 1 });
        assert_eq!(*seen.lock().unwrap(), vec!["a1", "b1"]);
    }

    #[test]
    fn clones_share_subscribers() {
        let bus = ScanEventBus::new();
        let other = bus.clone();
        other.subscribe(|_| {});
        assert_eq!(bus.listener_count(), 1);
    }

    #[test]
    fn error_events_carry_the_classification() {
        let event = ScanEvent::error(&ScanError::validation("dpi out of range"));
        match event {
            ScanEvent::ScanError { kind, message } => {
                assert_eq!(kind, ErrorKind::Validation);
                assert!(message.contains("dpi"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
