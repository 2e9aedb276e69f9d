use std::sync::Arc;

use modkeep_domain::ManifestId;

use crate::core::audit::OperationKind;

/// Notifications published after each orchestrated step. Subscribers are
/// invoked synchronously and must not block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconciliationEvent {
    Started {
        operation: OperationKind,
        manifests: Vec<ManifestId>,
    },
    ContentRemoving {
        manifest: ManifestId,
    },
    Completed {
        operation: OperationKind,
        operation_id: String,
        success: bool,
    },
}

/// Port for operation notifications; implementers choose channels,
/// callbacks, or an observer list.
pub trait NotificationSink: Send + Sync {
    fn publish(&self, event: &ReconciliationEvent);
}

/// Sink that drops every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn publish(&self, _event: &ReconciliationEvent) {}
}

/// Observer list fanning each event out to every registered sink.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, sink: Arc<dyn NotificationSink>) {
        self.sinks.push(sink);
    }
}

impl NotificationSink for FanoutSink {
    fn publish(&self, event: &ReconciliationEvent) {
        for sink in &self.sinks {
            sink.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl NotificationSink for Counter {
        fn publish(&self, _event: &ReconciliationEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn fanout_delivers_to_every_subscriber() {
        let first = Arc::new(Counter::default());
        let second = Arc::new(Counter::default());
        let mut fanout = FanoutSink::new();
        fanout.subscribe(first.clone());
        fanout.subscribe(second.clone());

        fanout.publish(&ReconciliationEvent::Completed {
            operation: OperationKind::ManifestRemoval,
            operation_id: "op".to_string(),
            success: true,
        });
        assert_eq!(first.0.load(Ordering::SeqCst), 1);
        assert_eq!(second.0.load(Ordering::SeqCst), 1);
    }
}
