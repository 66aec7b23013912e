//! Structured notifications about everything channels do.
//!
//! Every notification goes to the configured [`NotificationSink`] (by default
//! [`TracingSink`], which turns them into `tracing` events) and to anyone holding
//! a receiver from [`crate::client::Registry::subscribe_notifications`].

use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, trace, warn};

use super::state::StateChangeKind;
use crate::{
    dbr::DbrType,
    transport::{ChannelId, ContextId, ErrorCondition, RequestKind},
};

/// The broad class of a notification, which decides its log level
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    /// Channel creation, connection changes, state transitions, teardown
    Lifecycle,
    /// Requests being issued and answered
    Progress,
    /// Something unexpected or a misuse of the API
    Anomaly,
    /// Client context and callback routing
    Comms,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Registered,
    Deregistered,
    Transition {
        sequence_number: u64,
        change: StateChangeKind,
    },
    Invalidated(String),
    Disposed,

    ConnectRequested,
    SubscriptionRequested(DbrType),
    SubscriptionDeferred,
    Unsubscribed,
    GetIssued { ioid: u32, record_type: DbrType },
    PutIssued { ioid: Option<u32>, element_count: usize },
    WriteCompleted { ioid: u32, status: ErrorCondition },
    ValueUnavailable,

    RedundantGet,
    DoubleDispose,
    OperationOnInvalid(&'static str),
    AccessModeDowngraded { field: String },
    ListenerPanicked(String),
    UnknownFieldType(u16),
    DecodeFailed(String),
    TransportFailure(String),
    ServerError(ErrorCondition),

    ContextAttached(ContextId),
    ContextReattached { from: ContextId, to: ContextId },
    UnroutedCallback(RequestKind),
    LateCompletion(RequestKind),
}

impl Event {
    pub fn kind(&self) -> NotificationKind {
        match self {
            Event::Registered
            | Event::Deregistered
            | Event::Transition { .. }
            | Event::Invalidated(_)
            | Event::Disposed => NotificationKind::Lifecycle,
            Event::ConnectRequested
            | Event::SubscriptionRequested(_)
            | Event::SubscriptionDeferred
            | Event::Unsubscribed
            | Event::GetIssued { .. }
            | Event::PutIssued { .. }
            | Event::WriteCompleted { .. }
            | Event::ValueUnavailable => NotificationKind::Progress,
            Event::RedundantGet
            | Event::DoubleDispose
            | Event::OperationOnInvalid(_)
            | Event::AccessModeDowngraded { .. }
            | Event::ListenerPanicked(_)
            | Event::UnknownFieldType(_)
            | Event::DecodeFailed(_)
            | Event::TransportFailure(_)
            | Event::ServerError(_) => NotificationKind::Anomaly,
            Event::ContextAttached(_)
            | Event::ContextReattached { .. }
            | Event::UnroutedCallback(_)
            | Event::LateCompletion(_) => NotificationKind::Comms,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Not set for callbacks that could not be routed to a channel
    pub channel: Option<ChannelId>,
    pub pv: String,
    pub event: Event,
}

impl Notification {
    pub fn kind(&self) -> NotificationKind {
        self.event.kind()
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.channel {
            Some(cid) => write!(f, "[{cid}:{}] {:?}", self.pv, self.event),
            None => write!(f, "[{}] {:?}", self.pv, self.event),
        }
    }
}

/// Somewhere to send notifications
///
/// Called synchronously, often from the transport I/O thread. A sink may look
/// at the registry but must not perform operations on channels.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Emits each notification as a `tracing` event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, notification: &Notification) {
        match notification.kind() {
            NotificationKind::Lifecycle => debug!("{notification}"),
            NotificationKind::Progress | NotificationKind::Comms => trace!("{notification}"),
            NotificationKind::Anomaly => warn!("{notification}"),
        }
    }
}

/// Keeps every notification, for inspection in tests
#[derive(Debug, Default)]
pub struct RecordingSink {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
    pub fn notifications(&self) -> Vec<Notification> {
        self.seen.lock().clone()
    }
    pub fn events_for(&self, pv: &str) -> Vec<Event> {
        self.seen
            .lock()
            .iter()
            .filter(|n| n.pv == pv)
            .map(|n| n.event.clone())
            .collect()
    }
    pub fn of_kind(&self, kind: NotificationKind) -> Vec<Notification> {
        self.seen
            .lock()
            .iter()
            .filter(|n| n.kind() == kind)
            .cloned()
            .collect()
    }
    pub fn count(&self, matches: impl Fn(&Event) -> bool) -> usize {
        self.seen.lock().iter().filter(|n| matches(&n.event)).count()
    }
    pub fn clear(&self) {
        self.seen.lock().clear();
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, notification: &Notification) {
        self.seen.lock().push(notification.clone());
    }
}

/// Fans notifications out to the sink and the broadcast channel
#[derive(Clone)]
pub(crate) struct Notifier {
    sink: Arc<dyn NotificationSink>,
    broadcast: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotificationSink>, capacity: usize) -> Self {
        Notifier {
            sink,
            broadcast: broadcast::Sender::new(capacity.max(1)),
        }
    }

    pub fn emit(&self, channel: Option<ChannelId>, pv: &str, event: Event) {
        let notification = Notification {
            channel,
            pv: pv.to_owned(),
            event,
        };
        if catch_unwind(AssertUnwindSafe(|| self.sink.notify(&notification))).is_err() {
            error!("Notification sink panicked while handling: {notification}");
        }
        // Nobody listening is fine
        let _ = self.broadcast.send(notification);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.broadcast.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_recording() {
        let sink = RecordingSink::new();
        let notifier = Notifier::new(sink.clone(), 4);
        let mut rx = notifier.subscribe();
        notifier.emit(Some(ChannelId(1)), "A", Event::RedundantGet);
        notifier.emit(Some(ChannelId(1)), "A", Event::ConnectRequested);
        notifier.emit(None, "?", Event::UnroutedCallback(RequestKind::Connection));

        assert_eq!(sink.notifications().len(), 3);
        assert_eq!(sink.of_kind(NotificationKind::Anomaly).len(), 1);
        assert_eq!(sink.events_for("A"), vec![Event::RedundantGet, Event::ConnectRequested]);
        assert_eq!(rx.try_recv().unwrap().event, Event::RedundantGet);
    }

    struct Exploding;
    impl NotificationSink for Exploding {
        fn notify(&self, _: &Notification) {
            panic!("sink failure");
        }
    }

    #[test]
    fn panicking_sink_is_contained() {
        let notifier = Notifier::new(Arc::new(Exploding), 4);
        let mut rx = notifier.subscribe();
        notifier.emit(None, "B", Event::Disposed);
        assert_eq!(rx.try_recv().unwrap().event, Event::Disposed);
    }
}
