//! Shared, reference-counted channels and the operations on them.
//!
//! A [`Registry`] owns the channels for one client context. Each channel is a
//! state machine whose current state is published as an immutable
//! [`ChannelSnapshot`]; every transition bumps the snapshot's sequence number
//! and is announced to listeners, watchers and the notification sink.

mod channel;
mod context;
mod name;
mod notify;
mod receivers;
mod registry;
mod state;
mod value;
mod wait;

pub use channel::{
    Channel, ConnectOutcome, ListenerToken, PutOutcome, PutRejection, ReadOutcome,
    SubscribeOutcome, SubscriptionState,
};
pub use context::{Attach, ClientContext};
pub use name::{ChannelName, DEFAULT_FIELD, MAX_NAME_LENGTH, NameError};
pub use notify::{
    Event, Notification, NotificationKind, NotificationSink, RecordingSink, TracingSink,
};
pub use receivers::{NotificationReceiver, NotificationRecvError, NotificationTryRecvError};
pub use registry::{ChannelInfo, Registry};
pub use state::{
    ChannelSnapshot, ConnectionReason, ConnectionState, StateChange, StateChangeKind,
    StateRecord, Validity,
};
pub use value::{EncodeError, FieldDescriptor, ValueEnvelope, decode, decode_tagged, encode_put};
pub use wait::{CompletionSignal, SignalWaiter, WaitOutcome};
