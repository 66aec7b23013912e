//! The boundary between the channel core and whatever moves bytes to a server.
//!
//! Discovery and virtual-circuit framing live behind [`Transport`]. The core only
//! ever issues requests through it, and receives responses back through the
//! [`TransportCallbacks`] it installs. Every request carries a [`UserTag`], which
//! the transport hands back unchanged with the response so it can be routed to
//! the right channel.

pub mod condition;
pub mod loopback;

use std::sync::Weak;

use thiserror::Error;

pub use condition::{ErrorCondition, ErrorSeverity};

/// Identifies a channel within one registry; also the routing key of callbacks
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a client context. Threads attach to one context at a time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ContextId(pub u64);

/// What a response is answering
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Connection,
    Subscription,
    Get(u32),
    Put(u32),
}

/// Opaque tag attached to every request, returned unchanged with its response
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct UserTag {
    pub channel: ChannelId,
    pub kind: RequestKind,
}

impl UserTag {
    pub fn new(channel: ChannelId, kind: RequestKind) -> Self {
        UserTag { channel, kind }
    }
}

/// Transport handle of a created channel
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct WireHandle(pub u64);

/// Transport handle of an active subscription
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

/// What the transport knows about a connected channel's native field
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    /// Raw native type tag, as reported by the server
    pub type_tag: u16,
    pub element_count: usize,
    pub writable: bool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Calling thread is not attached to a client context")]
    NotAttached,
    #[error("Thread is attached to a different client context")]
    WrongContext,
    #[error("Unknown wire handle")]
    UnknownHandle,
    #[error("Channel is not connected")]
    NotConnected,
    #[error("Request refused: {0}")]
    Refused(ErrorCondition),
    #[error("Transport has shut down")]
    Closed,
}

/// Receiver of inbound events, installed once into the transport
///
/// All methods are called from the transport's single I/O thread.
pub trait TransportCallbacks: Send + Sync {
    fn connection_changed(&self, tag: UserTag, up: bool);
    /// A get or subscription response. `payload` is `None` when the server
    /// answered the request with an error `status`.
    fn value_update(
        &self,
        tag: UserTag,
        record_type: u16,
        element_count: usize,
        status: ErrorCondition,
        payload: Option<&[u8]>,
    );
    fn write_completed(&self, tag: UserTag, status: ErrorCondition);
}

/// The requests the channel core makes of the virtual-circuit layer
///
/// Requests may be buffered by the transport until [`Transport::flush`]. All
/// requests except attach/detach must be made from a thread attached to a
/// context; see [`crate::client::ClientContext`].
pub trait Transport: Send + Sync {
    fn attach_context(&self, context: ContextId) -> Result<(), TransportError>;
    fn detach_context(&self);

    fn create_channel(&self, name: &str, tag: UserTag) -> Result<WireHandle, TransportError>;
    fn clear_channel(&self, handle: WireHandle) -> Result<(), TransportError>;
    /// Only meaningful once the connection callback has reported the channel up
    fn field_info(&self, handle: WireHandle) -> Result<FieldInfo, TransportError>;

    fn subscribe(
        &self,
        handle: WireHandle,
        record_type: u16,
        element_count: usize,
        tag: UserTag,
    ) -> Result<SubscriptionHandle, TransportError>;
    fn clear_subscription(&self, subscription: SubscriptionHandle) -> Result<(), TransportError>;

    fn get(
        &self,
        handle: WireHandle,
        record_type: u16,
        element_count: usize,
        tag: UserTag,
    ) -> Result<(), TransportError>;
    /// Write a packed payload. With a `callback` tag the server acknowledges the
    /// write through [`TransportCallbacks::write_completed`].
    fn put(
        &self,
        handle: WireHandle,
        field_type: u16,
        element_count: usize,
        payload: &[u8],
        callback: Option<UserTag>,
    ) -> Result<(), TransportError>;

    fn flush(&self) -> Result<(), TransportError>;

    fn install_callbacks(&self, callbacks: Weak<dyn TransportCallbacks>);
}
