//! Channels: the per-PV state machine and the operations made on it.

use std::{
    collections::{HashMap, VecDeque},
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use parking_lot::{Mutex, Once};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, debug_span, trace, warn};

use super::{
    context::Attach,
    name::ChannelName,
    notify::Event,
    registry::{ClientShared, RegistryInner},
    state::{ChannelSnapshot, StateChange, StateRecord},
    value::{EncodeError, FieldDescriptor, ValueEnvelope, decode_tagged, encode_put},
    wait::{CompletionSignal, SignalWaiter, WaitOutcome},
};
use crate::{
    config::ClientConfig,
    dbr::{DbrBasicType, DbrCategory, DbrType, DbrValue, ValueAccessMode},
    transport::{
        ChannelId, ErrorCondition, RequestKind, SubscriptionHandle, Transport, TransportError,
        UserTag, WireHandle,
    },
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    Timeout,
    InvalidChannel,
    Disposed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    Success(ValueEnvelope),
    Timeout,
    NeverConnected,
    Disposed,
    InvalidChannel,
    /// The server answered, but with no value
    Unavailable,
}

impl ReadOutcome {
    pub fn value(&self) -> Option<&ValueEnvelope> {
        match self {
            ReadOutcome::Success(envelope) => Some(envelope),
            _ => None,
        }
    }
}

/// Why a write was refused without being sent
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PutRejection {
    NotConnected,
    NotWritable,
    TooManyElements,
    NoConvert,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Success,
    RejectedByServer(ErrorCondition),
    RejectedLocally(PutRejection),
    Timeout,
    InvalidChannel,
    Disposed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Subscribed,
    AlreadySubscribed,
    /// Recorded; the subscription is made once the channel connects
    Deferred,
    InvalidChannel,
    Disposed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    NotSubscribed,
    Requested,
    Subscribed,
}

/// Why an operation could not even start
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Refusal {
    Invalid,
    Disposed,
}

impl From<Refusal> for ConnectOutcome {
    fn from(value: Refusal) -> Self {
        match value {
            Refusal::Invalid => ConnectOutcome::InvalidChannel,
            Refusal::Disposed => ConnectOutcome::Disposed,
        }
    }
}
impl From<Refusal> for ReadOutcome {
    fn from(value: Refusal) -> Self {
        match value {
            Refusal::Invalid => ReadOutcome::InvalidChannel,
            Refusal::Disposed => ReadOutcome::Disposed,
        }
    }
}
impl From<Refusal> for PutOutcome {
    fn from(value: Refusal) -> Self {
        match value {
            Refusal::Invalid => PutOutcome::InvalidChannel,
            Refusal::Disposed => PutOutcome::Disposed,
        }
    }
}
impl From<Refusal> for SubscribeOutcome {
    fn from(value: Refusal) -> Self {
        match value {
            Refusal::Invalid => SubscribeOutcome::InvalidChannel,
            Refusal::Disposed => SubscribeOutcome::Disposed,
        }
    }
}

/// Withdraws a next-value waiter that a write gave up on
struct PendingNextValue<'a> {
    core: &'a ChannelCore,
    signal: CompletionSignal<ValueEnvelope>,
}

impl Drop for PendingNextValue<'_> {
    fn drop(&mut self) {
        self.core
            .inner
            .lock()
            .next_value
            .retain(|waiting| !waiting.same_signal(&self.signal));
    }
}

/// One timeout shared by several waits in turn
#[derive(Debug, Copy, Clone)]
struct Deadline {
    at: Option<Instant>,
    timeout: Duration,
}

impl Deadline {
    /// A timeout too long to represent never runs out
    fn after(timeout: Duration) -> Self {
        Deadline {
            at: Instant::now().checked_add(timeout),
            timeout,
        }
    }

    fn remaining(&self) -> Duration {
        self.at
            .map_or(self.timeout, |at| at.saturating_duration_since(Instant::now()))
    }
}

#[derive(Debug, Clone)]
enum GetReply {
    Value(ValueEnvelope),
    Unavailable,
    Failed,
    Invalid,
}

type Listener = Arc<dyn Fn(&StateRecord) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    registered: Vec<(u64, Listener)>,
}

#[derive(Default)]
struct TransitionQueue {
    pending: VecDeque<StateChange>,
    draining: bool,
}

struct Inner {
    wire: Option<WireHandle>,
    subscription: Option<SubscriptionHandle>,
    subscribe_intent: bool,
    /// Set by the first update after subscribing
    live: CompletionSignal<()>,
    ever_connected: bool,
    /// Replaced with a fresh signal whenever the connection drops
    connect_signal: CompletionSignal<()>,
    next_ioid: u32,
    pending_gets: HashMap<u32, CompletionSignal<GetReply>>,
    pending_puts: HashMap<u32, CompletionSignal<ErrorCondition>>,
    next_value: Vec<CompletionSignal<ValueEnvelope>>,
    disposed: bool,
}

impl Inner {
    fn allocate_ioid(&mut self) -> u32 {
        let ioid = self.next_ioid;
        self.next_ioid = self.next_ioid.wrapping_add(1);
        ioid
    }
}

/// A write that has passed every local check
struct PreparedPut {
    wire: WireHandle,
    field_type: DbrBasicType,
    element_count: usize,
    payload: Vec<u8>,
}

pub(crate) struct ChannelCore {
    id: ChannelId,
    pv: String,
    name: Option<ChannelName>,
    mode: ValueAccessMode,
    shared: Arc<ClientShared>,
    record: ArcSwap<StateRecord>,
    updates: watch::Sender<Arc<StateRecord>>,
    transitions: Mutex<TransitionQueue>,
    listeners: Mutex<Listeners>,
    inner: Mutex<Inner>,
    value_signal: CompletionSignal<ValueEnvelope>,
    abort: CancellationToken,
    /// Field whose requested access mode was reduced to value-only
    downgraded: Option<String>,
    announced: Once,
}

impl ChannelCore {
    fn build(
        id: ChannelId,
        pv: String,
        name: Option<ChannelName>,
        mode: ValueAccessMode,
        downgraded: Option<String>,
        shared: Arc<ClientShared>,
    ) -> Arc<Self> {
        let initial = Arc::new(StateRecord::initial());
        Arc::new(ChannelCore {
            id,
            pv,
            name,
            mode,
            shared,
            record: ArcSwap::new(initial.clone()),
            updates: watch::Sender::new(initial),
            transitions: Mutex::new(TransitionQueue::default()),
            listeners: Mutex::new(Listeners::default()),
            inner: Mutex::new(Inner {
                wire: None,
                subscription: None,
                subscribe_intent: false,
                live: CompletionSignal::new(),
                ever_connected: false,
                connect_signal: CompletionSignal::new(),
                next_ioid: 1,
                pending_gets: HashMap::new(),
                pending_puts: HashMap::new(),
                next_value: Vec::new(),
                disposed: false,
            }),
            value_signal: CompletionSignal::new(),
            abort: CancellationToken::new(),
            downgraded,
            announced: Once::new(),
        })
    }

    /// Report the channel's creation, once, whoever asks first
    ///
    /// Kept out of construction so that nothing reaches the notification sink
    /// while the registry is locked.
    pub(crate) fn announce(&self) {
        self.announced.call_once(|| {
            if let Some(field) = &self.downgraded {
                self.emit(Event::AccessModeDowngraded {
                    field: field.clone(),
                });
            }
            self.transition(StateChange::ChannelCreated);
        });
    }

    /// A channel for a valid name. Metadata is only available for the VAL field,
    /// so other fields are always read value-only.
    pub(crate) fn new(
        id: ChannelId,
        name: ChannelName,
        mode: ValueAccessMode,
        shared: Arc<ClientShared>,
    ) -> Arc<Self> {
        let (mode, downgraded) = if !name.is_value_field() && mode != ValueAccessMode::ValueOnly {
            warn!(
                "Field {} of {} only supports value access, ignoring {mode:?}",
                name.field_name(),
                name.base_name()
            );
            (ValueAccessMode::ValueOnly, Some(name.field_name().to_owned()))
        } else {
            (mode, None)
        };
        Self::build(id, name.to_string(), Some(name), mode, downgraded, shared)
    }

    /// A channel that refuses every operation
    pub(crate) fn invalid(id: ChannelId, pv: &str, reason: String, shared: Arc<ClientShared>) -> Arc<Self> {
        let core = Self::build(id, pv.to_owned(), None, ValueAccessMode::ValueOnly, None, shared);
        core.announce();
        core.invalidate(reason);
        core
    }

    pub(crate) fn id(&self) -> ChannelId {
        self.id
    }
    pub(crate) fn pv(&self) -> &str {
        &self.pv
    }
    fn config(&self) -> &ClientConfig {
        &self.shared.config
    }
    fn transport(&self) -> &dyn Transport {
        self.shared.context.transport()
    }
    fn span(&self) -> Span {
        debug_span!("channel", cid = self.id.0, pv = %self.pv)
    }
    fn emit(&self, event: Event) {
        self.shared.notifier.emit(Some(self.id), &self.pv, event);
    }

    pub(crate) fn snapshot(&self) -> Arc<ChannelSnapshot> {
        self.record.load().snapshot.clone()
    }

    /// Gets, writes and next-value waits still expecting a reply
    pub(crate) fn pending_requests(&self) -> usize {
        let inner = self.inner.lock();
        inner.pending_gets.len() + inner.pending_puts.len() + inner.next_value.len()
    }

    pub(crate) fn subscription_state(&self) -> SubscriptionState {
        let inner = self.inner.lock();
        match (inner.subscription.is_some(), inner.live.is_set()) {
            (true, true) => SubscriptionState::Subscribed,
            (true, false) => SubscriptionState::Requested,
            (false, _) if inner.subscribe_intent => SubscriptionState::Requested,
            (false, _) => SubscriptionState::NotSubscribed,
        }
    }

    /// Apply a state change, or queue it if another thread is applying one
    ///
    /// Changes raised from inside a listener land in the queue and are applied
    /// by the same loop once the current listeners return.
    pub(crate) fn transition(&self, change: StateChange) {
        {
            let mut queue = self.transitions.lock();
            queue.pending.push_back(change);
            if queue.draining {
                return;
            }
            queue.draining = true;
        }
        loop {
            let change = {
                let mut queue = self.transitions.lock();
                match queue.pending.pop_front() {
                    Some(change) => change,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };
            self.apply(change);
        }
    }

    fn apply(&self, change: StateChange) {
        let kind = change.kind();
        let record = Arc::new(
            self.record
                .load()
                .next(change, self.config().enum_name_policy),
        );
        self.record.store(record.clone());
        self.updates.send_replace(record.clone());
        self.emit(Event::Transition {
            sequence_number: record.snapshot.sequence_number,
            change: kind,
        });

        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .registered
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(&record))) {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_owned());
                self.emit(Event::ListenerPanicked(message));
            }
        }
    }

    fn invalidate(&self, reason: String) {
        debug!("Channel invalid: {reason}");
        self.transition(StateChange::ValidityChanged {
            valid: false,
            reason: reason.clone(),
        });
        self.emit(Event::Invalidated(reason));
        self.abort.cancel();
    }

    fn wire_failed(&self, error: TransportError) {
        self.emit(Event::TransportFailure(error.to_string()));
        self.invalidate(format!("Transport refused request: {error}"));
    }

    fn check_usable(&self, operation: &'static str) -> Result<(), Refusal> {
        if self.inner.lock().disposed {
            return Err(Refusal::Disposed);
        }
        if !self.snapshot().is_valid() {
            self.emit(Event::OperationOnInvalid(operation));
            return Err(Refusal::Invalid);
        }
        Ok(())
    }

    /// What a cancelled wait turns into
    fn refusal(&self) -> Refusal {
        if self.inner.lock().disposed {
            Refusal::Disposed
        } else {
            Refusal::Invalid
        }
    }

    fn attach(&self) -> Result<(), TransportError> {
        match self.shared.context.ensure_attached()? {
            Attach::AlreadyAttached => (),
            Attach::Attached => self.emit(Event::ContextAttached(self.shared.context.id())),
            Attach::Reattached { from } => self.emit(Event::ContextReattached {
                from,
                to: self.shared.context.id(),
            }),
        }
        Ok(())
    }

    /// The record type used to read this channel
    fn request_type(&self, descriptor: &FieldDescriptor) -> DbrType {
        let is_value_field = self.name.as_ref().is_some_and(ChannelName::is_value_field);
        let category = if descriptor.field_type == DbrBasicType::Enum
            && is_value_field
            && (descriptor.enum_names.is_none() || self.config().always_request_enum_names)
        {
            DbrCategory::Control
        } else {
            self.mode.category()
        };
        DbrType::new(descriptor.field_type, category)
    }

    pub(crate) async fn connect(&self, timeout: Duration) -> ConnectOutcome {
        if let Err(refusal) = self.check_usable("connect") {
            return refusal.into();
        }
        if self.snapshot().is_connected() {
            return ConnectOutcome::Connected;
        }
        let waiter = match self.ensure_wire() {
            Ok(waiter) => waiter,
            Err(outcome) => return outcome,
        };
        match waiter.wait(timeout, &self.abort).await {
            WaitOutcome::Completed(()) => ConnectOutcome::Connected,
            WaitOutcome::TimedOut => ConnectOutcome::Timeout,
            WaitOutcome::Cancelled => self.refusal().into(),
        }
    }

    /// Create the wire channel if there is none, and return a connection waiter
    fn ensure_wire(&self) -> Result<SignalWaiter<()>, ConnectOutcome> {
        if let Err(e) = self.attach() {
            self.wire_failed(e);
            return Err(ConnectOutcome::InvalidChannel);
        }
        let mut inner = self.inner.lock();
        if inner.wire.is_some() {
            return Ok(inner.connect_signal.waiter());
        }
        let tag = UserTag::new(self.id, RequestKind::Connection);
        let created = self.transport().create_channel(&self.pv, tag).and_then(|wire| {
            inner.wire = Some(wire);
            self.transport().flush()
        });
        let waiter = inner.connect_signal.waiter();
        drop(inner);
        match created {
            Ok(()) => {
                self.emit(Event::ConnectRequested);
                Ok(waiter)
            }
            Err(e) => {
                self.wire_failed(e);
                Err(ConnectOutcome::InvalidChannel)
            }
        }
    }

    pub(crate) async fn connect_and_acquire_value(&self, timeout: Duration) -> ReadOutcome {
        let deadline = Deadline::after(timeout);
        match self.connect(timeout).await {
            ConnectOutcome::Connected => (),
            ConnectOutcome::Timeout => return ReadOutcome::Timeout,
            ConnectOutcome::InvalidChannel => return ReadOutcome::InvalidChannel,
            ConnectOutcome::Disposed => return ReadOutcome::Disposed,
        }
        let remaining = deadline.remaining();
        let subscribed = {
            let inner = self.inner.lock();
            inner.subscribe_intent || inner.subscription.is_some()
        };
        if !subscribed {
            return self.get(remaining).await;
        }
        match self.value_signal.waiter().wait(remaining, &self.abort).await {
            WaitOutcome::Completed(first) => {
                ReadOutcome::Success(self.snapshot().value.clone().unwrap_or(first))
            }
            WaitOutcome::TimedOut => ReadOutcome::Timeout,
            WaitOutcome::Cancelled => self.refusal().into(),
        }
    }

    pub(crate) async fn get(&self, timeout: Duration) -> ReadOutcome {
        if let Err(refusal) = self.check_usable("get") {
            return refusal.into();
        }
        let snapshot = self.snapshot();
        let Some(descriptor) = snapshot
            .field_descriptor
            .clone()
            .filter(|_| snapshot.is_connected())
        else {
            return ReadOutcome::NeverConnected;
        };
        let subscribed = self.inner.lock().subscription.is_some();
        if subscribed && let Some(value) = snapshot.value.clone()
        {
            self.emit(Event::RedundantGet);
            return ReadOutcome::Success(value);
        }

        let record_type = self.request_type(&descriptor);
        if let Err(e) = self.attach() {
            self.wire_failed(e);
            return ReadOutcome::InvalidChannel;
        }
        let (ioid, waiter, issued) = {
            let mut inner = self.inner.lock();
            let Some(wire) = inner.wire else {
                return ReadOutcome::NeverConnected;
            };
            let ioid = inner.allocate_ioid();
            let signal = CompletionSignal::new();
            inner.pending_gets.insert(ioid, signal.clone());
            let tag = UserTag::new(self.id, RequestKind::Get(ioid));
            let issued = self
                .transport()
                .get(wire, record_type.into(), descriptor.element_count, tag)
                .and_then(|_| self.transport().flush());
            if issued.is_err() {
                inner.pending_gets.remove(&ioid);
            }
            (ioid, signal.waiter(), issued)
        };
        match issued {
            Ok(()) => self.emit(Event::GetIssued { ioid, record_type }),
            Err(TransportError::NotConnected) => return ReadOutcome::NeverConnected,
            Err(e) => {
                self.wire_failed(e);
                return ReadOutcome::InvalidChannel;
            }
        }

        match waiter.wait(timeout, &self.abort).await {
            WaitOutcome::Completed(GetReply::Value(envelope)) => ReadOutcome::Success(envelope),
            WaitOutcome::Completed(GetReply::Unavailable) => ReadOutcome::Unavailable,
            WaitOutcome::Completed(GetReply::Failed) => ReadOutcome::Unavailable,
            WaitOutcome::Completed(GetReply::Invalid) => ReadOutcome::InvalidChannel,
            WaitOutcome::TimedOut => {
                self.inner.lock().pending_gets.remove(&ioid);
                ReadOutcome::Timeout
            }
            WaitOutcome::Cancelled => self.refusal().into(),
        }
    }

    pub(crate) fn subscribe(&self) -> SubscribeOutcome {
        if let Err(refusal) = self.check_usable("subscribe") {
            return refusal.into();
        }
        {
            let mut inner = self.inner.lock();
            inner.subscribe_intent = true;
            if inner.subscription.is_some() {
                return SubscribeOutcome::AlreadySubscribed;
            }
        }
        if !self.snapshot().is_connected() {
            self.emit(Event::SubscriptionDeferred);
            return SubscribeOutcome::Deferred;
        }
        self.issue_subscription()
    }

    fn issue_subscription(&self) -> SubscribeOutcome {
        let Some(descriptor) = self.snapshot().field_descriptor.clone() else {
            return SubscribeOutcome::Deferred;
        };
        let dbr_type = self.request_type(&descriptor);
        if let Err(e) = self.attach() {
            self.wire_failed(e);
            return SubscribeOutcome::InvalidChannel;
        }
        let mut inner = self.inner.lock();
        if inner.subscription.is_some() {
            return SubscribeOutcome::AlreadySubscribed;
        }
        let Some(wire) = inner.wire else {
            return SubscribeOutcome::Deferred;
        };
        let tag = UserTag::new(self.id, RequestKind::Subscription);
        let issued = self
            .transport()
            .subscribe(wire, dbr_type.into(), descriptor.element_count, tag)
            .and_then(|subscription| {
                inner.subscription = Some(subscription);
                self.transport().flush()
            });
        drop(inner);
        match issued {
            Ok(()) => {
                self.emit(Event::SubscriptionRequested(dbr_type));
                SubscribeOutcome::Subscribed
            }
            Err(e) => {
                self.wire_failed(e);
                SubscribeOutcome::InvalidChannel
            }
        }
    }

    /// Returns true if an active subscription was cleared
    pub(crate) fn unsubscribe(&self) -> bool {
        let subscription = {
            let mut inner = self.inner.lock();
            inner.subscribe_intent = false;
            inner.live = CompletionSignal::new();
            inner.subscription.take()
        };
        let Some(subscription) = subscription else {
            return false;
        };
        let cleared = self.attach().and_then(|_| {
            self.transport().clear_subscription(subscription)?;
            self.transport().flush()
        });
        if let Err(e) = cleared {
            debug!("Could not clear subscription: {e}");
        }
        self.emit(Event::Unsubscribed);
        true
    }

    /// Every local check a write has to pass, and the packed payload
    fn prepare_put(&self, operation: &'static str, value: &DbrValue) -> Result<PreparedPut, PutOutcome> {
        self.check_usable(operation)?;
        let snapshot = self.snapshot();
        let descriptor = match &snapshot.field_descriptor {
            Some(descriptor) if snapshot.is_connected() => descriptor,
            _ => return Err(PutOutcome::RejectedLocally(PutRejection::NotConnected)),
        };
        if !descriptor.is_writable {
            return Err(PutOutcome::RejectedLocally(PutRejection::NotWritable));
        }
        let (element_count, payload) = encode_put(descriptor, value).map_err(|e| {
            debug!("Refusing write: {e}");
            PutOutcome::RejectedLocally(match e {
                EncodeError::TooManyElements { .. } => PutRejection::TooManyElements,
                _ => PutRejection::NoConvert,
            })
        })?;
        if let Some(max) = self.config().max_array_bytes
            && payload.len() > max
        {
            debug!("Refusing write of {} bytes, limit is {max}", payload.len());
            return Err(PutOutcome::RejectedLocally(PutRejection::TooManyElements));
        }
        let wire = self
            .inner
            .lock()
            .wire
            .ok_or(PutOutcome::RejectedLocally(PutRejection::NotConnected))?;
        Ok(PreparedPut {
            wire,
            field_type: descriptor.field_type,
            element_count,
            payload,
        })
    }

    /// Send a prepared write, optionally asking the server to acknowledge it
    fn issue_put(
        &self,
        put: PreparedPut,
        acknowledged: bool,
    ) -> Result<Option<(u32, SignalWaiter<ErrorCondition>)>, PutOutcome> {
        if let Err(e) = self.attach() {
            self.wire_failed(e);
            return Err(PutOutcome::InvalidChannel);
        }
        let (ioid, waiter, issued) = {
            let mut inner = self.inner.lock();
            let pending = acknowledged.then(|| {
                let ioid = inner.allocate_ioid();
                let signal = CompletionSignal::new();
                inner.pending_puts.insert(ioid, signal.clone());
                (ioid, signal.waiter())
            });
            let ioid = pending.as_ref().map(|(ioid, _)| *ioid);
            let callback = ioid.map(|ioid| UserTag::new(self.id, RequestKind::Put(ioid)));
            let issued = self
                .transport()
                .put(
                    put.wire,
                    put.field_type as u16,
                    put.element_count,
                    &put.payload,
                    callback,
                )
                .and_then(|_| self.transport().flush());
            if issued.is_err()
                && let Some(ioid) = ioid
            {
                inner.pending_puts.remove(&ioid);
            }
            (ioid, pending.map(|(_, waiter)| waiter), issued)
        };
        match issued {
            Ok(()) => {
                self.emit(Event::PutIssued {
                    ioid,
                    element_count: put.element_count,
                });
                Ok(ioid.zip(waiter))
            }
            Err(TransportError::NotConnected) => {
                Err(PutOutcome::RejectedLocally(PutRejection::NotConnected))
            }
            Err(e) => {
                self.wire_failed(e);
                Err(PutOutcome::InvalidChannel)
            }
        }
    }

    /// Wait for the server to accept or reject a write
    async fn await_acceptance(
        &self,
        ioid: u32,
        waiter: SignalWaiter<ErrorCondition>,
        timeout: Duration,
    ) -> PutOutcome {
        match waiter.wait(timeout, &self.abort).await {
            WaitOutcome::Completed(status) if status.is_success() => PutOutcome::Success,
            WaitOutcome::Completed(status) => PutOutcome::RejectedByServer(status),
            WaitOutcome::TimedOut => {
                self.inner.lock().pending_puts.remove(&ioid);
                PutOutcome::Timeout
            }
            WaitOutcome::Cancelled => self.refusal().into(),
        }
    }

    pub(crate) fn put(&self, value: &DbrValue) -> PutOutcome {
        let prepared = match self.prepare_put("put", value) {
            Ok(prepared) => prepared,
            Err(outcome) => return outcome,
        };
        match self.issue_put(prepared, false) {
            Ok(_) => PutOutcome::Success,
            Err(outcome) => outcome,
        }
    }

    pub(crate) async fn put_async(&self, value: &DbrValue, timeout: Duration) -> PutOutcome {
        let prepared = match self.prepare_put("put_async", value) {
            Ok(prepared) => prepared,
            Err(outcome) => return outcome,
        };
        match self.issue_put(prepared, true) {
            Ok(Some((ioid, waiter))) => self.await_acceptance(ioid, waiter, timeout).await,
            Ok(None) => PutOutcome::Success,
            Err(outcome) => outcome,
        }
    }

    /// Write, then wait for the server to accept it and for the next value update
    pub(crate) async fn put_ack(&self, value: &DbrValue, timeout: Duration) -> PutOutcome {
        let deadline = Deadline::after(timeout);
        let remaining = || deadline.remaining();
        // Checked up front so that refused writes never subscribe
        if let Err(outcome) = self.prepare_put("put_ack", value) {
            return outcome;
        }
        match self.subscribe() {
            SubscribeOutcome::InvalidChannel => return PutOutcome::InvalidChannel,
            SubscribeOutcome::Disposed => return PutOutcome::Disposed,
            _ => (),
        }
        // The next value must come after the write, not be the subscription's first
        let live = self.inner.lock().live.waiter();
        match live.wait(remaining(), &self.abort).await {
            WaitOutcome::Completed(()) => (),
            WaitOutcome::TimedOut => return PutOutcome::Timeout,
            WaitOutcome::Cancelled => return self.refusal().into(),
        }

        let next_value = CompletionSignal::new();
        let next_waiter = next_value.waiter();
        self.inner.lock().next_value.push(next_value.clone());
        let _pending = PendingNextValue {
            core: self,
            signal: next_value,
        };

        let prepared = match self.prepare_put("put_ack", value) {
            Ok(prepared) => prepared,
            Err(outcome) => return outcome,
        };
        let (ioid, accepted) = match self.issue_put(prepared, true) {
            Ok(Some(pending)) => pending,
            Ok(None) => return PutOutcome::Success,
            Err(outcome) => return outcome,
        };
        match self.await_acceptance(ioid, accepted, remaining()).await {
            PutOutcome::Success => (),
            other => return other,
        }
        match next_waiter.wait(remaining(), &self.abort).await {
            WaitOutcome::Completed(_) => PutOutcome::Success,
            WaitOutcome::TimedOut => PutOutcome::Timeout,
            WaitOutcome::Cancelled => self.refusal().into(),
        }
    }

    /// Connection callback, on the transport I/O thread
    pub(crate) fn on_connection(&self, up: bool) {
        let _span = self.span().entered();
        if self.inner.lock().disposed {
            trace!("Ignoring connection change on disposed channel");
            return;
        }
        if up {
            self.on_connected();
        } else {
            {
                let mut inner = self.inner.lock();
                if inner.connect_signal.is_set() {
                    inner.connect_signal = CompletionSignal::new();
                }
            }
            self.transition(StateChange::ConnectionLost);
        }
    }

    fn on_connected(&self) {
        let Some(wire) = self.inner.lock().wire else {
            return;
        };
        let info = match self
            .attach()
            .and_then(|_| self.transport().field_info(wire))
        {
            Ok(info) => info,
            Err(e) => {
                self.wire_failed(e);
                return;
            }
        };
        let Ok(field_type) = DbrBasicType::try_from(info.type_tag) else {
            self.emit(Event::UnknownFieldType(info.type_tag));
            self.invalidate(format!("Server reported unknown field type {}", info.type_tag));
            return;
        };
        let descriptor = FieldDescriptor::new(field_type, info.element_count, info.writable);
        let reconnecting = std::mem::replace(&mut self.inner.lock().ever_connected, true);
        let change = match &self.snapshot().field_descriptor {
            Some(previous) if reconnecting && previous.same_field(&descriptor) => {
                StateChange::ConnectionRestored
            }
            _ => StateChange::ConnectionEstablished(descriptor),
        };
        self.transition(change);

        let (signal, deferred_subscription) = {
            let inner = self.inner.lock();
            (
                inner.connect_signal.clone(),
                inner.subscribe_intent && inner.subscription.is_none(),
            )
        };
        signal.set(());
        if deferred_subscription {
            self.issue_subscription();
        }
    }

    /// Get or subscription response, on the transport I/O thread
    pub(crate) fn on_value(
        &self,
        kind: RequestKind,
        record_type: u16,
        element_count: usize,
        status: ErrorCondition,
        payload: Option<&[u8]>,
    ) {
        let _span = self.span().entered();
        let pending = match kind {
            RequestKind::Get(ioid) => {
                let pending = self.inner.lock().pending_gets.remove(&ioid);
                if pending.is_none() {
                    self.emit(Event::LateCompletion(kind));
                }
                pending
            }
            RequestKind::Subscription => {
                let inner = self.inner.lock();
                if inner.disposed || inner.subscription.is_none() {
                    trace!("Dropping update for a cleared subscription");
                    return;
                }
                None
            }
            RequestKind::Connection | RequestKind::Put(_) => {
                warn!("Value update routed with {kind:?} tag");
                return;
            }
        };
        let from_subscription = kind == RequestKind::Subscription;

        let reply = match payload.filter(|_| status.is_success()) {
            None => {
                self.emit(Event::ServerError(status));
                GetReply::Failed
            }
            Some(payload) => match decode_tagged(record_type, element_count, payload) {
                Ok(Some(envelope)) => {
                    GetReply::Value(self.accept_value(envelope, from_subscription))
                }
                Ok(None) => {
                    self.emit(Event::ValueUnavailable);
                    GetReply::Unavailable
                }
                Err(e) => {
                    self.emit(Event::DecodeFailed(e.to_string()));
                    self.invalidate(format!("Undecodable {record_type} payload: {e}"));
                    GetReply::Invalid
                }
            },
        };
        if from_subscription && matches!(reply, GetReply::Value(_)) {
            let live = self.inner.lock().live.clone();
            live.set(());
        }
        if let Some(signal) = pending {
            signal.set(reply);
        }
    }

    fn accept_value(&self, mut envelope: ValueEnvelope, from_subscription: bool) -> ValueEnvelope {
        let snapshot = self.snapshot();
        if envelope.enum_names.is_none() {
            envelope.enum_names = snapshot.enum_names().map(<[String]>::to_vec);
        }
        let change = if snapshot.has_value() {
            StateChange::ValueChanged(envelope.clone())
        } else {
            StateChange::ValueAcquired(envelope.clone())
        };
        self.transition(change);
        // Taken before the acquired signal fires, so a waiter registered in
        // response to it only sees later updates
        let waiters = if from_subscription {
            std::mem::take(&mut self.inner.lock().next_value)
        } else {
            Vec::new()
        };
        self.value_signal.set(envelope.clone());
        for waiter in waiters {
            waiter.set(envelope.clone());
        }
        envelope
    }

    /// Write acknowledgement, on the transport I/O thread
    pub(crate) fn on_write_completed(&self, kind: RequestKind, status: ErrorCondition) {
        let _span = self.span().entered();
        let RequestKind::Put(ioid) = kind else {
            warn!("Write completion routed with {kind:?} tag");
            return;
        };
        self.emit(Event::WriteCompleted { ioid, status });
        match self.inner.lock().pending_puts.remove(&ioid) {
            Some(signal) => {
                signal.set(status);
            }
            None => self.emit(Event::LateCompletion(kind)),
        }
    }

    /// Release everything on the wire and end every pending wait
    pub(crate) fn teardown(&self) {
        let _span = self.span().entered();
        let (wire, subscription) = {
            let mut inner = self.inner.lock();
            if inner.disposed {
                return;
            }
            inner.disposed = true;
            inner.pending_gets.clear();
            inner.pending_puts.clear();
            inner.next_value.clear();
            (inner.wire.take(), inner.subscription.take())
        };
        self.abort.cancel();
        if wire.is_some() || subscription.is_some() {
            let cleared = self.attach().and_then(|_| {
                if let Some(subscription) = subscription {
                    self.transport().clear_subscription(subscription)?;
                }
                if let Some(wire) = wire {
                    self.transport().clear_channel(wire)?;
                }
                self.transport().flush()
            });
            if let Err(e) = cleared {
                debug!("Could not clear channel from transport: {e}");
            }
        }
        self.emit(Event::Disposed);
    }

    fn add_listener(self: &Arc<Self>, listener: Listener) -> ListenerToken {
        let mut listeners = self.listeners.lock();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.registered.push((id, listener));
        ListenerToken {
            core: Arc::downgrade(self),
            id,
        }
    }
}

/// Keeps a state-changed listener registered; dropping it unregisters
#[must_use = "the listener is removed when the token is dropped"]
pub struct ListenerToken {
    core: Weak<ChannelCore>,
    id: u64,
}

impl Drop for ListenerToken {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.listeners
                .lock()
                .registered
                .retain(|(id, _)| *id != self.id);
        }
    }
}

/// Handle to a shared channel
///
/// Every handle counts as one share of the channel: cloning a handle, or asking
/// the registry for the same name again, adds a share. Dropping or disposing a
/// handle releases it, and the channel is torn down when the last share goes.
pub struct Channel {
    core: Arc<ChannelCore>,
    registry: Option<Arc<RegistryInner>>,
    released: AtomicBool,
}

impl Channel {
    pub(crate) fn new(core: Arc<ChannelCore>, registry: Option<Arc<RegistryInner>>) -> Self {
        Channel {
            core,
            registry,
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.core.id
    }
    /// The canonical name; `REC` for `REC.VAL`
    pub fn pv_name(&self) -> &str {
        &self.core.pv
    }
    /// The parsed name, `None` for a channel created from an invalid name
    pub fn name(&self) -> Option<&ChannelName> {
        self.core.name.as_ref()
    }
    pub fn access_mode(&self) -> ValueAccessMode {
        self.core.mode
    }
    pub fn is_disposed(&self) -> bool {
        self.released.load(Ordering::Acquire) || self.core.inner.lock().disposed
    }
    pub fn snapshot(&self) -> Arc<ChannelSnapshot> {
        self.core.snapshot()
    }
    pub fn state_record(&self) -> Arc<StateRecord> {
        self.core.record.load_full()
    }
    /// Receive every new state record as it is made
    pub fn watch(&self) -> watch::Receiver<Arc<StateRecord>> {
        self.core.updates.subscribe()
    }
    pub fn subscription_state(&self) -> SubscriptionState {
        self.core.subscription_state()
    }

    /// Call `listener` after every state transition, until the token is dropped
    ///
    /// Listeners run on whichever thread applied the transition, usually the
    /// transport I/O thread. A panicking listener is reported and skipped.
    pub fn on_state_changed<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn(&StateRecord) + Send + Sync + 'static,
    {
        self.core.add_listener(Arc::new(listener))
    }

    fn default_timeout(&self) -> Duration {
        self.core.config().timeout
    }

    fn released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub async fn connect(&self) -> ConnectOutcome {
        self.connect_within(self.default_timeout()).await
    }
    pub async fn connect_within(&self, timeout: Duration) -> ConnectOutcome {
        if self.released() {
            return ConnectOutcome::Disposed;
        }
        self.core.connect(timeout).instrument(self.core.span()).await
    }

    pub async fn connect_and_acquire_value(&self) -> ReadOutcome {
        self.connect_and_acquire_value_within(self.default_timeout())
            .await
    }
    pub async fn connect_and_acquire_value_within(&self, timeout: Duration) -> ReadOutcome {
        if self.released() {
            return ReadOutcome::Disposed;
        }
        self.core
            .connect_and_acquire_value(timeout)
            .instrument(self.core.span())
            .await
    }

    /// Read the current value
    ///
    /// A subscribed channel answers from its last update without going to the
    /// server; this is reported as a redundant get.
    pub async fn get(&self) -> ReadOutcome {
        self.get_within(self.default_timeout()).await
    }
    pub async fn get_within(&self, timeout: Duration) -> ReadOutcome {
        if self.released() {
            return ReadOutcome::Disposed;
        }
        self.core.get(timeout).instrument(self.core.span()).await
    }

    /// Write without waiting for any acknowledgement
    pub fn put(&self, value: impl Into<DbrValue>) -> PutOutcome {
        if self.released() {
            return PutOutcome::Disposed;
        }
        let _span = self.core.span().entered();
        self.core.put(&value.into())
    }

    /// Write, and wait for the server to accept or reject it
    pub async fn put_async(&self, value: impl Into<DbrValue>) -> PutOutcome {
        self.put_async_within(value, self.default_timeout()).await
    }
    pub async fn put_async_within(&self, value: impl Into<DbrValue>, timeout: Duration) -> PutOutcome {
        if self.released() {
            return PutOutcome::Disposed;
        }
        let value = value.into();
        self.core
            .put_async(&value, timeout)
            .instrument(self.core.span())
            .await
    }

    /// Write, wait for acceptance, then wait for the value update that follows
    ///
    /// Subscribes first if the channel is not already subscribed.
    pub async fn put_ack(&self, value: impl Into<DbrValue>) -> PutOutcome {
        self.put_ack_within(value, self.default_timeout()).await
    }
    pub async fn put_ack_within(&self, value: impl Into<DbrValue>, timeout: Duration) -> PutOutcome {
        if self.released() {
            return PutOutcome::Disposed;
        }
        let value = value.into();
        self.core
            .put_ack(&value, timeout)
            .instrument(self.core.span())
            .await
    }

    /// Ask for value updates. Repeated calls are harmless.
    pub fn subscribe(&self) -> SubscribeOutcome {
        if self.released() {
            return SubscribeOutcome::Disposed;
        }
        let _span = self.core.span().entered();
        self.core.subscribe()
    }

    pub fn unsubscribe(&self) -> bool {
        if self.released() {
            return false;
        }
        self.core.unsubscribe()
    }

    /// Release this handle's share of the channel
    pub fn dispose(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            self.core.emit(Event::DoubleDispose);
            return;
        }
        self.release();
    }

    fn release(&self) {
        match &self.registry {
            Some(registry) => registry.release(self.core.id),
            None => self.core.teardown(),
        }
    }
}

impl Clone for Channel {
    fn clone(&self) -> Self {
        let live = !self.released()
            && self
                .registry
                .as_ref()
                .is_none_or(|registry| registry.acquire(self.core.id));
        Channel {
            core: self.core.clone(),
            registry: self.registry.clone(),
            released: AtomicBool::new(!live),
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.release();
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.core.id)
            .field("pv", &self.core.pv)
            .field("sequence_number", &self.snapshot().sequence_number)
            .finish()
    }
}
