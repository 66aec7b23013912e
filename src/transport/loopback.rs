//! An in-memory [`Transport`] with a small CA server model behind it.
//!
//! Requests are buffered until [`Transport::flush`] (or until the I/O thread has
//! been idle for the idle-flush interval), then handled in order on a dedicated
//! I/O thread, which is also the only thread inbound callbacks are made from.
//! The server side is driven directly through methods like
//! [`LoopbackTransport::add_pv`] and [`LoopbackTransport::set_value`].

use std::{
    collections::{HashMap, VecDeque},
    num::NonZeroUsize,
    sync::{Arc, Weak, mpsc},
    thread::{self, JoinHandle, ThreadId},
    time::{Duration, SystemTime},
};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, debug_span, error, trace, warn};

use super::{
    ContextId, ErrorCondition, FieldInfo, SubscriptionHandle, Transport,
    TransportCallbacks, TransportError, UserTag, WireHandle,
};
use crate::dbr::{
    ControlInfo, DBR_CLASS_NAME, Dbr, DbrBasicType, DbrCategory, DbrDisplay, DbrType, DbrValue,
    Status,
};

/// Default interval after which buffered requests are sent without a flush
pub const DEFAULT_IDLE_FLUSH: Duration = Duration::from_secs(30);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoopbackError {
    #[error("PV '{0}' already exists")]
    PvAlreadyExists(String),
    #[error("No PV named '{0}'")]
    UnknownPv(String),
    #[error("Value cannot be stored: {0}")]
    Convert(ErrorCondition),
}

/// One call made across the transport boundary, in the order made
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireCall {
    Attach(ContextId),
    Detach,
    CreateChannel(String),
    ClearChannel(String),
    FieldInfo(String),
    Subscribe { name: String, record_type: u16 },
    ClearSubscription(String),
    Get { name: String, record_type: u16 },
    Put { name: String, element_count: usize, callback: bool },
    Flush,
}

impl WireCall {
    /// Does this call concern a specific channel?
    pub fn channel_name(&self) -> Option<&str> {
        match self {
            WireCall::Attach(_) | WireCall::Detach | WireCall::Flush => None,
            WireCall::CreateChannel(name)
            | WireCall::ClearChannel(name)
            | WireCall::FieldInfo(name)
            | WireCall::ClearSubscription(name) => Some(name),
            WireCall::Subscribe { name, .. }
            | WireCall::Get { name, .. }
            | WireCall::Put { name, .. } => Some(name),
        }
    }
}

#[derive(Debug, Clone)]
struct Pv {
    value: DbrValue,
    /// Element count the field reports, at least the current value length
    capacity: usize,
    status: Status,
    timestamp: SystemTime,
    display: Option<DbrDisplay>,
    writable: bool,
    write_rejection: Option<ErrorCondition>,
    read_rejection: Option<ErrorCondition>,
    online: bool,
    /// Reported type tag, when it should differ from the value's
    reported_type: Option<u16>,
}

impl Pv {
    fn new(value: DbrValue) -> Self {
        Pv {
            capacity: value.get_count().max(1),
            value,
            status: Status::default(),
            timestamp: SystemTime::now(),
            display: None,
            writable: true,
            write_rejection: None,
            read_rejection: None,
            online: true,
            reported_type: None,
        }
    }

    fn field_info(&self) -> FieldInfo {
        FieldInfo {
            type_tag: self
                .reported_type
                .unwrap_or(self.value.get_type() as u16),
            element_count: self.capacity,
            writable: self.writable,
        }
    }

    /// Encode the current value as the requested record type
    fn respond(&self, record_type: u16, requested: usize) -> Response {
        if let Some(rejection) = self.read_rejection {
            return Response::failed(rejection);
        }
        let Ok(dbr_type) = DbrType::try_from(record_type) else {
            return Response::failed(ErrorCondition::BadType);
        };
        let dbr = if dbr_type == DBR_CLASS_NAME {
            Dbr::ClassName(DbrValue::String(vec![
                self.value.get_default_record_type().to_owned(),
            ]))
        } else {
            match Dbr::assemble(
                dbr_type,
                &self.value,
                self.status,
                self.timestamp,
                self.display.as_ref(),
            ) {
                Ok(dbr) => dbr,
                Err(condition) => return Response::failed(condition),
            }
        };
        let (element_count, payload) = dbr.to_bytes(NonZeroUsize::new(requested));
        Response {
            element_count,
            status: ErrorCondition::Normal,
            payload: Some(payload),
        }
    }

    /// Store a value written by a client
    fn store_from_client(&mut self, value: &DbrValue) -> Result<(), ErrorCondition> {
        let native = self.value.get_type();
        let value = if value.get_type() == DbrBasicType::String && native != DbrBasicType::String
        {
            value
                .parse_into(native)
                .map_err(|_| ErrorCondition::NoConvert)?
        } else {
            value.convert_to(native)?
        };
        if value.get_count() > self.capacity {
            return Err(ErrorCondition::BadCount);
        }
        self.value = value;
        self.timestamp = SystemTime::now();
        Ok(())
    }
}

struct Response {
    element_count: usize,
    status: ErrorCondition,
    payload: Option<Vec<u8>>,
}

impl Response {
    fn failed(status: ErrorCondition) -> Self {
        Response {
            element_count: 0,
            status,
            payload: None,
        }
    }
}

#[derive(Debug)]
struct WireChannel {
    name: String,
    pv: String,
    tag: UserTag,
    connected: bool,
}

#[derive(Debug)]
struct Subscription {
    channel: WireHandle,
    record_type: u16,
    element_count: usize,
    tag: UserTag,
}

#[derive(Default)]
struct Database {
    pvs: HashMap<String, Pv>,
    channels: HashMap<WireHandle, WireChannel>,
    subscriptions: HashMap<SubscriptionHandle, Subscription>,
    next_handle: u64,
}

impl Database {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    /// Find the PV that serves a channel name, falling back from `BASE.VAL` to `BASE`
    fn resolve(&self, name: &str) -> Option<String> {
        if self.pvs.contains_key(name) {
            return Some(name.to_owned());
        }
        name.strip_suffix(".VAL")
            .filter(|base| self.pvs.contains_key(*base))
            .map(str::to_owned)
    }

    fn channel_name(&self, handle: WireHandle) -> String {
        self.channels
            .get(&handle)
            .map(|c| c.name.clone())
            .unwrap_or_default()
    }

    /// Value updates for every subscription on every connected channel of a PV
    fn updates_for(&self, pv_name: &str) -> Vec<Callback> {
        let Some(pv) = self.pvs.get(pv_name) else {
            return Vec::new();
        };
        self.subscriptions
            .values()
            .filter(|sub| {
                self.channels
                    .get(&sub.channel)
                    .is_some_and(|c| c.connected && c.pv == pv_name)
            })
            .map(|sub| Callback::value(sub.tag, sub.record_type, pv.respond(sub.record_type, sub.element_count)))
            .collect()
    }
}

/// Client requests, held until flushed
#[derive(Debug)]
enum Request {
    Connect(WireHandle),
    Get {
        handle: WireHandle,
        record_type: u16,
        element_count: usize,
        tag: UserTag,
    },
    Subscribe(SubscriptionHandle),
    Put {
        handle: WireHandle,
        field_type: u16,
        element_count: usize,
        payload: Vec<u8>,
        callback: Option<UserTag>,
    },
    ClearSubscription(SubscriptionHandle),
    ClearChannel(WireHandle),
}

enum Command {
    Flush,
    Hold(bool),
    /// A PV changed on the server side
    Posted(String),
    Connection { pv: String, up: bool },
    Shutdown,
}

enum Callback {
    Connection(UserTag, bool),
    Value {
        tag: UserTag,
        record_type: u16,
        element_count: usize,
        status: ErrorCondition,
        payload: Option<Vec<u8>>,
    },
    Write(UserTag, ErrorCondition),
}

impl Callback {
    fn value(tag: UserTag, record_type: u16, response: Response) -> Self {
        Callback::Value {
            tag,
            record_type,
            element_count: response.element_count,
            status: response.status,
            payload: response.payload,
        }
    }
}

struct Shared {
    database: Mutex<Database>,
    pending: Mutex<Vec<Request>>,
    callbacks: RwLock<Option<Weak<dyn TransportCallbacks>>>,
    attachments: Mutex<HashMap<ThreadId, ContextId>>,
    context: Mutex<Option<ContextId>>,
    log: Mutex<Vec<WireCall>>,
}

impl Shared {
    fn record(&self, call: WireCall) {
        trace!("Wire call: {call:?}");
        self.log.lock().push(call);
    }

    fn check_attached(&self) -> Result<(), TransportError> {
        let attached = self.attachments.lock().get(&thread::current().id()).copied();
        match (attached, *self.context.lock()) {
            (None, _) => Err(TransportError::NotAttached),
            (Some(ours), Some(expected)) if ours != expected => Err(TransportError::WrongContext),
            _ => Ok(()),
        }
    }

    fn deliver(&self, callbacks: Vec<Callback>) {
        if callbacks.is_empty() {
            return;
        }
        let Some(target) = self.callbacks.read().as_ref().and_then(Weak::upgrade) else {
            trace!("Dropping {} callbacks, nobody is listening", callbacks.len());
            return;
        };
        for callback in callbacks {
            match callback {
                Callback::Connection(tag, up) => target.connection_changed(tag, up),
                Callback::Value {
                    tag,
                    record_type,
                    element_count,
                    status,
                    payload,
                } => target.value_update(tag, record_type, element_count, status, payload.as_deref()),
                Callback::Write(tag, status) => target.write_completed(tag, status),
            }
        }
    }

    fn handle_request(&self, request: Request) {
        let callbacks = {
            let mut db = self.database.lock();
            let db = &mut *db;
            match request {
                Request::Connect(handle) => {
                    let Some(channel) = db.channels.get_mut(&handle) else {
                        return;
                    };
                    match db.pvs.get(&channel.pv) {
                        Some(pv) if pv.online => {
                            channel.connected = true;
                            vec![Callback::Connection(channel.tag, true)]
                        }
                        // Nobody answers the search
                        _ => Vec::new(),
                    }
                }
                Request::Get {
                    handle,
                    record_type,
                    element_count,
                    tag,
                } => match db.channels.get(&handle) {
                    Some(channel) if channel.connected => match db.pvs.get(&channel.pv) {
                        Some(pv) => {
                            vec![Callback::value(tag, record_type, pv.respond(record_type, element_count))]
                        }
                        None => Vec::new(),
                    },
                    _ => Vec::new(),
                },
                Request::Subscribe(sub) => {
                    // New subscriptions get the current value straight away
                    let Some(subscription) = db.subscriptions.get(&sub) else {
                        return;
                    };
                    match db.channels.get(&subscription.channel) {
                        Some(channel) if channel.connected => match db.pvs.get(&channel.pv) {
                            Some(pv) => vec![Callback::value(
                                subscription.tag,
                                subscription.record_type,
                                pv.respond(subscription.record_type, subscription.element_count),
                            )],
                            None => Vec::new(),
                        },
                        _ => Vec::new(),
                    }
                }
                Request::Put {
                    handle,
                    field_type,
                    element_count,
                    payload,
                    callback,
                } => {
                    let Some(channel) = db.channels.get(&handle) else {
                        return;
                    };
                    let pv_name = channel.pv.clone();
                    let result = match db.pvs.get_mut(&pv_name) {
                        Some(pv) => Self::store_put(pv, field_type, element_count, &payload),
                        None => Err(ErrorCondition::PutFail),
                    };
                    let mut callbacks: Vec<Callback> = callback
                        .map(|tag| {
                            Callback::Write(tag, result.err().unwrap_or(ErrorCondition::Normal))
                        })
                        .into_iter()
                        .collect();
                    if result.is_ok() {
                        callbacks.extend(db.updates_for(&pv_name));
                    } else if callback.is_none() {
                        debug!("Unacknowledged write to {pv_name} failed: {result:?}");
                    }
                    callbacks
                }
                Request::ClearSubscription(sub) => {
                    db.subscriptions.remove(&sub);
                    Vec::new()
                }
                Request::ClearChannel(handle) => {
                    db.channels.remove(&handle);
                    db.subscriptions.retain(|_, s| s.channel != handle);
                    Vec::new()
                }
            }
        };
        self.deliver(callbacks);
    }

    fn store_put(
        pv: &mut Pv,
        field_type: u16,
        element_count: usize,
        payload: &[u8],
    ) -> Result<(), ErrorCondition> {
        if let Some(rejection) = pv.write_rejection {
            return Err(rejection);
        }
        if !pv.writable {
            return Err(ErrorCondition::NoWtAccess);
        }
        let basic = DbrBasicType::try_from(field_type).map_err(|_| ErrorCondition::BadType)?;
        let written = Dbr::from_bytes(
            DbrType::new(basic, DbrCategory::Basic),
            element_count,
            payload,
        )
        .map_err(|_| ErrorCondition::BadCount)?
        .ok_or(ErrorCondition::BadCount)?;
        pv.store_from_client(written.value())
    }

    fn handle_connection(&self, pv_name: &str, up: bool) {
        let callbacks = {
            let mut db = self.database.lock();
            let db = &mut *db;
            let mut callbacks = Vec::new();
            for channel in db.channels.values_mut().filter(|c| c.pv == pv_name) {
                if channel.connected != up {
                    channel.connected = up;
                    callbacks.push(Callback::Connection(channel.tag, up));
                }
            }
            if up {
                // Subscriptions are reinstated with a fresh value
                callbacks.extend(db.updates_for(pv_name));
            }
            callbacks
        };
        self.deliver(callbacks);
    }

    fn io_loop(&self, commands: mpsc::Receiver<Command>, idle_flush: Duration) {
        let _span = debug_span!("loopback_io").entered();
        let mut held = false;
        let mut backlog = VecDeque::new();
        loop {
            let command = match commands.recv_timeout(idle_flush) {
                Ok(command) => command,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    trace!("Idle flush");
                    Command::Flush
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            };
            match command {
                Command::Flush => {
                    backlog.extend(self.pending.lock().drain(..));
                    if !held {
                        while let Some(request) = backlog.pop_front() {
                            self.handle_request(request);
                        }
                    }
                }
                Command::Hold(hold) => {
                    held = hold;
                    if !held {
                        while let Some(request) = backlog.pop_front() {
                            self.handle_request(request);
                        }
                    }
                }
                Command::Posted(pv) => {
                    let updates = self.database.lock().updates_for(&pv);
                    self.deliver(updates);
                }
                Command::Connection { pv, up } => self.handle_connection(&pv, up),
                Command::Shutdown => break,
            }
        }
        debug!("Loopback I/O thread finished");
    }
}

/// In-memory transport serving a local PV database
pub struct LoopbackTransport {
    shared: Arc<Shared>,
    commands: mpsc::Sender<Command>,
    io_thread: Option<JoinHandle<()>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::with_idle_flush(DEFAULT_IDLE_FLUSH)
    }

    pub fn with_idle_flush(idle_flush: Duration) -> Self {
        let shared = Arc::new(Shared {
            database: Mutex::new(Database::default()),
            pending: Mutex::new(Vec::new()),
            callbacks: RwLock::new(None),
            attachments: Mutex::new(HashMap::new()),
            context: Mutex::new(None),
            log: Mutex::new(Vec::new()),
        });
        let (commands, receiver) = mpsc::channel();
        let io_shared = shared.clone();
        let io_thread = thread::Builder::new()
            .name("loopback-io".to_owned())
            .spawn(move || io_shared.io_loop(receiver, idle_flush))
            .map_err(|e| error!("Could not start loopback I/O thread: {e}"))
            .ok();
        LoopbackTransport {
            shared,
            commands,
            io_thread,
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("Loopback I/O thread has gone away");
        }
    }

    /// Serve a new PV. Its element count is the length of the initial value.
    pub fn add_pv(&self, name: &str, value: impl Into<DbrValue>) -> Result<(), LoopbackError> {
        let mut db = self.shared.database.lock();
        if db.pvs.contains_key(name) {
            return Err(LoopbackError::PvAlreadyExists(name.to_owned()));
        }
        db.pvs.insert(name.to_owned(), Pv::new(value.into()));
        Ok(())
    }

    fn modify<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Pv) -> Result<R, LoopbackError>,
    ) -> Result<R, LoopbackError> {
        let mut db = self.shared.database.lock();
        let pv = db
            .pvs
            .get_mut(name)
            .ok_or_else(|| LoopbackError::UnknownPv(name.to_owned()))?;
        f(pv)
    }

    /// Change the value on the server, posting it to all subscribers
    pub fn set_value(&self, name: &str, value: impl Into<DbrValue>) -> Result<(), LoopbackError> {
        let value = value.into();
        self.modify(name, |pv| {
            let value = value
                .convert_to(pv.value.get_type())
                .map_err(LoopbackError::Convert)?;
            pv.capacity = pv.capacity.max(value.get_count());
            pv.value = value;
            pv.timestamp = SystemTime::now();
            Ok(())
        })?;
        self.send(Command::Posted(name.to_owned()));
        Ok(())
    }

    pub fn value(&self, name: &str) -> Option<DbrValue> {
        self.shared
            .database
            .lock()
            .pvs
            .get(name)
            .map(|pv| pv.value.clone())
    }

    /// Change the alarm state, posting to all subscribers
    pub fn set_alarm(&self, name: &str, status: Status) -> Result<(), LoopbackError> {
        self.modify(name, |pv| {
            pv.status = status;
            Ok(())
        })?;
        self.send(Command::Posted(name.to_owned()));
        Ok(())
    }

    /// Set the option names of an enum PV. Clients see them with the next update.
    pub fn set_enum_strings(&self, name: &str, names: &[&str]) -> Result<(), LoopbackError> {
        let names = names.iter().map(|s| s.to_string()).collect();
        self.modify(name, |pv| {
            pv.display = Some(DbrDisplay::EnumStrings(names));
            Ok(())
        })
    }

    pub fn set_control_info(&self, name: &str, info: ControlInfo) -> Result<(), LoopbackError> {
        self.modify(name, |pv| {
            pv.display = Some(DbrDisplay::Numeric(info));
            Ok(())
        })
    }

    /// Change the element count the field reports
    pub fn set_capacity(&self, name: &str, capacity: usize) -> Result<(), LoopbackError> {
        self.modify(name, |pv| {
            pv.capacity = capacity.max(pv.value.get_count());
            Ok(())
        })
    }

    pub fn set_writable(&self, name: &str, writable: bool) -> Result<(), LoopbackError> {
        self.modify(name, |pv| {
            pv.writable = writable;
            Ok(())
        })
    }

    /// Answer every write to this PV with the given condition, or accept them again
    pub fn reject_writes(
        &self,
        name: &str,
        condition: Option<ErrorCondition>,
    ) -> Result<(), LoopbackError> {
        self.modify(name, |pv| {
            pv.write_rejection = condition;
            Ok(())
        })
    }

    /// Answer every read of this PV with the given condition, or serve them again
    pub fn reject_reads(
        &self,
        name: &str,
        condition: Option<ErrorCondition>,
    ) -> Result<(), LoopbackError> {
        self.modify(name, |pv| {
            pv.read_rejection = condition;
            Ok(())
        })
    }

    /// Make the server report a raw native type tag for this PV
    pub fn set_reported_type(&self, name: &str, type_tag: Option<u16>) -> Result<(), LoopbackError> {
        self.modify(name, |pv| {
            pv.reported_type = type_tag;
            Ok(())
        })
    }

    /// Take the PV offline; every connected channel to it is told it went down
    pub fn drop_connection(&self, name: &str) -> Result<(), LoopbackError> {
        self.modify(name, |pv| {
            pv.online = false;
            Ok(())
        })?;
        self.send(Command::Connection {
            pv: name.to_owned(),
            up: false,
        });
        Ok(())
    }

    pub fn restore_connection(&self, name: &str) -> Result<(), LoopbackError> {
        self.modify(name, |pv| {
            pv.online = true;
            Ok(())
        })?;
        self.send(Command::Connection {
            pv: name.to_owned(),
            up: true,
        });
        Ok(())
    }

    /// Stop answering client requests until released; they are kept in order
    pub fn hold_responses(&self, hold: bool) {
        self.send(Command::Hold(hold));
    }

    pub fn wire_calls(&self) -> Vec<WireCall> {
        self.shared.log.lock().clone()
    }

    /// Wire calls made for a single channel name
    pub fn wire_calls_for(&self, name: &str) -> Vec<WireCall> {
        self.shared
            .log
            .lock()
            .iter()
            .filter(|c| c.channel_name() == Some(name))
            .cloned()
            .collect()
    }

    pub fn clear_wire_log(&self) {
        self.shared.log.lock().clear();
    }

    /// Number of channels currently created on the server
    pub fn open_channels(&self) -> usize {
        self.shared.database.lock().channels.len()
    }

    fn queue(&self, request: Request) {
        self.shared.pending.lock().push(request);
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(handle) = self.io_thread.take()
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
    }
}

impl Transport for LoopbackTransport {
    fn attach_context(&self, context: ContextId) -> Result<(), TransportError> {
        {
            let mut ours = self.shared.context.lock();
            match *ours {
                Some(existing) if existing != context => return Err(TransportError::WrongContext),
                Some(_) => (),
                None => *ours = Some(context),
            }
        }
        self.shared
            .attachments
            .lock()
            .insert(thread::current().id(), context);
        self.shared.record(WireCall::Attach(context));
        Ok(())
    }

    fn detach_context(&self) {
        self.shared
            .attachments
            .lock()
            .remove(&thread::current().id());
        self.shared.record(WireCall::Detach);
    }

    fn create_channel(&self, name: &str, tag: UserTag) -> Result<WireHandle, TransportError> {
        self.shared.check_attached()?;
        self.shared.record(WireCall::CreateChannel(name.to_owned()));
        let handle = {
            let mut db = self.shared.database.lock();
            let handle = WireHandle(db.next_handle());
            // Unknown names still get a handle; the search is just never answered
            let pv = db.resolve(name).unwrap_or_else(|| name.to_owned());
            db.channels.insert(
                handle,
                WireChannel {
                    name: name.to_owned(),
                    pv,
                    tag,
                    connected: false,
                },
            );
            handle
        };
        self.queue(Request::Connect(handle));
        Ok(handle)
    }

    fn clear_channel(&self, handle: WireHandle) -> Result<(), TransportError> {
        self.shared.check_attached()?;
        let name = self.shared.database.lock().channel_name(handle);
        self.shared.record(WireCall::ClearChannel(name));
        self.queue(Request::ClearChannel(handle));
        Ok(())
    }

    fn field_info(&self, handle: WireHandle) -> Result<FieldInfo, TransportError> {
        self.shared.check_attached()?;
        let db = self.shared.database.lock();
        let channel = db.channels.get(&handle).ok_or(TransportError::UnknownHandle)?;
        self.shared.record(WireCall::FieldInfo(channel.name.clone()));
        if !channel.connected {
            return Err(TransportError::NotConnected);
        }
        db.pvs
            .get(&channel.pv)
            .map(Pv::field_info)
            .ok_or(TransportError::NotConnected)
    }

    fn subscribe(
        &self,
        handle: WireHandle,
        record_type: u16,
        element_count: usize,
        tag: UserTag,
    ) -> Result<SubscriptionHandle, TransportError> {
        self.shared.check_attached()?;
        let sub = {
            let mut db = self.shared.database.lock();
            let name = db
                .channels
                .get(&handle)
                .ok_or(TransportError::UnknownHandle)?
                .name
                .clone();
            self.shared.record(WireCall::Subscribe { name, record_type });
            let sub = SubscriptionHandle(db.next_handle());
            db.subscriptions.insert(
                sub,
                Subscription {
                    channel: handle,
                    record_type,
                    element_count,
                    tag,
                },
            );
            sub
        };
        self.queue(Request::Subscribe(sub));
        Ok(sub)
    }

    fn clear_subscription(&self, subscription: SubscriptionHandle) -> Result<(), TransportError> {
        self.shared.check_attached()?;
        {
            let db = self.shared.database.lock();
            let sub = db
                .subscriptions
                .get(&subscription)
                .ok_or(TransportError::UnknownHandle)?;
            let name = db.channel_name(sub.channel);
            self.shared.record(WireCall::ClearSubscription(name));
        }
        self.queue(Request::ClearSubscription(subscription));
        Ok(())
    }

    fn get(
        &self,
        handle: WireHandle,
        record_type: u16,
        element_count: usize,
        tag: UserTag,
    ) -> Result<(), TransportError> {
        self.shared.check_attached()?;
        {
            let db = self.shared.database.lock();
            let channel = db.channels.get(&handle).ok_or(TransportError::UnknownHandle)?;
            self.shared.record(WireCall::Get {
                name: channel.name.clone(),
                record_type,
            });
            if !channel.connected {
                return Err(TransportError::NotConnected);
            }
        }
        self.queue(Request::Get {
            handle,
            record_type,
            element_count,
            tag,
        });
        Ok(())
    }

    fn put(
        &self,
        handle: WireHandle,
        field_type: u16,
        element_count: usize,
        payload: &[u8],
        callback: Option<UserTag>,
    ) -> Result<(), TransportError> {
        self.shared.check_attached()?;
        {
            let db = self.shared.database.lock();
            let channel = db.channels.get(&handle).ok_or(TransportError::UnknownHandle)?;
            self.shared.record(WireCall::Put {
                name: channel.name.clone(),
                element_count,
                callback: callback.is_some(),
            });
            if !channel.connected {
                return Err(TransportError::NotConnected);
            }
        }
        self.queue(Request::Put {
            handle,
            field_type,
            element_count,
            payload: payload.to_vec(),
            callback,
        });
        Ok(())
    }

    fn flush(&self) -> Result<(), TransportError> {
        self.shared.check_attached()?;
        self.shared.record(WireCall::Flush);
        self.commands
            .send(Command::Flush)
            .map_err(|_| TransportError::Closed)
    }

    fn install_callbacks(&self, callbacks: Weak<dyn TransportCallbacks>) {
        *self.shared.callbacks.write() = Some(callbacks);
    }
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("pvs", &self.shared.database.lock().pvs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelId, RequestKind};

    fn tag(channel: u32, kind: RequestKind) -> UserTag {
        UserTag::new(ChannelId(channel), kind)
    }

    #[derive(Debug, PartialEq)]
    enum Event {
        Connection(UserTag, bool),
        Value(UserTag, usize, ErrorCondition, Option<Vec<u8>>),
        Write(UserTag, ErrorCondition),
    }

    struct Recorder(Mutex<mpsc::Sender<Event>>);

    impl TransportCallbacks for Recorder {
        fn connection_changed(&self, tag: UserTag, up: bool) {
            let _ = self.0.lock().send(Event::Connection(tag, up));
        }
        fn value_update(
            &self,
            tag: UserTag,
            _record_type: u16,
            element_count: usize,
            status: ErrorCondition,
            payload: Option<&[u8]>,
        ) {
            let _ = self.0.lock().send(Event::Value(
                tag,
                element_count,
                status,
                payload.map(<[u8]>::to_vec),
            ));
        }
        fn write_completed(&self, tag: UserTag, status: ErrorCondition) {
            let _ = self.0.lock().send(Event::Write(tag, status));
        }
    }

    fn setup(idle: Duration) -> (LoopbackTransport, Arc<Recorder>, mpsc::Receiver<Event>) {
        let transport = LoopbackTransport::with_idle_flush(idle);
        let (tx, rx) = mpsc::channel();
        let recorder = Arc::new(Recorder(Mutex::new(tx)));
        let weak: Weak<dyn TransportCallbacks> = Arc::downgrade(&recorder) as _;
        transport.install_callbacks(weak);
        transport.attach_context(ContextId(1)).unwrap();
        (transport, recorder, rx)
    }

    const SHORT: Duration = Duration::from_millis(100);
    const LONG: Duration = Duration::from_secs(5);

    #[test]
    fn requests_wait_for_flush() {
        let (transport, _recorder, events) = setup(DEFAULT_IDLE_FLUSH);
        transport.add_pv("TEST:PV", 4i32).unwrap();
        let connection = tag(1, RequestKind::Connection);
        transport.create_channel("TEST:PV.VAL", connection).unwrap();
        assert!(events.recv_timeout(SHORT).is_err());
        transport.flush().unwrap();
        assert_eq!(events.recv_timeout(LONG).unwrap(), Event::Connection(connection, true));
    }

    #[test]
    fn idle_flush_sends_buffered_requests() {
        let (transport, _recorder, events) = setup(Duration::from_millis(50));
        transport.add_pv("TEST:PV", 4i32).unwrap();
        let connection = tag(1, RequestKind::Connection);
        transport.create_channel("TEST:PV", connection).unwrap();
        assert_eq!(events.recv_timeout(LONG).unwrap(), Event::Connection(connection, true));
    }

    #[test]
    fn unattached_threads_are_refused() {
        let (transport, _recorder, _events) = setup(DEFAULT_IDLE_FLUSH);
        let transport = Arc::new(transport);
        let other = transport.clone();
        let result = thread::spawn(move || other.create_channel("X", tag(1, RequestKind::Connection)))
            .join()
            .unwrap();
        assert_eq!(result, Err(TransportError::NotAttached));
        assert_eq!(
            transport.attach_context(ContextId(2)),
            Err(TransportError::WrongContext)
        );
    }

    #[test]
    fn get_and_rejected_put() {
        let (transport, _recorder, events) = setup(DEFAULT_IDLE_FLUSH);
        transport.add_pv("TEST:LONG", 42i32).unwrap();
        let handle = transport
            .create_channel("TEST:LONG", tag(3, RequestKind::Connection))
            .unwrap();
        transport.flush().unwrap();
        events.recv_timeout(LONG).unwrap();
        assert_eq!(
            transport.field_info(handle).unwrap(),
            FieldInfo {
                type_tag: DbrBasicType::Long as u16,
                element_count: 1,
                writable: true
            }
        );

        let get = tag(3, RequestKind::Get(1));
        transport.get(handle, 5, 1, get).unwrap();
        transport.flush().unwrap();
        assert_eq!(
            events.recv_timeout(LONG).unwrap(),
            Event::Value(get, 1, ErrorCondition::Normal, Some(vec![0, 0, 0, 42]))
        );

        transport
            .reject_writes("TEST:LONG", Some(ErrorCondition::PutFail))
            .unwrap();
        let put = tag(3, RequestKind::Put(2));
        transport.put(handle, 5, 1, &[0, 0, 0, 1], Some(put)).unwrap();
        transport.flush().unwrap();
        assert_eq!(
            events.recv_timeout(LONG).unwrap(),
            Event::Write(put, ErrorCondition::PutFail)
        );
        assert_eq!(transport.value("TEST:LONG"), Some(DbrValue::Long(vec![42])));
    }

    #[test]
    fn subscriptions_follow_server_changes() {
        let (transport, _recorder, events) = setup(DEFAULT_IDLE_FLUSH);
        transport.add_pv("TEST:DBL", 1.5f64).unwrap();
        let handle = transport
            .create_channel("TEST:DBL", tag(4, RequestKind::Connection))
            .unwrap();
        let monitor = tag(4, RequestKind::Subscription);
        transport.subscribe(handle, 6, 1, monitor).unwrap();
        transport.flush().unwrap();
        assert!(matches!(events.recv_timeout(LONG).unwrap(), Event::Connection(_, true)));
        assert!(matches!(events.recv_timeout(LONG).unwrap(), Event::Value(t, 1, _, _) if t == monitor));

        transport.set_value("TEST:DBL", 2.5f64).unwrap();
        assert_eq!(
            events.recv_timeout(LONG).unwrap(),
            Event::Value(monitor, 1, ErrorCondition::Normal, Some(2.5f64.to_be_bytes().to_vec()))
        );
        transport.drop_connection("TEST:DBL").unwrap();
        assert_eq!(
            events.recv_timeout(LONG).unwrap(),
            Event::Connection(tag(4, RequestKind::Connection), false)
        );
    }
}
