use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicU32, Ordering},
    },
};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{
    channel::{Channel, ChannelCore, SubscriptionState},
    context::ClientContext,
    name::ChannelName,
    notify::{Event, Notifier},
    receivers::NotificationReceiver,
};
use crate::{
    config::ClientConfig,
    dbr::ValueAccessMode,
    transport::{ChannelId, ContextId, ErrorCondition, Transport, TransportCallbacks, UserTag},
};

static NEXT_CHANNEL_ID: AtomicU32 = AtomicU32::new(1);

fn next_channel_id() -> ChannelId {
    ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
}

/// Everything every channel of one registry shares
pub(crate) struct ClientShared {
    pub context: ClientContext,
    pub config: ClientConfig,
    pub notifier: Notifier,
}

struct Entry {
    core: Arc<ChannelCore>,
    shares: usize,
}

#[derive(Default)]
struct Entries {
    by_id: HashMap<ChannelId, Entry>,
    by_name: HashMap<String, ChannelId>,
}

pub(crate) struct RegistryInner {
    shared: Arc<ClientShared>,
    entries: Mutex<Entries>,
}

impl RegistryInner {
    /// Add a share to a registered channel. False if it is no longer registered.
    pub(crate) fn acquire(&self, id: ChannelId) -> bool {
        match self.entries.lock().by_id.get_mut(&id) {
            Some(entry) => {
                entry.shares += 1;
                true
            }
            None => false,
        }
    }

    /// Drop a share, tearing the channel down with the last one
    pub(crate) fn release(&self, id: ChannelId) {
        let core = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.by_id.get_mut(&id) else {
                return;
            };
            entry.shares -= 1;
            if entry.shares > 0 {
                trace!("Channel {id} released, {} shares left", entry.shares);
                return;
            }
            let Some(entry) = entries.by_id.remove(&id) else {
                return;
            };
            entries.by_name.retain(|_, registered| *registered != id);
            entry.core
        };
        debug!("Last share of {} released, deregistering", core.pv());
        core.teardown();
        self.shared
            .notifier
            .emit(Some(id), core.pv(), Event::Deregistered);
    }

    fn lookup(&self, id: ChannelId) -> Option<Arc<ChannelCore>> {
        self.entries.lock().by_id.get(&id).map(|entry| entry.core.clone())
    }

    fn unrouted(&self, tag: UserTag) {
        trace!("No channel {} for {:?} callback", tag.channel, tag.kind);
        self.shared
            .notifier
            .emit(None, "", Event::UnroutedCallback(tag.kind));
    }
}

impl TransportCallbacks for RegistryInner {
    fn connection_changed(&self, tag: UserTag, up: bool) {
        match self.lookup(tag.channel) {
            Some(core) => core.on_connection(up),
            None => self.unrouted(tag),
        }
    }

    fn value_update(
        &self,
        tag: UserTag,
        record_type: u16,
        element_count: usize,
        status: ErrorCondition,
        payload: Option<&[u8]>,
    ) {
        match self.lookup(tag.channel) {
            Some(core) => core.on_value(tag.kind, record_type, element_count, status, payload),
            None => self.unrouted(tag),
        }
    }

    fn write_completed(&self, tag: UserTag, status: ErrorCondition) {
        match self.lookup(tag.channel) {
            Some(core) => core.on_write_completed(tag.kind, status),
            None => self.unrouted(tag),
        }
    }
}

/// A summary of one registered channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub name: String,
    pub shares: usize,
    pub sequence_number: u64,
    pub connected: bool,
    pub valid: bool,
    pub subscription: SubscriptionState,
    /// Replies and value updates that operations are still waiting for
    pub pending_requests: usize,
}

/// Creates channels and shares them by name
///
/// Asking for a name that is already registered returns another handle to the
/// same channel. Names are compared in canonical form, so `REC` and `REC.VAL`
/// are the same channel.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Create a registry whose channels make their wire calls through `transport`
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let notifier = Notifier::new(config.sink.clone(), config.notification_capacity);
        let shared = Arc::new(ClientShared {
            context: ClientContext::new(transport.clone()),
            config,
            notifier,
        });
        debug!("Created registry with context {:?}", shared.context.id());
        let inner = Arc::new(RegistryInner {
            shared,
            entries: Mutex::new(Entries::default()),
        });
        let callbacks: Weak<dyn TransportCallbacks> = Arc::downgrade(&inner) as Weak<_>;
        transport.install_callbacks(callbacks);
        Registry { inner }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.shared.config
    }

    pub fn context_id(&self) -> ContextId {
        self.inner.shared.context.id()
    }

    /// Get a channel using the configured default access mode
    pub fn get_or_create(&self, name: &str) -> Channel {
        self.get_or_create_with(name, self.config().default_access_mode)
    }

    /// Get a channel, creating and registering it if needed
    ///
    /// An unparseable name gives a channel that is invalid from the start. It
    /// is never registered and never reaches the transport.
    pub fn get_or_create_with(&self, name: &str, mode: ValueAccessMode) -> Channel {
        let shared = &self.inner.shared;
        let parsed = match ChannelName::parse(name) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("Invalid channel name {name:?}: {e}");
                let core = ChannelCore::invalid(next_channel_id(), name, e.to_string(), shared.clone());
                return Channel::new(core, None);
            }
        };
        let key = parsed.to_string();

        let mut entries = self.inner.entries.lock();
        if let Some(id) = entries.by_name.get(&key).copied()
            && let Some(entry) = entries.by_id.get_mut(&id)
        {
            entry.shares += 1;
            trace!("Sharing channel {key}, now {} shares", entry.shares);
            let core = entry.core.clone();
            drop(entries);
            // A concurrent creator may not have announced it yet
            core.announce();
            return Channel::new(core, Some(self.inner.clone()));
        }
        let id = next_channel_id();
        let core = ChannelCore::new(id, parsed, mode, shared.clone());
        entries.by_id.insert(
            id,
            Entry {
                core: core.clone(),
                shares: 1,
            },
        );
        entries.by_name.insert(key.clone(), id);
        drop(entries);

        debug!("Registered channel {id} for {key}");
        core.announce();
        shared.notifier.emit(Some(id), &key, Event::Registered);
        Channel::new(core, Some(self.inner.clone()))
    }

    pub fn is_registered(&self, name: &str) -> bool {
        ChannelName::parse(name)
            .is_ok_and(|name| self.inner.entries.lock().by_name.contains_key(&name.to_string()))
    }

    pub fn describe(&self, name: &str) -> Option<ChannelInfo> {
        let key = ChannelName::parse(name).ok()?.to_string();
        let entries = self.inner.entries.lock();
        let id = entries.by_name.get(&key)?;
        entries.by_id.get(id).map(Self::info)
    }

    /// Every registered channel, ordered by id
    pub fn list_registered(&self) -> Vec<ChannelInfo> {
        let mut infos: Vec<_> = self.inner.entries.lock().by_id.values().map(Self::info).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    fn info(entry: &Entry) -> ChannelInfo {
        let snapshot = entry.core.snapshot();
        ChannelInfo {
            id: entry.core.id(),
            name: entry.core.pv().to_owned(),
            shares: entry.shares,
            sequence_number: snapshot.sequence_number,
            connected: snapshot.is_connected(),
            valid: snapshot.is_valid(),
            subscription: entry.core.subscription_state(),
            pending_requests: entry.core.pending_requests(),
        }
    }

    /// Tear down every channel, whatever handles are still held
    ///
    /// Outstanding handles see their channel as disposed.
    pub fn deregister_all(&self) {
        let drained: Vec<_> = {
            let mut entries = self.inner.entries.lock();
            entries.by_name.clear();
            entries.by_id.drain().map(|(_, entry)| entry.core).collect()
        };
        debug!("Deregistering {} channels", drained.len());
        for core in drained {
            core.teardown();
            self.inner
                .shared
                .notifier
                .emit(Some(core.id()), core.pv(), Event::Deregistered);
        }
    }

    /// Receive every notification emitted from now on
    pub fn subscribe_notifications(&self) -> NotificationReceiver {
        NotificationReceiver::new(self.inner.shared.notifier.subscribe())
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("context", &self.inner.shared.context)
            .field("channels", &self.inner.entries.lock().by_id.len())
            .finish()
    }
}
