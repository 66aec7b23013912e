use std::{
    cell::RefCell,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::trace;

use crate::transport::{ContextId, Transport, TransportError};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

struct Attachment {
    context: ContextId,
    transport: Weak<dyn Transport>,
}

thread_local! {
    static ATTACHED: RefCell<Option<Attachment>> = const { RefCell::new(None) };
}

/// What [`ClientContext::ensure_attached`] had to do
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Attach {
    AlreadyAttached,
    Attached,
    /// The thread was attached to another context, and has been moved
    Reattached { from: ContextId },
}

/// A client context, and the transport its wire calls go through
///
/// The transport only accepts calls from threads attached to a context. Tasks
/// move between runtime threads, so every wire call is preceded by
/// [`ClientContext::ensure_attached`].
pub struct ClientContext {
    id: ContextId,
    transport: Arc<dyn Transport>,
}

impl ClientContext {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        ClientContext {
            id: ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)),
            transport,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// Make sure the calling thread is attached to this context
    pub fn ensure_attached(&self) -> Result<Attach, TransportError> {
        ATTACHED.with(|attached| {
            let mut attached = attached.borrow_mut();
            let previous = match attached.as_ref() {
                Some(current) if current.context == self.id => return Ok(Attach::AlreadyAttached),
                Some(current) => {
                    if let Some(old) = current.transport.upgrade() {
                        old.detach_context();
                    }
                    Some(current.context)
                }
                None => None,
            };
            *attached = None;
            self.transport.attach_context(self.id)?;
            trace!("Attached thread to context {:?}", self.id);
            *attached = Some(Attachment {
                context: self.id,
                transport: Arc::downgrade(&self.transport),
            });
            Ok(match previous {
                Some(from) => Attach::Reattached { from },
                None => Attach::Attached,
            })
        })
    }

    /// The context the calling thread is attached to, if any
    pub fn current() -> Option<ContextId> {
        ATTACHED.with(|attached| attached.borrow().as_ref().map(|a| a.context))
    }
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::{LoopbackTransport, WireCall};

    #[test]
    fn attaches_once_and_moves_between_contexts() {
        std::thread::spawn(|| {
            let first_transport = Arc::new(LoopbackTransport::new());
            let second_transport = Arc::new(LoopbackTransport::new());
            let first = ClientContext::new(first_transport.clone());
            let second = ClientContext::new(second_transport.clone());

            assert_eq!(ClientContext::current(), None);
            assert_eq!(first.ensure_attached(), Ok(Attach::Attached));
            assert_eq!(first.ensure_attached(), Ok(Attach::AlreadyAttached));
            assert_eq!(ClientContext::current(), Some(first.id()));

            assert_eq!(
                second.ensure_attached(),
                Ok(Attach::Reattached { from: first.id() })
            );
            assert_eq!(ClientContext::current(), Some(second.id()));
            assert_eq!(
                first_transport.wire_calls(),
                vec![WireCall::Attach(first.id()), WireCall::Detach]
            );
            assert_eq!(
                second_transport.wire_calls(),
                vec![WireCall::Attach(second.id())]
            );
        })
        .join()
        .unwrap();
    }
}
