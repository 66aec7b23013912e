use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::{Stream, StreamExt, wrappers::BroadcastStream};

use super::notify::Notification;

/// Error type for `NotificationReceiver::recv`
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotificationRecvError {
    #[error("Registry closed")]
    Closed,
    #[error("Receiver lagged by {0} notifications")]
    Lagged(u64),
}

impl From<broadcast::error::RecvError> for NotificationRecvError {
    fn from(err: broadcast::error::RecvError) -> Self {
        match err {
            broadcast::error::RecvError::Closed => Self::Closed,
            broadcast::error::RecvError::Lagged(n) => Self::Lagged(n),
        }
    }
}

/// Error type for `NotificationReceiver::try_recv`
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotificationTryRecvError {
    #[error("No notifications outstanding")]
    Empty,
    #[error("Registry closed")]
    Closed,
    #[error("Receiver lagged by {0} notifications")]
    Lagged(u64),
}

impl From<broadcast::error::TryRecvError> for NotificationTryRecvError {
    fn from(err: broadcast::error::TryRecvError) -> Self {
        match err {
            broadcast::error::TryRecvError::Empty => Self::Empty,
            broadcast::error::TryRecvError::Closed => Self::Closed,
            broadcast::error::TryRecvError::Lagged(n) => Self::Lagged(n),
        }
    }
}

/// A registry's notification feed
///
/// Slow receivers lose the oldest notifications and are told how many they
/// missed; the sink configured on the registry always sees everything.
pub struct NotificationReceiver {
    inner: broadcast::Receiver<Notification>,
}

impl NotificationReceiver {
    pub(crate) fn new(inner: broadcast::Receiver<Notification>) -> Self {
        Self { inner }
    }

    /// Receive the next notification
    pub async fn recv(&mut self) -> Result<Notification, NotificationRecvError> {
        Ok(self.inner.recv().await?)
    }

    /// Blocking receive for synchronous contexts
    pub fn blocking_recv(&mut self) -> Result<Notification, NotificationRecvError> {
        Ok(self.inner.blocking_recv()?)
    }

    /// Try to receive a notification without waiting
    pub fn try_recv(&mut self) -> Result<Notification, NotificationTryRecvError> {
        Ok(self.inner.try_recv()?)
    }

    /// Everything already queued, without waiting
    pub fn drain(&mut self) -> Vec<Notification> {
        let mut drained = Vec::new();
        loop {
            match self.try_recv() {
                Ok(notification) => drained.push(notification),
                Err(NotificationTryRecvError::Lagged(_)) => continue,
                Err(_) => return drained,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// A new receiver starting from the next notification sent
    pub fn resubscribe(&self) -> Self {
        Self {
            inner: self.inner.resubscribe(),
        }
    }

    /// Turn into a stream, skipping over lag
    pub fn into_stream(self) -> impl Stream<Item = Notification> {
        BroadcastStream::new(self.inner).filter_map(Result::ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::notify::Event;

    fn notification(n: u64) -> Notification {
        Notification {
            channel: None,
            pv: format!("PV{n}"),
            event: Event::Registered,
        }
    }

    #[tokio::test]
    async fn lag_is_reported_then_recovered() {
        let (sender, receiver) = broadcast::channel(2);
        let mut receiver = NotificationReceiver::new(receiver);
        for n in 0..4 {
            sender.send(notification(n)).unwrap();
        }
        assert_eq!(receiver.recv().await, Err(NotificationRecvError::Lagged(2)));
        assert_eq!(receiver.recv().await.unwrap().pv, "PV2");
        assert_eq!(receiver.drain().len(), 1);
        assert_eq!(receiver.try_recv(), Err(NotificationTryRecvError::Empty));
        drop(sender);
        assert_eq!(receiver.try_recv(), Err(NotificationTryRecvError::Closed));
    }

    #[tokio::test]
    async fn stream_skips_lag() {
        let (sender, receiver) = broadcast::channel(2);
        let stream = NotificationReceiver::new(receiver).into_stream();
        for n in 0..3 {
            sender.send(notification(n)).unwrap();
        }
        drop(sender);
        let pvs: Vec<_> = stream.map(|n| n.pv).collect().await;
        assert_eq!(pvs, vec!["PV1", "PV2"]);
    }
}
