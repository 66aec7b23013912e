//! Once-settable completion signals that any number of tasks can await.

use std::{sync::Arc, time::Duration};

use tokio::{select, sync::watch};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome<T> {
    Completed(T),
    TimedOut,
    Cancelled,
}

/// Completed at most once, by a single writer
///
/// Setting a signal that is already complete does nothing, so a response
/// arriving after its waiter gave up is simply absorbed.
#[derive(Debug)]
pub struct CompletionSignal<T> {
    sender: Arc<watch::Sender<Option<T>>>,
}

impl<T> Clone for CompletionSignal<T> {
    fn clone(&self) -> Self {
        CompletionSignal {
            sender: self.sender.clone(),
        }
    }
}

impl<T: Clone + Send + Sync> Default for CompletionSignal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync> CompletionSignal<T> {
    pub fn new() -> Self {
        CompletionSignal {
            sender: Arc::new(watch::Sender::new(None)),
        }
    }

    /// Complete the signal. Returns false if it was already complete.
    pub fn set(&self, value: T) -> bool {
        let mut value = Some(value);
        self.sender.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = value.take();
            true
        })
    }

    pub fn is_set(&self) -> bool {
        self.sender.borrow().is_some()
    }

    pub fn get(&self) -> Option<T> {
        self.sender.borrow().clone()
    }

    /// Are both handles for the same signal?
    pub fn same_signal(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.sender, &other.sender)
    }

    pub fn waiter(&self) -> SignalWaiter<T> {
        SignalWaiter {
            receiver: self.sender.subscribe(),
        }
    }
}

pub struct SignalWaiter<T> {
    receiver: watch::Receiver<Option<T>>,
}

impl<T: Clone + Send + Sync> SignalWaiter<T> {
    /// Wait for the signal, giving up at `timeout` or when `cancel` fires
    ///
    /// A signal that is already complete wins over cancellation.
    pub async fn wait(mut self, timeout: Duration, cancel: &CancellationToken) -> WaitOutcome<T> {
        if let Some(value) = self.receiver.borrow().clone() {
            return WaitOutcome::Completed(value);
        }
        let waiting = async {
            select! {
                biased;
                result = self.receiver.wait_for(Option::is_some) => match result {
                    Ok(value) => match value.clone() {
                        Some(value) => WaitOutcome::Completed(value),
                        None => WaitOutcome::Cancelled,
                    },
                    // Every signal for this waiter has been dropped
                    Err(_) => WaitOutcome::Cancelled,
                },
                _ = cancel.cancelled() => WaitOutcome::Cancelled,
            }
        };
        tokio::time::timeout(timeout, waiting)
            .await
            .unwrap_or(WaitOutcome::TimedOut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_once() {
        let signal = CompletionSignal::new();
        let waiter = signal.waiter();
        let second = signal.waiter();
        let cancel = CancellationToken::new();
        assert!(signal.set(4));
        assert!(!signal.set(5));
        assert_eq!(
            waiter.wait(Duration::from_secs(1), &cancel).await,
            WaitOutcome::Completed(4)
        );
        assert_eq!(
            second.wait(Duration::from_secs(1), &cancel).await,
            WaitOutcome::Completed(4)
        );
        assert_eq!(signal.get(), Some(4));
    }

    #[tokio::test]
    async fn late_set_after_timeout_is_absorbed() {
        let signal = CompletionSignal::<u32>::new();
        let cancel = CancellationToken::new();
        assert_eq!(
            signal.waiter().wait(Duration::from_millis(20), &cancel).await,
            WaitOutcome::TimedOut
        );
        assert!(signal.set(1));
        assert!(signal.is_set());
    }

    #[tokio::test]
    async fn cancellation_and_set_from_another_task() {
        let signal = CompletionSignal::<String>::new();
        let cancel = CancellationToken::new();
        let waiter = signal.waiter();
        let setter = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            setter.set("done".to_owned());
        });
        assert_eq!(
            waiter.wait(Duration::from_secs(5), &cancel).await,
            WaitOutcome::Completed("done".to_owned())
        );

        let pending = CompletionSignal::<String>::new();
        cancel.cancel();
        assert_eq!(
            pending.waiter().wait(Duration::from_secs(5), &cancel).await,
            WaitOutcome::Cancelled
        );
    }
}
