use std::sync::atomic::{AtomicBool, Ordering};
use std::{borrow::BorrowMut, sync::Arc};

use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::{Receiver, Sender};
use tokio::sync::Mutex;

/// Trigger side of a cooperative cancellation pair.
///
/// One handle is created per in-flight execution. Cancelling is a broadcast,
/// so every [CancelListener] derived from the handle observes it.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    sender: Sender<()>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        Self {
            sender: tokio::sync::broadcast::channel(1).0,
        }
    }

    pub fn cancel(&self) {
        if let Err(e) = self.sender.send(()) {
            // Will fail if nobody is listening for the cancellation, in which
            // case the log message can be ignored.
            log::debug!("Failed to send cancellation signal: {e:?}");
        }
    }

    pub fn new_listener(&self) -> CancelListener {
        CancelListener::new(self.sender.subscribe())
    }
}

#[derive(Clone, Debug)]
pub struct CancelListener {
    receiver: Arc<Mutex<Receiver<()>>>,
    cancelled: Arc<AtomicBool>,
}

impl CancelListener {
    pub(crate) fn new(receiver: Receiver<()>) -> Self {
        Self {
            receiver: Arc::new(Mutex::new(receiver)),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Point in time check whether the execution has been cancelled. The
    /// observation is latched and shared with every clone of this listener,
    /// so once this returns true it keeps returning true at every later
    /// checkpoint.
    pub fn is_cancelled(&mut self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return true;
        }

        let observed = match self.receiver.try_lock() {
            Ok(mut guard) => match guard.try_recv() {
                Ok(_) | Err(TryRecvError::Lagged(_)) => true,
                // A closed channel means the handle is gone and the execution
                // can never be cancelled.
                Err(TryRecvError::Closed) => false,
                Err(TryRecvError::Empty) => false,
            },
            Err(_) => false,
        };

        if observed {
            self.cancelled.store(true, Ordering::SeqCst);
        }
        observed
    }

    /// Wait for the cancellation signal. It is safe to race this with another
    /// future so that the signal can be used to cancel work in progress.
    pub async fn wait_for_cancel(&mut self) {
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }

        match self.receiver.borrow_mut().lock().await.recv().await {
            Ok(()) | Err(RecvError::Lagged(_)) => {
                self.cancelled.store(true, Ordering::SeqCst);
            }
            // A closed channel means the handle is gone and the execution can
            // never be cancelled, so wait forever rather than firing
            // spuriously.
            Err(RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

#[derive(derive_more::Error, derive_more::Display, Debug)]
pub struct CancelledError {
    msg: String,
}

impl Default for CancelledError {
    fn default() -> Self {
        Self {
            msg: "Execution cancelled".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listener_observes_cancel() {
        let handle = CancelHandle::new();
        let mut listener = handle.new_listener();

        assert!(!listener.is_cancelled());
        handle.cancel();
        assert!(listener.is_cancelled());
    }

    #[tokio::test]
    async fn every_listener_observes_cancel() {
        let handle = CancelHandle::new();
        let mut first = handle.new_listener();
        let mut second = handle.new_listener();

        handle.cancel();

        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
    }

    #[tokio::test]
    async fn wait_for_cancel_resolves() {
        let handle = CancelHandle::new();
        let mut listener = handle.new_listener();

        handle.cancel();
        listener.wait_for_cancel().await;
    }

    #[tokio::test]
    async fn dropped_handle_never_reads_as_cancelled() {
        let mut listener = CancelHandle::new().new_listener();

        assert!(!listener.is_cancelled());
        assert!(!listener.is_cancelled());
    }

    #[tokio::test]
    async fn cancellation_latches_across_clones() {
        let handle = CancelHandle::new();
        let mut listener = handle.new_listener();
        let mut clone = listener.clone();

        handle.cancel();

        // The first observation consumes the broadcast message; the latch
        // keeps this listener and every clone reporting cancelled.
        assert!(listener.is_cancelled());
        assert!(listener.is_cancelled());
        assert!(clone.is_cancelled());
    }
}
