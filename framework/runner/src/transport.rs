use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use gust_core::prelude::CancelListener;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

/// Handles one inbound message. Returning an error marks the message as
/// failed for transports that distinguish; delivery is at-least-once either
/// way, so handlers must be idempotent per scenario file.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> anyhow::Result<()>;
}

/// The publish/subscribe transport carrying commands and reports.
///
/// Implementations wrap an external broker (SNS/SQS, Pub/Sub). The long
/// polling and acknowledgement mechanics live behind this seam.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> anyhow::Result<()>;

    /// Receive messages for `subject` and feed them to `handler`, one at a
    /// time, until `cancel` fires.
    async fn subscribe(
        &self,
        subject: &str,
        handler: Arc<dyn MessageHandler>,
        cancel: CancelListener,
    ) -> anyhow::Result<()>;
}

/// In-process channel used by tests and by local single-process mode. One
/// queue per subject; published messages are buffered until a subscriber
/// drains them.
#[derive(Default)]
pub struct LocalChannel {
    subjects: Mutex<HashMap<String, SubjectQueue>>,
}

struct SubjectQueue {
    sender: mpsc::UnboundedSender<Vec<u8>>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl LocalChannel {
    pub fn new() -> Self {
        Self::default()
    }

    async fn queue(&self, subject: &str) -> (mpsc::UnboundedSender<Vec<u8>>, Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>) {
        let mut subjects = self.subjects.lock().await;
        let queue = subjects.entry(subject.to_string()).or_insert_with(|| {
            let (sender, receiver) = mpsc::unbounded_channel();
            SubjectQueue {
                sender,
                receiver: Arc::new(Mutex::new(receiver)),
            }
        });
        (queue.sender.clone(), queue.receiver.clone())
    }
}

#[async_trait]
impl MessageChannel for LocalChannel {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        let (sender, _) = self.queue(subject).await;
        sender
            .send(payload)
            .map_err(|_| anyhow::anyhow!("Subject {subject} has been closed"))
    }

    async fn subscribe(
        &self,
        subject: &str,
        handler: Arc<dyn MessageHandler>,
        mut cancel: CancelListener,
    ) -> anyhow::Result<()> {
        let (_, receiver) = self.queue(subject).await;
        let mut receiver = receiver.lock().await;

        loop {
            tokio::select! {
                message = receiver.recv() => {
                    let Some(payload) = message else {
                        return Ok(());
                    };
                    if let Err(e) = handler.handle(&payload).await {
                        log::error!("Message handler failed: {e:#}");
                    }
                }
                _ = cancel.wait_for_cancel() => {
                    log::info!("Subscriber for {subject} stopping");
                    return Ok(());
                }
            }
        }
    }
}
