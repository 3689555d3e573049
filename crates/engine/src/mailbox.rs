//! Named message channels shared between tasks of a run.

use std::sync::Arc;

use taskflow_types::Msg;
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::error::FlowError;

struct Envelope {
    msg: Msg,
    /// Present on zero-capacity mailboxes; fired once a receiver has taken the message.
    delivered: Option<oneshot::Sender<()>>,
}

/// A bounded channel created by `csp.Chan`.
///
/// Capacity zero gives rendezvous semantics: `send` returns only after a
/// receiver has taken the message.
pub struct Mailbox {
    name: String,
    capacity: usize,
    sender: mpsc::Sender<Envelope>,
    receiver: Mutex<mpsc::Receiver<Envelope>>,
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox").field("name", &self.name).field("capacity", &self.capacity).finish()
    }
}

impl Mailbox {
    pub fn new(name: impl Into<String>, capacity: usize) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Arc::new(Self {
            name: name.into(),
            capacity,
            sender,
            receiver: Mutex::new(receiver),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn send(&self, msg: Msg) -> Result<(), FlowError> {
        let closed = || FlowError::ChannelClosed(self.name.clone());
        if self.capacity > 0 {
            return self.sender.send(Envelope { msg, delivered: None }).await.map_err(|_| closed());
        }

        let (delivered_tx, delivered_rx) = oneshot::channel();
        self.sender
            .send(Envelope {
                msg,
                delivered: Some(delivered_tx),
            })
            .await
            .map_err(|_| closed())?;
        delivered_rx.await.map_err(|_| closed())
    }

    pub async fn recv(&self) -> Result<Msg, FlowError> {
        let mut receiver = self.receiver.lock().await;
        let envelope = receiver.recv().await.ok_or_else(|| FlowError::ChannelClosed(self.name.clone()))?;
        if let Some(delivered) = envelope.delivered {
            let _ = delivered.send(());
        }
        Ok(envelope.msg)
    }
}
