//! Messages that a caller waits for, handed over by the reader task.

use std::collections::VecDeque;

use tokio::sync::mpsc;

use crate::{
    bitfield::Bitfield,
    error::Error,
    extensions::{Extension, MetadataMsg},
};

/// Messages that some operation of the connection may be waiting for.
#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    Bitfield(Bitfield),
    Extension(Extension),
    Metadata(MetadataMsg),
}

/// Receiving side of the control messages. Messages that don't match a wait
/// are kept, in order, for the next one.
#[derive(Debug)]
pub struct ControlQueue {
    rx: mpsc::UnboundedReceiver<Control>,
    pending: VecDeque<Control>,
}

impl ControlQueue {
    pub fn new(rx: mpsc::UnboundedReceiver<Control>) -> Self {
        Self { rx, pending: VecDeque::new() }
    }

    /// Take the first message that matches `predicate`, looking at the
    /// already received ones first. Errors when the reader is gone.
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> Result<Control, Error>
    where
        F: FnMut(&Control) -> bool,
    {
        if let Some(i) = self.pending.iter().position(&mut predicate) {
            if let Some(msg) = self.pending.remove(i) {
                return Ok(msg);
            }
        }

        loop {
            let msg = self.rx.recv().await.ok_or(Error::PeerClosedSocket)?;
            if predicate(&msg) {
                return Ok(msg);
            }
            self.pending.push_back(msg);
        }
    }

    /// Drop every message received so far.
    pub fn clear(&mut self) {
        self.pending.clear();
        while self.rx.try_recv().is_ok() {}
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn requeues_other_messages() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut queue = ControlQueue::new(rx);

        tx.send(Control::Metadata(MetadataMsg::Reject(0))).unwrap();
        tx.send(Control::Extension(Extension::default())).unwrap();
        tx.send(Control::Metadata(MetadataMsg::Reject(1))).unwrap();

        let msg = queue
            .wait_for(|m| matches!(m, Control::Extension(_)))
            .await
            .unwrap();
        assert_eq!(msg, Control::Extension(Extension::default()));
        assert_eq!(queue.pending_len(), 1);

        // the buffered message comes first, in order
        let msg = queue
            .wait_for(|m| matches!(m, Control::Metadata(_)))
            .await
            .unwrap();
        assert_eq!(msg, Control::Metadata(MetadataMsg::Reject(0)));

        let msg = queue
            .wait_for(|m| matches!(m, Control::Metadata(_)))
            .await
            .unwrap();
        assert_eq!(msg, Control::Metadata(MetadataMsg::Reject(1)));
    }

    #[tokio::test]
    async fn closed_reader() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut queue = ControlQueue::new(rx);

        tx.send(Control::Metadata(MetadataMsg::Reject(0))).unwrap();
        drop(tx);

        let r = queue.wait_for(|m| matches!(m, Control::Bitfield(_))).await;
        assert!(matches!(r, Err(Error::PeerClosedSocket)));
        assert_eq!(queue.pending_len(), 1);
    }

    #[tokio::test]
    async fn clear_drops_everything() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut queue = ControlQueue::new(rx);

        tx.send(Control::Metadata(MetadataMsg::Reject(0))).unwrap();
        tx.send(Control::Metadata(MetadataMsg::Reject(1))).unwrap();
        let _ = queue.wait_for(|m| matches!(m, Control::Metadata(MetadataMsg::Reject(1)))).await;
        assert_eq!(queue.pending_len(), 1);

        tx.send(Control::Extension(Extension::default())).unwrap();
        queue.clear();
        assert_eq!(queue.pending_len(), 0);

        tx.send(Control::Metadata(MetadataMsg::Reject(2))).unwrap();
        let msg = queue.wait_for(|_| true).await.unwrap();
        assert_eq!(msg, Control::Metadata(MetadataMsg::Reject(2)));
    }
}
