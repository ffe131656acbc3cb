use std::collections::VecDeque;
use std::sync::Mutex;
use bytes::Bytes;
use tracing::warn;
use crate::error::{Result, TransportError};

/// The bounded send queue of a persistent connection. It holds serialized messages while the
///  connection is checked out by another sender or is being reestablished.
pub struct MessageContainer {
    uri: String,
    max_items: usize,
    items: Mutex<VecDeque<Bytes>>,
}

impl MessageContainer {
    pub fn new(uri: impl Into<String>, max_items: usize) -> MessageContainer {
        MessageContainer {
            uri: uri.into(),
            max_items,
            items: Default::default(),
        }
    }

    /// Fails with [TransportError::QueueOverloaded] if the queue is full. That is a critical
    ///  failure: the caller disposes the connection.
    pub fn push(&self, content: Bytes) -> Result<()> {
        let mut items = self.items.lock().unwrap();
        if items.len() >= self.max_items {
            warn!("send queue for {} is full ({} messages)", self.uri, items.len());
            return Err(TransportError::QueueOverloaded {
                uri: self.uri.clone(),
                max_items: self.max_items,
            });
        }
        items.push_back(content);
        Ok(())
    }

    pub fn pop(&self) -> Option<Bytes> {
        self.items.lock().unwrap().pop_front()
    }

    /// puts a message that could not be sent back at the head of the queue
    pub fn push_front(&self, content: Bytes) {
        self.items.lock().unwrap().push_front(content);
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> usize {
        let mut items = self.items.lock().unwrap();
        let result = items.len();
        items.clear();
        result
    }
}
