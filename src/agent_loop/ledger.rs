//! Per-resource sequential queues.
//!
//! Each resource key owns a queue of tickets numbered in issuance order.
//! A ticket's holder may start work immediately, but observes the resource
//! only once every earlier ticket on the same key has been released. Keys
//! are independent of each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::error::WeftError;

#[derive(Debug)]
struct KeyQueue {
    /// Number of tickets issued so far.
    issued: u64,
    /// Sequence number of the ticket whose turn it is.
    done: Arc<watch::Sender<u64>>,
}

/// Arena of per-key queues, owned by one dispatcher for the length of a run.
///
/// Entries are created lazily on first touch and never removed.
#[derive(Debug, Default)]
pub struct ResourceLedger {
    queues: Mutex<HashMap<String, KeyQueue>>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next ticket in `key`'s queue.
    pub fn issue(&self, key: &str) -> Ticket {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let queue = queues.entry(key.to_string()).or_insert_with(|| KeyQueue {
            issued: 0,
            done: Arc::new(watch::channel(0).0),
        });
        let seq = queue.issued;
        queue.issued += 1;
        Ticket {
            key: key.to_string(),
            seq,
            done: Arc::clone(&queue.done),
        }
    }

    /// Tickets issued on `key` that have not been released yet.
    pub fn in_flight(&self, key: &str) -> u64 {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues
            .get(key)
            .map(|q| q.issued - *q.done.borrow())
            .unwrap_or(0)
    }

    /// Every key touched so far, sorted.
    pub fn keys(&self) -> Vec<String> {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<_> = queues.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// A place in one key's queue.
#[derive(Debug)]
pub struct Ticket {
    key: String,
    seq: u64,
    done: Arc<watch::Sender<u64>>,
}

impl Ticket {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// A cloneable handle that resolves once this ticket's turn arrives.
    pub fn waiter(&self) -> TurnWaiter {
        TurnWaiter {
            seq: self.seq,
            rx: self.done.subscribe(),
        }
    }

    /// Wait for this ticket's turn, then pass the turn to the next ticket.
    ///
    /// Must be called exactly once, after the holder's work on the resource
    /// has finished.
    pub async fn release(self) -> Result<(), WeftError> {
        self.waiter().wait().await?;
        self.done.send_replace(self.seq + 1);
        Ok(())
    }
}

/// Waits for a ticket's turn in its queue.
#[derive(Debug, Clone)]
pub struct TurnWaiter {
    seq: u64,
    rx: watch::Receiver<u64>,
}

impl TurnWaiter {
    pub async fn wait(&self) -> Result<(), WeftError> {
        let mut rx = self.rx.clone();
        let seq = self.seq;
        rx.wait_for(|done| *done >= seq)
            .await
            .map(|_| ())
            .map_err(|_| WeftError::InvalidState("resource queue closed".into()))
    }
}
