/// Message channel plumbing for the member -> coordinator path.
///
/// The transport is a bounded async-channel, which gives FIFO delivery
/// per link.  The `CorrelationRegistry` maps outstanding request ids to
/// one-shot reply slots; the deadline itself is enforced by the caller
/// (`async_std::future::timeout` around the slot receiver) which discards
/// the id on expiry, so a reply that arrives late finds nothing to
/// resolve and is dropped.
///
use crate::message::{OpResult, Reply, Request};
use async_channel::{Receiver, Sender};
use hashbrown::HashMap;
use log::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// one message on the wire; `reply_to` is the sender's reply link
#[derive(Debug, Clone)]
pub struct Envelope {
    pub request: Request,
    pub reply_to: Option<Sender<Reply>>,
}

impl Envelope {
    pub fn correlated(request: Request, reply_to: Sender<Reply>) -> Envelope {
        Envelope {
            request,
            reply_to: Some(reply_to),
        }
    }

    pub fn fire_and_forget(request: Request) -> Envelope {
        Envelope {
            request,
            reply_to: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct CorrelationRegistry {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Sender<OpResult>>>,
}

impl CorrelationRegistry {
    pub fn new() -> CorrelationRegistry {
        CorrelationRegistry::default()
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Sender<OpResult>>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// create a pending call: a fresh id and the slot its reply lands in
    pub fn register(&self) -> (u64, Receiver<OpResult>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = async_channel::bounded(1);
        self.pending().insert(id, tx);
        (id, rx)
    }

    /// drop a pending call, e.g. when its deadline fired
    pub fn discard(&self, id: u64) -> bool {
        self.pending().remove(&id).is_some()
    }

    /// resolve the matching pending call; unknown ids are stale replies
    /// and are dropped
    pub fn resolve(&self, reply: Reply) -> bool {
        let slot = self.pending().remove(&reply.id);
        match slot {
            Some(tx) => tx.try_send(reply.body).is_ok(),
            None => {
                debug!("dropping stale reply, id: {}", reply.id);
                false
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.pending().len()
    }
}
