// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Outstanding RPC calls keyed by correlation id.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::oneshot::{self, error::RecvError};
use uuid::Uuid;

/// Lifecycle of one RPC call, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcCallState {
    Created,
    Published,
    Waiting,
    Completed,
    TimedOut,
    Cancelled,
}

impl fmt::Display for RpcCallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            RpcCallState::Created => "created",
            RpcCallState::Published => "published",
            RpcCallState::Waiting => "waiting",
            RpcCallState::Completed => "completed",
            RpcCallState::TimedOut => "timed_out",
            RpcCallState::Cancelled => "cancelled",
        };
        f.write_str(state)
    }
}

struct Slot {
    /// Reply listener whose queue the call's reply is routed to.
    listener: u64,
    sender: oneshot::Sender<Vec<u8>>,
}

#[derive(Default)]
struct Calls {
    slots: HashMap<String, Slot>,
    /// Listeners whose reply stream has ended.
    stopped: HashSet<u64>,
}

/// Result slots of the calls waiting for a reply.
#[derive(Default)]
pub(crate) struct PendingCalls {
    calls: Mutex<Calls>,
}

impl PendingCalls {
    fn calls(&self) -> MutexGuard<'_, Calls> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a call under a fresh correlation id, answered through the
    /// reply listener numbered `listener`.
    ///
    /// A call registered on a stopped listener fails as soon as it is awaited.
    pub(crate) fn register(self: &Arc<Self>, listener: u64) -> PendingCall {
        let correlation_id = Uuid::new_v4().to_string();
        let (sender, receiver) = oneshot::channel();

        let mut calls = self.calls();
        if !calls.stopped.contains(&listener) {
            calls
                .slots
                .insert(correlation_id.clone(), Slot { listener, sender });
        }
        drop(calls);

        PendingCall {
            correlation_id,
            receiver,
            calls: self.clone(),
        }
    }

    /// Hands `body` to the call waiting on `correlation_id`.
    ///
    /// Returns false when no such call is waiting.
    pub(crate) fn complete(&self, correlation_id: &str, body: Vec<u8>) -> bool {
        let Some(slot) = self.calls().slots.remove(correlation_id) else {
            return false;
        };

        slot.sender.send(body).is_ok()
    }

    /// Marks `listener` as stopped and drops the slots of every call answered
    /// through it; their waiters wake up with an error.
    ///
    /// Returns the number of calls abandoned.
    pub(crate) fn abandon(&self, listener: u64) -> usize {
        let mut calls = self.calls();
        calls.stopped.insert(listener);

        let before = calls.slots.len();
        calls.slots.retain(|_, slot| slot.listener != listener);
        before - calls.slots.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.calls().slots.len()
    }

    fn remove(&self, correlation_id: &str) {
        self.calls().slots.remove(correlation_id);
    }
}

/// A registered call; dropping it forgets the call.
pub(crate) struct PendingCall {
    correlation_id: String,
    receiver: oneshot::Receiver<Vec<u8>>,
    calls: Arc<PendingCalls>,
}

impl PendingCall {
    pub(crate) fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Waits for the reply body. Fails when the slot was dropped unanswered.
    pub(crate) async fn reply(&mut self) -> Result<Vec<u8>, RecvError> {
        (&mut self.receiver).await
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.calls.remove(&self.correlation_id);
    }
}
