//! In-memory bus for tests and simulations.
//!
//! [`ScriptedBus`] records every outgoing transaction and answers each one
//! with the next queued reply. When the script runs dry it answers with an
//! all-zero buffer, which the dispatcher reads as "nothing accepted, no
//! records". A cloneable [`ScriptedBusHandle`] lets a test keep scripting
//! and inspecting after the bus has been moved into a dispatcher.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

use super::BusTransport;
use crate::error::{DispatchError, Result};

/// A queued device answer.
#[derive(Debug, Clone)]
enum Scripted {
    Reply(Bytes),
    Fail(String),
}

#[derive(Debug, Default)]
struct Shared {
    script: VecDeque<Scripted>,
    sent: Vec<Bytes>,
}

/// Bus transport driven by a script.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBus {
    shared: Arc<Mutex<Shared>>,
}

/// Handle for scripting and inspecting a [`ScriptedBus`].
#[derive(Debug, Clone)]
pub struct ScriptedBusHandle {
    shared: Arc<Mutex<Shared>>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedBus {
    /// Create a bus with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a handle sharing this bus's script.
    pub fn handle(&self) -> ScriptedBusHandle {
        ScriptedBusHandle {
            shared: self.shared.clone(),
        }
    }
}

impl ScriptedBusHandle {
    /// Queue a reply for the next exchange.
    pub fn push_reply(&self, reply: impl Into<Bytes>) {
        lock(&self.shared).script.push_back(Scripted::Reply(reply.into()));
    }

    /// Queue a failure for the next exchange.
    pub fn push_failure(&self, message: &str) {
        lock(&self.shared)
            .script
            .push_back(Scripted::Fail(message.to_string()));
    }

    /// Every transaction sent so far.
    pub fn sent(&self) -> Vec<Bytes> {
        lock(&self.shared).sent.clone()
    }

    /// The most recent transaction, if any.
    pub fn last_sent(&self) -> Option<Bytes> {
        lock(&self.shared).sent.last().cloned()
    }

    /// Number of exchanges performed.
    pub fn exchanges(&self) -> usize {
        lock(&self.shared).sent.len()
    }

    /// Number of scripted answers not yet consumed.
    pub fn pending_script(&self) -> usize {
        lock(&self.shared).script.len()
    }
}

impl BusTransport for ScriptedBus {
    fn exchange(&mut self, tx: &[u8]) -> Result<Vec<u8>> {
        let mut shared = lock(&self.shared);
        shared.sent.push(Bytes::copy_from_slice(tx));
        match shared.script.pop_front() {
            Some(Scripted::Reply(reply)) => Ok(reply.to_vec()),
            Some(Scripted::Fail(message)) => Err(DispatchError::Transport(message)),
            None => Ok(vec![0u8; tx.len()]),
        }
    }
}
