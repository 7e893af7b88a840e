//! Async device loop.
//!
//! Runs one [`Dispatcher`] on a dedicated tokio task so producers never
//! touch engine state directly. Producers talk to the loop through a
//! cloneable [`DeviceHandle`]; the loop serializes their commands with its
//! own polls, which is exactly the single-owner discipline the engine needs.
//!
//! # Architecture
//!
//! ```text
//! Producer 1 ─┐
//! Producer 2 ─┼─► mpsc::Sender<DeviceCommand> ─► Device Task ─► spawn_blocking(poll) ─► Bus
//! Producer N ─┘
//! ```
//!
//! The bus exchange blocks, so each poll runs on the blocking pool with the
//! engine moved in and handed back afterwards. Between polls the task waits
//! for the delay the last poll computed, or for a command, whichever comes
//! first. A flush that schedules a device flush wakes the next poll at once.
//!
//! Dropping every [`DeviceHandle`] stops the loop; the join handle then
//! yields the engine, core registry and oracle back for detach.

use std::time::Instant as StdInstant;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::core::CoreRegistry;
use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, Result};
use crate::staleness::StalenessOracle;
use crate::transport::BusTransport;
use crate::work::WorkItem;

/// A request from a producer to the device loop.
#[derive(Debug)]
pub enum DeviceCommand {
    /// Queue work; replies whether it was accepted.
    Enqueue {
        /// Work to queue.
        item: WorkItem,
        /// Acceptance result.
        reply: oneshot::Sender<bool>,
    },
    /// Discard pending work; replies whether a device flush was scheduled.
    Flush {
        /// Flush result.
        reply: oneshot::Sender<bool>,
    },
}

/// Producer side of a running device loop.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    tx: mpsc::Sender<DeviceCommand>,
}

impl DeviceHandle {
    /// Queue a work item.
    ///
    /// Returns `Ok(false)` when the device queue is full.
    pub async fn enqueue(&self, item: WorkItem) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(DeviceCommand::Enqueue { item, reply }).await?;
        rx.await.map_err(|_| DispatchError::DeviceLoopClosed)
    }

    /// Discard pending work and flush the device if its work is stale.
    pub async fn flush(&self) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(DeviceCommand::Flush { reply }).await?;
        rx.await.map_err(|_| DispatchError::DeviceLoopClosed)
    }

    /// Whether the loop has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn send(&self, command: DeviceCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| DispatchError::DeviceLoopClosed)
    }
}

/// Everything the device loop owns, returned when it stops.
#[derive(Debug)]
pub struct DeviceParts<B, C, S> {
    /// The engine.
    pub dispatcher: Dispatcher<B>,
    /// Result consumers.
    pub cores: C,
    /// Staleness oracle.
    pub oracle: S,
}

enum Wake {
    Command(Option<DeviceCommand>),
    PollDue,
}

/// Spawn the device loop on the current tokio runtime.
pub fn spawn_device<B, C, S>(
    dispatcher: Dispatcher<B>,
    cores: C,
    oracle: S,
) -> (DeviceHandle, JoinHandle<Result<DeviceParts<B, C, S>>>)
where
    B: BusTransport + Send + 'static,
    C: CoreRegistry + Send + 'static,
    S: StalenessOracle + Send + 'static,
{
    let (tx, rx) = mpsc::channel(dispatcher.config().command_channel_capacity);
    let parts = DeviceParts {
        dispatcher,
        cores,
        oracle,
    };
    let task = tokio::spawn(run_device(parts, rx));
    (DeviceHandle { tx }, task)
}

async fn run_device<B, C, S>(
    mut parts: DeviceParts<B, C, S>,
    mut rx: mpsc::Receiver<DeviceCommand>,
) -> Result<DeviceParts<B, C, S>>
where
    B: BusTransport + Send + 'static,
    C: CoreRegistry + Send + 'static,
    S: StalenessOracle + Send + 'static,
{
    let name = parts.dispatcher.config().name.clone();
    let mut deadline = Instant::now() + parts.dispatcher.next_poll_delay();

    loop {
        let wake = tokio::select! {
            biased;
            command = rx.recv() => Wake::Command(command),
            _ = tokio::time::sleep_until(deadline) => Wake::PollDue,
        };

        match wake {
            Wake::Command(None) => {
                tracing::debug!("{}: All device handles dropped, stopping", name);
                return Ok(parts);
            }
            Wake::Command(Some(DeviceCommand::Enqueue { item, reply })) => {
                let accepted = parts
                    .dispatcher
                    .enqueue(item, &parts.oracle, StdInstant::now());
                let _ = reply.send(accepted);
            }
            Wake::Command(Some(DeviceCommand::Flush { reply })) => {
                let flushing = parts.dispatcher.flush(&parts.oracle, StdInstant::now());
                if flushing {
                    deadline = Instant::now();
                }
                let _ = reply.send(flushing);
            }
            Wake::PollDue => {
                let (returned, result) = tokio::task::spawn_blocking(move || {
                    let mut parts = parts;
                    let result = parts.dispatcher.poll(
                        &mut parts.cores,
                        &parts.oracle,
                        StdInstant::now(),
                    );
                    (parts, result)
                })
                .await?;
                parts = returned;

                if let Err(err) = result {
                    tracing::debug!("{}: Poll skipped: {}", name, err);
                }
                deadline = Instant::now() + parts.dispatcher.next_poll_delay();
            }
        }
    }
}
