//! # knc-dispatch
//!
//! Work dispatch and reply decoding engine for KnC-style hashing boards.
//!
//! The board sits behind a full-duplex bus: every transaction sends one
//! fixed-size request buffer and receives a reply buffer of the same size.
//! This crate owns the host side of that exchange for one device.
//!
//! ## Architecture
//!
//! - **Pending queue**: work waiting to be sent, bounded by the learned
//!   device capacity
//! - **In-flight registry**: work the device accepted, keyed by its 15-bit
//!   device identifier
//! - **Poll cycle**: prune, encode, exchange, route results, flush, accept,
//!   learn capacity, schedule the next poll
//!
//! Results are routed to per-core consumers through [`CoreRegistry`], and
//! staleness decisions come from a host-supplied [`StalenessOracle`].
//!
//! ## Example
//!
//! ```
//! use std::time::Instant;
//! use knc_dispatch::protocol::ReplyBuilder;
//! use knc_dispatch::{CoreTable, DeviceConfig, Dispatcher, ScriptedBus, WorkItem};
//!
//! let bus = ScriptedBus::new();
//! let script = bus.handle();
//! let mut dispatcher = Dispatcher::new(bus, DeviceConfig::default()).unwrap();
//! let mut cores = CoreTable::with_layout(0..1, 4);
//! let never_stale = |_: &WorkItem, _: Instant, _: bool| false;
//!
//! let now = Instant::now();
//! assert!(dispatcher.enqueue(WorkItem::new([0; 32], [0; 12], now), &never_stale, now));
//!
//! script.push_reply(ReplyBuilder::new(0x1000).accepted(1).build());
//! let report = dispatcher.poll(&mut cores, &never_stale, now).unwrap();
//! assert_eq!(report.accepted, 1);
//! assert_eq!(dispatcher.state().in_flight().len(), 1);
//! ```
//!
//! For a host that runs on tokio, [`runner::spawn_device`] drives the poll
//! cycle on its own task and hands out cloneable [`DeviceHandle`]s.

pub mod capacity;
pub mod config;
pub mod core;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod staleness;
pub mod transport;
pub mod work;

pub use crate::core::{CoreHandle, CoreId, CoreRegistry, CoreStats, CoreTable};
pub use config::DeviceConfig;
pub use dispatcher::{DeviceQueueState, Dispatcher, PollReport};
pub use error::{DispatchError, Result};
pub use runner::{spawn_device, DeviceHandle, DeviceParts};
pub use staleness::{StalenessOracle, TipTracker};
pub use transport::{BusTransport, ScriptedBus, ScriptedBusHandle};
pub use work::WorkItem;
