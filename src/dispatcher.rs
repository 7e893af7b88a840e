//! Per-device dispatch engine.
//!
//! The [`Dispatcher`] owns everything one board needs between polls: the
//! local pending queue, the in-flight registry, the capacity estimate, the
//! identifier counter and the flush flag. The host drives it through three
//! entry points, never concurrently for the same device:
//!
//! - [`Dispatcher::enqueue`] - producer hands over new work
//! - [`Dispatcher::flush`] - producer reports that upstream context moved
//! - [`Dispatcher::poll`] - scheduler runs one bus transaction
//!
//! # Poll cycle
//!
//! 1. Prune stale pending work
//! 2. Encode an optional flush command, then pending work in FIFO order
//! 3. Exchange the buffer with the device
//! 4. Route every reply record to its core
//! 5. Abandon in-flight work if a flush went out
//! 6. Move the accepted prefix of pending work into the registry
//! 7. Grow the capacity estimate and pick the next poll delay
//!
//! Reply records describe work accepted in earlier transactions, so they
//! are routed before this transaction's accepted work is registered, and
//! the flush drain only touches work the flush command actually covered.

use std::time::{Duration, Instant};

use crate::capacity::QueueCapacity;
use crate::config::DeviceConfig;
use crate::core::{CoreId, CoreRegistry};
use crate::error::{DispatchError, Result};
use crate::protocol::{
    clean_flush_request, Reply, ReplyKind, ReplyRecord, RequestBuffer, DEVICE_ID_MASK,
};
use crate::queue::PendingQueue;
use crate::registry::InFlightRegistry;
use crate::staleness::StalenessOracle;
use crate::transport::BusTransport;
use crate::work::WorkItem;

/// Mutable state for one attached device.
#[derive(Debug)]
pub struct DeviceQueueState {
    /// Discovered device queue depth.
    capacity: QueueCapacity,
    /// Identifier the next accepted item receives.
    next_id: u16,
    /// A flush command goes out with the next transaction.
    need_flush: bool,
    /// Work not yet accepted by the device.
    pending: PendingQueue,
    /// Work the device is searching.
    in_flight: InFlightRegistry,
}

impl DeviceQueueState {
    /// Fresh state with the given starting capacity.
    pub fn new(initial_capacity: usize) -> Self {
        Self {
            capacity: QueueCapacity::new(initial_capacity),
            next_id: 0,
            need_flush: false,
            pending: PendingQueue::new(),
            in_flight: InFlightRegistry::new(),
        }
    }

    /// Current capacity estimate.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// Identifier the next accepted item receives.
    #[inline]
    pub fn next_id(&self) -> u16 {
        self.next_id
    }

    /// Whether a device flush is scheduled.
    #[inline]
    pub fn need_flush(&self) -> bool {
        self.need_flush
    }

    /// The local pending queue.
    #[inline]
    pub fn pending(&self) -> &PendingQueue {
        &self.pending
    }

    /// The in-flight registry.
    #[inline]
    pub fn in_flight(&self) -> &InFlightRegistry {
        &self.in_flight
    }
}

/// Summary of one successful poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Stale pending items pruned before encoding.
    pub pruned: usize,
    /// Submission frames sent.
    pub submitted: usize,
    /// Accepted count reported by the device.
    pub accepted: usize,
    /// The device reported a receive overflow.
    pub overflow: bool,
    /// A flush command went out.
    pub flushed: bool,
    /// In-flight items abandoned because of the flush.
    pub abandoned: usize,
    /// Nonces routed against known work.
    pub nonces: usize,
    /// Work items released by WorkDone records, routable or not.
    pub work_done: usize,
    /// Records naming unknown work.
    pub unmatched: usize,
    /// Records naming unknown cores.
    pub unroutable: usize,
    /// Live entries evicted by identifier wraparound.
    pub evicted: usize,
    /// Capacity after this poll.
    pub capacity: usize,
    /// The capacity estimate grew.
    pub capacity_grew: bool,
    /// Delay before the next poll.
    pub next_poll: Duration,
}

/// Dispatch engine for one device.
pub struct Dispatcher<B> {
    config: DeviceConfig,
    bus: B,
    state: DeviceQueueState,
    tx: RequestBuffer,
    next_poll: Duration,
    queue_full: bool,
}

impl<B: BusTransport> Dispatcher<B> {
    /// Create a dispatcher without touching the bus.
    pub fn new(bus: B, config: DeviceConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            state: DeviceQueueState::new(config.initial_capacity),
            tx: RequestBuffer::new(config.buffer_size),
            config,
            bus,
            next_poll: Duration::ZERO,
            queue_full: false,
        })
    }

    /// Create a dispatcher and clear whatever the device still has queued.
    pub fn attach(bus: B, config: DeviceConfig) -> Result<Self> {
        let mut dispatcher = Self::new(bus, config)?;
        dispatcher.clean_flush()?;
        Ok(dispatcher)
    }

    /// Release the bus. Pending and in-flight work is dropped.
    pub fn detach(self) -> B {
        tracing::debug!(
            "{}: Detaching with {} pending and {} in-flight items",
            self.config.name,
            self.state.pending.len(),
            self.state.in_flight.len()
        );
        self.bus
    }

    /// Issue a flush-only transaction, ignoring the reply contents.
    pub fn clean_flush(&mut self) -> Result<()> {
        let tx = clean_flush_request(self.config.buffer_size);
        tracing::info!(
            "{}: Issuing flush command to clear out device queues",
            self.config.name
        );
        let rx = self.bus.exchange(&tx)?;
        self.check_reply_len(rx.len())?;
        self.next_poll = Duration::ZERO;
        Ok(())
    }

    /// Device configuration.
    #[inline]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Device state.
    #[inline]
    pub fn state(&self) -> &DeviceQueueState {
        &self.state
    }

    /// The bus transport.
    #[inline]
    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Delay the scheduler should wait before the next poll.
    #[inline]
    pub fn next_poll_delay(&self) -> Duration {
        self.next_poll
    }

    /// Whether the local queue is at capacity.
    #[inline]
    pub fn is_queue_full(&self) -> bool {
        self.queue_full
    }

    /// Hand a work item to the device queue.
    ///
    /// Returns `false` if the queue is full even after pruning; the item is
    /// dropped and the producer should retry later.
    pub fn enqueue<S>(&mut self, item: WorkItem, oracle: &S, now: Instant) -> bool
    where
        S: StalenessOracle + ?Sized,
    {
        self.try_enqueue(item, oracle, now).is_ok()
    }

    /// Like [`enqueue`](Self::enqueue), handing a rejected item back.
    pub fn try_enqueue<S>(
        &mut self,
        item: WorkItem,
        oracle: &S,
        now: Instant,
    ) -> std::result::Result<(), WorkItem>
    where
        S: StalenessOracle + ?Sized,
    {
        let result = self
            .state
            .pending
            .enqueue(item, &self.state.capacity, oracle, now);
        if result.is_ok() && self.state.capacity.is_full(self.state.pending.len()) {
            self.state.pending.prune_stale(oracle, now);
        }
        self.update_queue_full();
        result
    }

    /// Drop all pending work and schedule a device flush if needed.
    ///
    /// The device queue is flushed only when the newest in-flight item is
    /// strictly stale. Returns whether a device flush is scheduled as a
    /// result of this call, in which case the next poll is due immediately.
    pub fn flush<S>(&mut self, oracle: &S, now: Instant) -> bool
    where
        S: StalenessOracle + ?Sized,
    {
        let dropped = self.state.pending.clear();
        if dropped > 0 {
            tracing::debug!("{}: Dropped {} pending items", self.config.name, dropped);
        }
        self.update_queue_full();

        let stale = self
            .state
            .in_flight
            .most_recent()
            .is_some_and(|item| oracle.is_stale(item, now, true));
        if stale {
            self.request_flush();
        }
        stale
    }

    /// Unconditionally schedule a device flush with the next poll.
    pub fn request_flush(&mut self) {
        self.state.need_flush = true;
        self.next_poll = Duration::ZERO;
    }

    /// Run one bus transaction.
    ///
    /// On a transport error nothing but the next poll delay changes and the
    /// error is returned; the next poll retries at the normal interval.
    pub fn poll<C, S>(&mut self, cores: &mut C, oracle: &S, now: Instant) -> Result<PollReport>
    where
        C: CoreRegistry + ?Sized,
        S: StalenessOracle + ?Sized,
    {
        let mut report = PollReport {
            pruned: self.state.pending.prune_stale(oracle, now),
            ..PollReport::default()
        };
        self.update_queue_full();

        let flushing = self.state.need_flush;
        self.encode_request(flushing);
        report.submitted = self.tx.submitted();
        report.flushed = self.tx.has_flush();

        let rx = match self.exchange() {
            Ok(rx) => rx,
            Err(err) => {
                tracing::error!("{}: Bus exchange failed: {}", self.config.name, err);
                self.next_poll = self.config.poll_interval_duration();
                return Err(err);
            }
        };
        let reply = Reply::parse(&rx).ok_or_else(|| DispatchError::ShortBuffer {
            expected: self.config.buffer_size,
            actual: rx.len(),
        })?;

        report.overflow = reply.header.overflow;
        report.accepted = reply.header.accepted as usize;
        if report.overflow {
            tracing::debug!("{}: Receive buffer overflow reported", self.config.name);
        }
        tracing::debug!(
            "{}: {}/{} jobs accepted to queue (max={})",
            self.config.name,
            report.accepted,
            report.submitted,
            self.state.capacity.get()
        );

        for raw in reply.records() {
            if raw.record.kind == ReplyKind::None {
                continue;
            }
            tracing::debug!("{}: RECV: {}", self.config.name, raw.hex());
            if raw.record.kind.is_result() {
                self.route_record(&raw.record, cores, &mut report);
            }
        }

        let mut delay = self.config.poll_interval_duration();

        if flushing {
            self.state.need_flush = false;
            report.abandoned = self.state.in_flight.drain_all();
            delay = Duration::ZERO;
        }

        if report.accepted > 0 {
            if self.state.capacity.observe_accepted(report.accepted) {
                report.capacity_grew = true;
                delay = Duration::ZERO;
            }
            if report.accepted > report.submitted {
                tracing::debug!(
                    "{}: Device accepted {} jobs but only {} were sent",
                    self.config.name,
                    report.accepted,
                    report.submitted
                );
            }
            report.evicted = self.register_accepted(report.accepted.min(report.submitted));
        }

        self.update_queue_full();
        self.next_poll = delay;
        report.capacity = self.state.capacity.get();
        report.next_poll = delay;
        Ok(report)
    }

    fn encode_request(&mut self, flushing: bool) {
        self.tx.clear();
        if flushing {
            tracing::info!("{}: Abandoning stale searches to restart", self.config.name);
            self.tx.emit_flush();
        }
        let mut work_id = self.state.next_id;
        for item in self.state.pending.iter() {
            if !self.tx.emit_submit(work_id, &item.midstate, &item.data_tail) {
                break;
            }
            work_id = work_id.wrapping_add(1) & DEVICE_ID_MASK;
        }
    }

    fn exchange(&mut self) -> Result<Vec<u8>> {
        let rx = self.bus.exchange(self.tx.finish())?;
        self.check_reply_len(rx.len())?;
        Ok(rx)
    }

    fn check_reply_len(&self, actual: usize) -> Result<()> {
        if actual != self.config.buffer_size {
            return Err(DispatchError::ShortBuffer {
                expected: self.config.buffer_size,
                actual,
            });
        }
        Ok(())
    }

    /// Reconcile one result record with the registry, then hand it to its core.
    ///
    /// Registry bookkeeping happens even when the core is unknown, so a
    /// WorkDone for an unroutable core still releases its item.
    fn route_record<C>(&mut self, record: &ReplyRecord, cores: &mut C, report: &mut PollReport)
    where
        C: CoreRegistry + ?Sized,
    {
        let core_id = CoreId::new(record.chip, record.core);

        match record.kind {
            ReplyKind::NonceFound => {
                let item = self.state.in_flight.lookup(record.device_id);
                if item.is_none() {
                    tracing::warn!(
                        "{} {}: Got nonce found message about unknown work 0x{:04x}",
                        self.config.name,
                        core_id,
                        record.device_id
                    );
                    report.unmatched += 1;
                }
                let Some(core) = cores.route(core_id) else {
                    self.drop_unroutable(core_id, report);
                    return;
                };
                match item {
                    Some(item) => {
                        core.on_nonce(item, record.nonce);
                        report.nonces += 1;
                    }
                    None => core.on_hardware_event(record.found_nonce()),
                }
            }
            ReplyKind::WorkDone => {
                let released = self.state.in_flight.remove(record.device_id).is_some();
                if released {
                    report.work_done += 1;
                } else {
                    tracing::warn!(
                        "{} {}: Got work done message about unknown work 0x{:04x}",
                        self.config.name,
                        core_id,
                        record.device_id
                    );
                    report.unmatched += 1;
                }
                let Some(core) = cores.route(core_id) else {
                    self.drop_unroutable(core_id, report);
                    return;
                };
                if released {
                    core.on_hash_units_done(1);
                } else {
                    core.on_hardware_event(None);
                }
            }
            ReplyKind::None | ReplyKind::Reserved => {}
        }
    }

    fn drop_unroutable(&self, core_id: CoreId, report: &mut PollReport) {
        tracing::warn!(
            "{}: Dropping result for unknown core {}",
            self.config.name,
            core_id
        );
        report.unroutable += 1;
    }

    /// Move the first `count` pending items into the registry.
    ///
    /// Returns how many live entries were evicted by identifier wraparound.
    fn register_accepted(&mut self, count: usize) -> usize {
        let mut evicted = 0;
        for item in self.state.pending.take_accepted(count) {
            let id = self.state.next_id;
            self.state.next_id = id.wrapping_add(1) & DEVICE_ID_MASK;
            if self.state.in_flight.insert_evicting(id, item).is_some() {
                tracing::warn!(
                    "{}: {}; evicting unacknowledged work",
                    self.config.name,
                    DispatchError::IdentifierCollision(id)
                );
                evicted += 1;
            }
        }
        evicted
    }

    fn update_queue_full(&mut self) {
        self.queue_full = self.state.capacity.is_full(self.state.pending.len());
    }
}

impl<B> std::fmt::Debug for Dispatcher<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("next_poll", &self.next_poll)
            .field("queue_full", &self.queue_full)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CoreTable, HASHES_PER_WORK_UNIT};
    use crate::protocol::{decode_submit_frame, ReplyBuilder, REQUEST_FRAME_SIZE};
    use crate::transport::{ScriptedBus, ScriptedBusHandle};

    const SIZE: usize = 0x1000;

    fn never_stale(_: &WorkItem, _: Instant, _: bool) -> bool {
        false
    }

    fn always_stale(_: &WorkItem, _: Instant, _: bool) -> bool {
        true
    }

    fn work(tag: u8) -> WorkItem {
        WorkItem::new([tag; 32], [tag; 12], Instant::now())
    }

    fn setup(initial_capacity: usize) -> (Dispatcher<ScriptedBus>, ScriptedBusHandle, CoreTable) {
        let bus = ScriptedBus::new();
        let handle = bus.handle();
        let config = DeviceConfig::new().initial_capacity(initial_capacity);
        let dispatcher = Dispatcher::new(bus, config).unwrap();
        (dispatcher, handle, CoreTable::with_layout(0..4, 48))
    }

    fn fill(dispatcher: &mut Dispatcher<ScriptedBus>, tags: impl IntoIterator<Item = u8>) {
        for tag in tags {
            assert!(dispatcher.enqueue(work(tag), &never_stale, Instant::now()));
        }
    }

    fn submitted_ids(tx: &[u8]) -> Vec<u16> {
        tx.chunks(REQUEST_FRAME_SIZE)
            .filter_map(decode_submit_frame)
            .map(|f| f.device_id)
            .collect()
    }

    #[test]
    fn test_attach_issues_clean_flush() {
        let bus = ScriptedBus::new();
        let handle = bus.handle();
        let dispatcher = Dispatcher::attach(bus, DeviceConfig::default()).unwrap();

        let sent = handle.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].len(), SIZE);
        assert_eq!(sent[0][0], 0x30);
        assert!(sent[0][1..].iter().all(|&b| b == 0));
        assert_eq!(dispatcher.next_poll_delay(), Duration::ZERO);
    }

    #[test]
    fn test_attach_fails_on_transport_error() {
        let bus = ScriptedBus::new();
        bus.handle().push_failure("no device");
        assert!(Dispatcher::attach(bus, DeviceConfig::default()).is_err());
    }

    #[test]
    fn test_enqueue_respects_capacity() {
        let (mut dispatcher, _, _) = setup(2);
        let now = Instant::now();
        assert!(dispatcher.enqueue(work(1), &never_stale, now));
        assert!(!dispatcher.is_queue_full());
        assert!(dispatcher.enqueue(work(2), &never_stale, now));
        assert!(dispatcher.is_queue_full());
        assert!(!dispatcher.enqueue(work(3), &never_stale, now));

        let rejected = dispatcher.try_enqueue(work(4), &never_stale, now);
        assert_eq!(rejected.unwrap_err().midstate, [4; 32]);
    }

    #[test]
    fn test_accept_one_keeps_capacity_and_interval() {
        let (mut dispatcher, bus, mut cores) = setup(1);
        // five items queued while the estimate is still at its starting value
        let roomy = QueueCapacity::new(5);
        for tag in 0..5 {
            dispatcher
                .state
                .pending
                .enqueue(work(tag), &roomy, &never_stale, Instant::now())
                .unwrap();
        }

        bus.push_reply(ReplyBuilder::new(SIZE).accepted(1).build());
        let report = dispatcher.poll(&mut cores, &never_stale, Instant::now()).unwrap();

        assert_eq!(report.submitted, 5);
        assert_eq!(report.accepted, 1);
        assert_eq!(report.capacity, 1);
        assert!(!report.capacity_grew);
        assert_eq!(report.next_poll, Duration::from_millis(10));
        assert_eq!(dispatcher.state().in_flight().len(), 1);
        assert_eq!(dispatcher.state().pending().len(), 4);
        assert_eq!(dispatcher.state().in_flight().lookup(0).unwrap().midstate, [0; 32]);
        assert!(dispatcher.is_queue_full());
    }

    #[test]
    fn test_capacity_growth_requests_immediate_poll() {
        let (mut dispatcher, bus, mut cores) = setup(1);
        fill(&mut dispatcher, 0..1);
        bus.push_reply(ReplyBuilder::new(SIZE).accepted(3).build());

        let report = dispatcher.poll(&mut cores, &never_stale, Instant::now()).unwrap();
        assert!(report.capacity_grew);
        assert_eq!(report.capacity, 3);
        assert_eq!(report.next_poll, Duration::ZERO);
        assert_eq!(dispatcher.next_poll_delay(), Duration::ZERO);
        // only one item existed to register
        assert_eq!(dispatcher.state().in_flight().len(), 1);
        assert_eq!(dispatcher.state().next_id(), 1);
    }

    #[test]
    fn test_fifo_prefix_with_increasing_ids() {
        let (mut dispatcher, bus, mut cores) = setup(8);
        fill(&mut dispatcher, 10..16);
        bus.push_reply(ReplyBuilder::new(SIZE).accepted(4).build());

        dispatcher.poll(&mut cores, &never_stale, Instant::now()).unwrap();

        let sent = bus.last_sent().unwrap();
        assert_eq!(submitted_ids(&sent), vec![0, 1, 2, 3, 4, 5]);

        let registry = dispatcher.state().in_flight();
        for (id, tag) in (0u16..4).zip(10u8..14) {
            let item = registry.lookup(id).unwrap();
            assert_eq!(item.midstate, [tag; 32]);
            assert_eq!(item.device_id, Some(id));
        }
        let left: Vec<u8> = dispatcher
            .state()
            .pending()
            .iter()
            .map(|w| w.midstate[0])
            .collect();
        assert_eq!(left, vec![14, 15]);

        // the next transaction continues numbering where acceptance stopped
        bus.push_reply(ReplyBuilder::new(SIZE).build());
        dispatcher.poll(&mut cores, &never_stale, Instant::now()).unwrap();
        assert_eq!(submitted_ids(&bus.last_sent().unwrap()), vec![4, 5]);
    }

    #[test]
    fn test_submissions_limited_to_buffer() {
        let bus = ScriptedBus::new();
        let handle = bus.handle();
        let config = DeviceConfig::new()
            .buffer_size(REQUEST_FRAME_SIZE * 3)
            .initial_capacity(10);
        let mut dispatcher = Dispatcher::new(bus, config).unwrap();
        fill(&mut dispatcher, 0..10);
        dispatcher.request_flush();

        let mut cores = CoreTable::new();
        let report = dispatcher.poll(&mut cores, &never_stale, Instant::now()).unwrap();
        assert_eq!(report.submitted, 2);
        assert_eq!(handle.last_sent().unwrap().len(), REQUEST_FRAME_SIZE * 3);
    }

    #[test]
    fn test_flush_poll_drains_in_flight() {
        let (mut dispatcher, bus, mut cores) = setup(4);
        fill(&mut dispatcher, 0..2);
        bus.push_reply(ReplyBuilder::new(SIZE).accepted(2).build());
        dispatcher.poll(&mut cores, &never_stale, Instant::now()).unwrap();
        assert_eq!(dispatcher.state().in_flight().len(), 2);

        assert!(dispatcher.flush(&always_stale, Instant::now()));
        assert!(dispatcher.state().need_flush());
        assert_eq!(dispatcher.next_poll_delay(), Duration::ZERO);

        let report = dispatcher.poll(&mut cores, &never_stale, Instant::now()).unwrap();
        let sent = bus.last_sent().unwrap();
        assert_eq!(sent[0], 0x30);
        assert!(report.flushed);
        assert_eq!(report.abandoned, 2);
        assert!(dispatcher.state().in_flight().is_empty());
        assert!(!dispatcher.state().need_flush());
        assert_eq!(report.next_poll, Duration::ZERO);
    }

    #[test]
    fn test_flush_keeps_work_accepted_after_flush_command() {
        let (mut dispatcher, bus, mut cores) = setup(4);
        fill(&mut dispatcher, 0..1);
        bus.push_reply(ReplyBuilder::new(SIZE).accepted(1).build());
        dispatcher.poll(&mut cores, &never_stale, Instant::now()).unwrap();

        dispatcher.flush(&always_stale, Instant::now());
        fill(&mut dispatcher, 5..7);
        bus.push_reply(ReplyBuilder::new(SIZE).accepted(2).build());
        let report = dispatcher.poll(&mut cores, &never_stale, Instant::now()).unwrap();

        assert_eq!(report.abandoned, 1);
        let registry = dispatcher.state().in_flight();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup(1).unwrap().midstate, [5; 32]);
        assert_eq!(registry.lookup(2).unwrap().midstate, [6; 32]);
    }

    #[test]
    fn test_flush_without_stale_in_flight_only_discards_pending() {
        let (mut dispatcher, _, _) = setup(4);
        fill(&mut dispatcher, 0..3);

        assert!(!dispatcher.flush(&always_stale, Instant::now()));
        assert!(dispatcher.state().pending().is_empty());
        assert!(!dispatcher.state().need_flush());
        assert!(!dispatcher.is_queue_full());
    }

    #[test]
    fn test_flush_uses_strict_check_on_newest_in_flight() {
        let (mut dispatcher, bus, mut cores) = setup(4);
        fill(&mut dispatcher, 0..2);
        bus.push_reply(ReplyBuilder::new(SIZE).accepted(2).build());
        dispatcher.poll(&mut cores, &never_stale, Instant::now()).unwrap();

        let lenient_only = |_: &WorkItem, _: Instant, strict: bool| !strict;
        assert!(!dispatcher.flush(&lenient_only, Instant::now()));

        let newest_only = |item: &WorkItem, _: Instant, strict: bool| {
            assert!(strict);
            item.midstate[0] == 1
        };
        assert!(dispatcher.flush(&newest_only, Instant::now()));
    }

    #[test]
    fn test_flush_twice_is_idempotent() {
        let (mut dispatcher, bus, mut cores) = setup(4);
        fill(&mut dispatcher, 0..1);
        bus.push_reply(ReplyBuilder::new(SIZE).accepted(1).build());
        dispatcher.poll(&mut cores, &never_stale, Instant::now()).unwrap();
        fill(&mut dispatcher, 1..3);

        dispatcher.flush(&always_stale, Instant::now());
        let after_first = (
            dispatcher.state().pending().len(),
            dispatcher.state().need_flush(),
            dispatcher.state().in_flight().len(),
        );
        dispatcher.flush(&always_stale, Instant::now());
        let after_second = (
            dispatcher.state().pending().len(),
            dispatcher.state().need_flush(),
            dispatcher.state().in_flight().len(),
        );
        assert_eq!(after_first, (0, true, 1));
        assert_eq!(after_first, after_second);
    }

    #[test]
    fn test_nonce_found_keeps_item_in_flight() {
        let (mut dispatcher, bus, mut cores) = setup(4);
        fill(&mut dispatcher, 0..1);
        bus.push_reply(ReplyBuilder::new(SIZE).accepted(1).build());
        dispatcher.poll(&mut cores, &never_stale, Instant::now()).unwrap();

        bus.push_reply(
            ReplyBuilder::new(SIZE)
                .nonce_found(1, 5, 0, 0x11223344)
                .nonce_found(1, 6, 0, 0x55667788)
                .build(),
        );
        let report = dispatcher.poll(&mut cores, &never_stale, Instant::now()).unwrap();
        assert_eq!(report.nonces, 2);
        assert!(dispatcher.state().in_flight().contains(0));

        let stats = cores.stats(CoreId::new(1, 5)).unwrap();
        assert_eq!(stats.nonces, vec![(Some(0), 0x11223344)]);
        let stats = cores.stats(CoreId::new(1, 6)).unwrap();
        assert_eq!(stats.nonces, vec![(Some(0), 0x55667788)]);
    }

    #[test]
    fn test_work_done_releases_item() {
        let (mut dispatcher, bus, mut cores) = setup(4);
        fill(&mut dispatcher, 0..1);
        bus.push_reply(ReplyBuilder::new(SIZE).accepted(1).build());
        dispatcher.poll(&mut cores, &never_stale, Instant::now()).unwrap();

        bus.push_reply(
            ReplyBuilder::new(SIZE)
                .work_done(2, 0, 0)
                .nonce_found(2, 0, 0, 0xabcdef01)
                .build(),
        );
        let report = dispatcher.poll(&mut cores, &never_stale, Instant::now()).unwrap();
        assert_eq!(report.work_done, 1);
        // the late nonce refers to released work
        assert_eq!(report.unmatched, 1);
        assert!(dispatcher.state().in_flight().is_empty());

        let stats = cores.stats(CoreId::new(2, 0)).unwrap();
        assert_eq!(stats.hashes(), HASHES_PER_WORK_UNIT);
        assert!(stats.nonces.is_empty());
        assert_eq!(stats.spurious_nonces, vec![0xabcdef01]);
    }

    #[test]
    fn test_unknown_id_counts_hardware_event() {
        let (mut dispatcher, bus, mut cores) = setup(4);
        fill(&mut dispatcher, 0..1);
        bus.push_reply(ReplyBuilder::new(SIZE).accepted(1).build());
        dispatcher.poll(&mut cores, &never_stale, Instant::now()).unwrap();

        bus.push_reply(
            ReplyBuilder::new(SIZE)
                .nonce_found(0, 3, 0x1234, 42)
                .work_done(0, 3, 0x1235)
                .build(),
        );
        let report = dispatcher.poll(&mut cores, &never_stale, Instant::now()).unwrap();
        assert_eq!(report.unmatched, 2);
        assert_eq!(dispatcher.state().in_flight().len(), 1);

        let stats = cores.stats(CoreId::new(0, 3)).unwrap();
        assert_eq!(stats.hardware_errors, 2);
        assert_eq!(stats.spurious_nonces, vec![42]);
    }

    #[test]
    fn test_unroutable_work_done_releases_item() {
        let (mut dispatcher, bus, mut cores) = setup(4);
        fill(&mut dispatcher, 0..1);
        bus.push_reply(ReplyBuilder::new(SIZE).accepted(1).build());
        dispatcher.poll(&mut cores, &never_stale, Instant::now()).unwrap();

        bus.push_reply(ReplyBuilder::new(SIZE).work_done(5, 9, 0).build());
        let report = dispatcher.poll(&mut cores, &never_stale, Instant::now()).unwrap();
        assert_eq!(report.unroutable, 1);
        assert_eq!(report.work_done, 1);
        assert_eq!(report.unmatched, 0);
        assert!(dispatcher.state().in_flight().is_empty());
        assert_eq!(cores.total_work_units(), 0);

        for _ in 0..3 {
            dispatcher.poll(&mut cores, &never_stale, Instant::now()).unwrap();
        }
        assert!(dispatcher.state().in_flight().is_empty());
    }

    #[test]
    fn test_unroutable_nonce_keeps_item() {
        let (mut dispatcher, bus, mut cores) = setup(4);
        fill(&mut dispatcher, 0..1);
        bus.push_reply(ReplyBuilder::new(SIZE).accepted(1).build());
        dispatcher.poll(&mut cores, &never_stale, Instant::now()).unwrap();

        bus.push_reply(ReplyBuilder::new(SIZE).nonce_found(7, 0, 0, 0x42).build());
        let report = dispatcher.poll(&mut cores, &never_stale, Instant::now()).unwrap();
        assert_eq!(report.unroutable, 1);
        assert_eq!(report.nonces, 0);
        assert!(dispatcher.state().in_flight().contains(0));
    }

    #[test]
    fn test_reserved_records_ignored() {
        let (mut dispatcher, bus, mut cores) = setup(4);
        bus.push_reply(
            ReplyBuilder::new(SIZE)
                .record(ReplyRecord {
                    kind: ReplyKind::Reserved,
                    chip: 0,
                    device_id: 0,
                    nonce: 1,
                    core: 0,
                })
                .build(),
        );
        let report = dispatcher.poll(&mut cores, &never_stale, Instant::now()).unwrap();
        assert_eq!(report.unmatched, 0);
        assert_eq!(report.unroutable, 0);
        assert_eq!(cores.total_hardware_errors(), 0);
    }

    #[test]
    fn test_overflow_flag_not_fatal() {
        let (mut dispatcher, bus, mut cores) = setup(4);
        fill(&mut dispatcher, 0..2);
        bus.push_reply(ReplyBuilder::new(SIZE).overflow().accepted(2).build());
        let report = dispatcher.poll(&mut cores, &never_stale, Instant::now()).unwrap();
        assert!(report.overflow);
        assert_eq!(report.accepted, 2);
        assert_eq!(dispatcher.state().in_flight().len(), 2);
        assert_eq!(report.next_poll, dispatcher.config().poll_interval_duration());
    }

    #[test]
    fn test_transport_error_leaves_state() {
        let (mut dispatcher, bus, mut cores) = setup(4);
        fill(&mut dispatcher, 0..3);
        dispatcher.request_flush();
        bus.push_failure("spi ioctl failed");

        let err = dispatcher.poll(&mut cores, &never_stale, Instant::now()).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(dispatcher.state().pending().len(), 3);
        assert!(dispatcher.state().need_flush());
        assert_eq!(dispatcher.state().next_id(), 0);
        assert_eq!(dispatcher.next_poll_delay(), Duration::from_millis(10));
    }

    #[test]
    fn test_short_reply_rejected() {
        let (mut dispatcher, bus, mut cores) = setup(4);
        fill(&mut dispatcher, 0..2);
        bus.push_reply(ReplyBuilder::new(100).accepted(2).build());

        let err = dispatcher.poll(&mut cores, &never_stale, Instant::now()).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::ShortBuffer {
                expected: SIZE,
                actual: 100
            }
        ));
        assert!(dispatcher.state().in_flight().is_empty());
        assert_eq!(dispatcher.state().pending().len(), 2);
    }

    #[test]
    fn test_poll_prunes_stale_pending() {
        let (mut dispatcher, bus, mut cores) = setup(4);
        fill(&mut dispatcher, 0..3);
        let report = dispatcher.poll(&mut cores, &always_stale, Instant::now()).unwrap();
        assert_eq!(report.pruned, 3);
        assert_eq!(report.submitted, 0);
        assert!(submitted_ids(&bus.last_sent().unwrap()).is_empty());
    }

    #[test]
    fn test_identifier_wraparound_evicts() {
        let (mut dispatcher, bus, mut cores) = setup(1);
        dispatcher.state.next_id = DEVICE_ID_MASK;
        dispatcher.state.in_flight.insert(0, work(0xee)).unwrap();

        fill(&mut dispatcher, 1..2);
        bus.push_reply(ReplyBuilder::new(SIZE).accepted(1).build());
        dispatcher.poll(&mut cores, &never_stale, Instant::now()).unwrap();
        assert_eq!(dispatcher.state().next_id(), 0);

        fill(&mut dispatcher, 2..3);
        bus.push_reply(ReplyBuilder::new(SIZE).accepted(1).build());
        let report = dispatcher.poll(&mut cores, &never_stale, Instant::now()).unwrap();
        assert_eq!(report.evicted, 1);
        assert_eq!(dispatcher.state().next_id(), 1);
        assert_eq!(
            dispatcher.state().in_flight().lookup(0).unwrap().midstate,
            [2; 32]
        );
        assert_eq!(
            dispatcher.state().in_flight().lookup(DEVICE_ID_MASK).unwrap().midstate,
            [1; 32]
        );
    }

    #[test]
    fn test_capacity_never_shrinks_over_polls() {
        let (mut dispatcher, bus, mut cores) = setup(1);
        let mut last = dispatcher.state().capacity();
        for accepted in [2u16, 0, 1, 5, 3, 0] {
            let room = dispatcher.state().capacity() - dispatcher.state().pending().len();
            for _ in 0..room {
                dispatcher.enqueue(work(0), &never_stale, Instant::now());
            }
            bus.push_reply(ReplyBuilder::new(SIZE).accepted(accepted).build());
            dispatcher.poll(&mut cores, &never_stale, Instant::now()).unwrap();
            assert!(dispatcher.state().capacity() >= last);
            last = dispatcher.state().capacity();
        }
        assert_eq!(last, 5);
    }
}
