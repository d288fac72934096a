//! Query admission and scheduling.
//!
//! The [`QueryEngine`] runs many queries against a [`Connection`] at once while keeping the
//! number of in-flight queries bounded by [`EngineConfig::max_queries`].
//!
//! # Overview
//!
//! Work is submitted as boxed [`Consumer`]s through [`QueryEngine::execute`]. Each consumer is
//! attached to a slot, which owns one query handle at a time. When every slot is busy, work
//! either waits in a FIFO pending queue or the caller blocks, depending on the requested
//! [`Admission`].
//!
//! Query handles run their I/O elsewhere and report readiness through the slot's
//! [`CompletionBridge`]. The owning thread picks those reports up in
//! [`QueryEngine::yield_now`], which drives each ready slot through its state machine and
//! backfills freed slots from the pending queue.
//!
//! # Threading
//!
//! The engine binds to the first thread that mutates it. Any later call from another thread
//! fails with [`EngineError::WrongThread`]. The bridges are the only part that is shared.
//!
//! # Failures
//!
//! - Transient errors ([`QueryError::is_retryable`]) restart the query after
//!   [`EngineConfig::retry_delay`] as long as the unit of work has retry budget left.
//! - Exhausted budgets and fatal errors are reported once through [`Consumer::failed`] and set
//!   the sticky [`QueryEngine::has_error`] flag. Fatal errors also propagate out of
//!   `yield_now`.
//!
//! # Example
//! ```rust,ignore
//! let mut engine = QueryEngine::new(connection, EngineConfig::default().with_max_queries(8))?;
//! for key in keys {
//!     engine.execute(Box::new(Lookup::new(key)), 3, Admission::NonBlocking)?;
//! }
//! engine.finalize(&Interrupt::ctrlc()?)?;
//! ```
mod bridge;
mod slot;

#[cfg(test)]
pub(crate) mod mock;

use std::{cell::OnceCell, collections::VecDeque, fmt, mem, sync::Arc, thread, thread::ThreadId};

use log::{debug, error, info, trace, warn};

use crate::{
    Connection, Consumer, EngineConfig, EngineError, Interrupt, QueryError, QueryHandle, RowStatus,
    SlotIndex,
};

use bridge::ReadyQueue;
use slot::{PendingItem, Slot};

pub use bridge::CompletionBridge;
pub use slot::{ConsumerId, SlotState};

/// What `execute` does when every slot is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Run the scheduler until a slot frees up. There is no timeout: the caller must make
    /// sure attached work can complete. From inside a consumer callback this falls back to
    /// queueing, since the scheduler cannot run there.
    Blocking,
    /// Queue the work and return immediately.
    NonBlocking,
}

/// Snapshot handed to the tick callback on every admission or slot transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineTick {
    pub active: usize,
    pub busy: usize,
    pub pending: usize,
    pub slots: usize,
}

type TickCallback = Box<dyn FnMut(EngineTick) + Send>;

/// How a scheduler step left the slot.
enum Step {
    /// Still attached; wait for the next signal.
    Idle,
    /// The consumer stopped pulling rows; resume on the next scheduler pass.
    Paused,
    /// `finish` asked for the slot to be released.
    Release,
    Fail { error: QueryError, fatal: bool },
}

pub struct QueryEngine<C: Connection> {
    connection: C,
    config: EngineConfig,
    slots: Vec<Slot<C>>,
    pending: VecDeque<PendingItem<C>>,
    ready: Arc<ReadyQueue>,
    owner: OnceCell<ThreadId>,
    active: usize,
    yielding: bool,
    error: bool,
    next_id: u64,
    on_tick: Option<TickCallback>,
}

impl<C: Connection> QueryEngine<C> {
    pub fn new(connection: C, config: EngineConfig) -> Result<Self, EngineError> {
        if config.max_queries == 0 {
            return Err(EngineError::Configuration(
                "max_queries must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            connection,
            ready: Arc::new(ReadyQueue::new(config.max_queries)),
            config,
            slots: Vec::new(),
            pending: VecDeque::new(),
            owner: OnceCell::new(),
            active: 0,
            yielding: false,
            error: false,
            next_id: 0,
            on_tick: None,
        })
    }

    /// Changes the slot limit. Only allowed before the first slot has been created.
    pub fn set_max_queries(&mut self, max_queries: usize) -> Result<(), EngineError> {
        self.check_access()?;
        if max_queries == 0 {
            return Err(EngineError::Configuration(
                "max_queries must be at least 1".to_string(),
            ));
        }
        if !self.slots.is_empty() {
            return Err(EngineError::Configuration(format!(
                "cannot resize to {max_queries} slots once {} are in use",
                self.slots.len()
            )));
        }

        self.config.max_queries = max_queries;
        self.ready = Arc::new(ReadyQueue::new(max_queries));
        Ok(())
    }

    /// Keyspace for queries opened from now on.
    pub fn set_keyspace(&mut self, keyspace: impl Into<String>) -> Result<(), EngineError> {
        self.check_access()?;
        self.config.keyspace = Some(keyspace.into());
        Ok(())
    }

    pub fn set_tick_callback<F>(&mut self, callback: F)
    where
        F: FnMut(EngineTick) + Send + 'static,
    {
        self.on_tick = Some(Box::new(callback));
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Admits a unit of work.
    ///
    /// `retry_budget` is the number of times a transient failure is retried before it is
    /// reported through [`Consumer::failed`]; it must be positive.
    ///
    /// With [`Admission::Blocking`] this may run the scheduler. If that pass hits a fatal
    /// error, the error is returned and the submitted work stays queued.
    pub fn execute(
        &mut self,
        consumer: Box<dyn Consumer<C>>,
        retry_budget: u32,
        admission: Admission,
    ) -> Result<ConsumerId, EngineError> {
        self.check_access()?;
        if retry_budget == 0 {
            return Err(EngineError::InvalidRetryBudget);
        }

        let id = ConsumerId(self.next_id);
        self.next_id += 1;
        let item = PendingItem {
            id,
            consumer,
            retry_budget,
        };

        if let Some(index) = self.free_slot() {
            self.attach(index, item);
            return Ok(id);
        }

        if admission == Admission::NonBlocking || self.in_callback() {
            if admission == Admission::Blocking {
                warn!("blocking admission of {id} from a callback, queueing instead");
            }
            debug!("all {} slots busy, queueing {id}", self.slots.len());
            self.pending.push_back(item);
            self.tick();
            return Ok(id);
        }

        loop {
            if let Err(err) = self.yield_now(true) {
                self.pending.push_back(item);
                self.tick();
                return Err(err);
            }
            if let Some(index) = self.free_slot() {
                self.attach(index, item);
                return Ok(id);
            }
        }
    }

    /// Whether `execute` would attach immediately.
    pub fn has_empty_slot(&self) -> bool {
        self.slots.len() < self.config.max_queries || self.slots.iter().any(Slot::is_available)
    }

    /// Runs one scheduler pass.
    ///
    /// With `wait`, blocks for up to [`EngineConfig::poll_timeout`] for a slot to become ready
    /// when queries are in flight. Calls nested inside a consumer callback return immediately.
    pub fn yield_now(&mut self, wait: bool) -> Result<(), EngineError> {
        self.check_access()?;
        if self.yielding {
            trace!("nested yield ignored");
            return Ok(());
        }

        self.yielding = true;
        let result = self.schedule(wait);
        self.yielding = false;
        result
    }

    /// Takes the query handle out of `slot` so the caller can keep driving it.
    ///
    /// The consumer is not failed. The slot gets a freshly opened handle and the consumer's
    /// `finish` decides whether the slot is released or kept for follow-up work. The returned
    /// handle no longer signals the engine; register a new completion callback to observe it.
    pub fn extract(&mut self, index: SlotIndex) -> Result<C::Query, EngineError> {
        self.check_access()?;
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(EngineError::InvalidSlot(index))?;
        if slot.is_available() {
            return Err(EngineError::InvalidSlot(index));
        }
        let (mut query, mut consumer) = slot.lend().ok_or(EngineError::SlotBusy(index))?;
        debug!("extracting {} from slot {index}", query.describe());
        query.set_completion_callback(CompletionBridge::detached(index));

        let mut replacement = match self.open_query(index) {
            Ok(replacement) => replacement,
            Err(err) => {
                self.fail_lent(index, &mut query, consumer, &err);
                self.detach(index, query);
                self.backfill(index);
                return Err(err.into());
            }
        };
        self.slots[index].state = SlotState::Releasing;
        let release = consumer.finish(&mut replacement, self, index);
        let step = if release { Step::Release } else { Step::Idle };
        // Only fatal failures propagate and this step never carries one.
        self.settle(index, replacement, consumer, step)?;
        Ok(query)
    }

    /// Fails the work identified by `id`, wherever it is.
    ///
    /// Returns `false` if the engine no longer holds that work. When the consumer is in the
    /// middle of one of its own callbacks, the failure is delivered once the callback returns.
    pub fn cancel(&mut self, id: ConsumerId, error: QueryError) -> Result<bool, EngineError> {
        self.check_access()?;

        if let Some(position) = self.pending.iter().position(|item| item.id == id) {
            if let Some(mut item) = self.pending.remove(position) {
                info!("cancelling pending {id}: {error}");
                self.error = true;
                item.consumer.failed(None, self, None, &error);
                self.tick();
            }
            return Ok(true);
        }

        let Some(index) = self.slots.iter().position(|slot| slot.owner == Some(id)) else {
            return Ok(false);
        };

        info!("cancelling {id} on slot {index}: {error}");
        self.error = true;
        match self.slots[index].lend() {
            Some((mut query, consumer)) => {
                self.fail_lent(index, &mut query, consumer, &error);
                self.detach(index, query);
                self.backfill(index);
            }
            None => self.slots[index].doomed = Some(error),
        }
        Ok(true)
    }

    /// Fails every attached and pending unit of work.
    pub fn cancel_all(&mut self, error: QueryError) -> Result<(), EngineError> {
        self.check_access()?;
        self.abort_all(&error);
        Ok(())
    }

    /// Drains the engine, returning once no work is attached or pending.
    ///
    /// Fails with [`EngineError::Interrupted`] as soon as `interrupt` is observed; the
    /// remaining work is left in place.
    pub fn finalize(&mut self, interrupt: &Interrupt) -> Result<(), EngineError> {
        self.check_access()?;
        if self.in_callback() {
            return Err(EngineError::NestedCall("finalize"));
        }
        info!(
            "draining {} active and {} pending queries",
            self.active,
            self.pending.len()
        );

        loop {
            self.fill_free_slots();
            if self.busy_slots() == 0 && self.pending.is_empty() {
                debug!("drain complete");
                return Ok(());
            }
            if interrupt.is_raised() {
                warn!("drain interrupted");
                return Err(EngineError::Interrupted {
                    active: self.active,
                    pending: self.pending.len(),
                });
            }
            self.yield_now(true)?;
        }
    }

    /// Number of slots whose consumer has started.
    pub fn active_queries(&self) -> usize {
        self.active
    }

    pub fn busy_slots(&self) -> usize {
        self.slots.iter().filter(|slot| !slot.is_available()).count()
    }

    pub fn pending_slots(&self) -> usize {
        self.pending.len()
    }

    /// Number of slots created so far.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_state(&self, index: SlotIndex) -> Option<SlotState> {
        self.slots.get(index).map(|slot| slot.state)
    }

    /// Whether any work has failed or been cancelled since the engine was created.
    pub fn has_error(&self) -> bool {
        self.error
    }

    fn check_access(&self) -> Result<(), EngineError> {
        let caller = thread::current().id();
        let owner = *self.owner.get_or_init(|| caller);
        if owner == caller {
            Ok(())
        } else {
            Err(EngineError::WrongThread { owner, caller })
        }
    }

    /// Whether a consumer callback is running further up the stack.
    fn in_callback(&self) -> bool {
        self.yielding
            || self
                .slots
                .iter()
                .any(|slot| !slot.is_available() && !slot.is_parked())
    }

    fn tick(&mut self) {
        let snapshot = EngineTick {
            active: self.active,
            busy: self.busy_slots(),
            pending: self.pending.len(),
            slots: self.slots.len(),
        };
        if let Some(callback) = self.on_tick.as_mut() {
            callback(snapshot);
        }
    }

    /// Finds a slot for new work, growing the table while below the limit.
    fn free_slot(&mut self) -> Option<SlotIndex> {
        if self.slots.len() < self.config.max_queries {
            let index = self.slots.len();
            let bridge = CompletionBridge::new(index, &self.ready, self.config.push_timeout);
            self.slots.push(Slot::new(index, bridge));
            debug!("created slot {index}");
            return Some(index);
        }
        self.slots.iter().position(Slot::is_available)
    }

    fn open_query(&mut self, index: SlotIndex) -> Result<C::Query, QueryError> {
        let mut query = self
            .connection
            .new_query(self.config.keyspace.as_deref())?;
        query.set_completion_callback(self.slots[index].bridge.clone());
        Ok(query)
    }

    /// Attaches `item` to the free slot `index`. When the consumer declines, the slot is
    /// offered to pending work until someone accepts it or the queue runs dry.
    fn attach(&mut self, index: SlotIndex, item: PendingItem<C>) {
        let mut next = Some(item);
        while let Some(item) = next.take() {
            if self.attach_one(index, item) {
                return;
            }
            next = self.pending.pop_front();
        }
    }

    /// Returns whether the slot ended up attached.
    fn attach_one(&mut self, index: SlotIndex, item: PendingItem<C>) -> bool {
        let PendingItem {
            id,
            mut consumer,
            retry_budget,
        } = item;

        let mut query = match self.open_query(index) {
            Ok(query) => query,
            Err(err) => {
                warn!("failed to open query for {id}: {err}");
                self.error = true;
                consumer.failed(None, self, Some(index), &err);
                self.tick();
                return false;
            }
        };

        let slot = &mut self.slots[index];
        slot.state = SlotState::Attached;
        slot.owner = Some(id);
        slot.retry_budget = retry_budget;
        trace!("attaching {id} to slot {index}");

        let started = consumer.start(&mut query, self, index);

        if let Some(err) = self.slots[index].doomed.take() {
            consumer.failed(Some(&mut query), self, Some(index), &err);
            query.close();
            self.slots[index].clear();
            self.tick();
            return false;
        }
        if !started {
            debug!("{id} declined slot {index}");
            query.close();
            self.slots[index].clear();
            self.tick();
            return false;
        }

        self.slots[index].park(query, consumer);
        self.active += 1;
        self.tick();
        true
    }

    /// Drops the slot's work and returns it to `Available`.
    fn detach(&mut self, index: SlotIndex, mut query: C::Query) {
        query.close();
        self.slots[index].clear();
        self.active = self.active.saturating_sub(1);
        trace!("slot {index} released");
        self.tick();
    }

    fn backfill(&mut self, index: SlotIndex) {
        if !self.slots[index].is_available() {
            return;
        }
        if let Some(item) = self.pending.pop_front() {
            trace!("backfilling slot {index} with {}", item.id);
            self.attach(index, item);
        }
    }

    fn fill_free_slots(&mut self) {
        while !self.pending.is_empty() {
            let Some(index) = self.free_slot() else {
                return;
            };
            self.backfill(index);
        }
    }

    fn fail_lent(
        &mut self,
        index: SlotIndex,
        query: &mut C::Query,
        mut consumer: Box<dyn Consumer<C>>,
        error: &QueryError,
    ) {
        self.error = true;
        consumer.failed(Some(query), self, Some(index), error);
    }

    fn schedule(&mut self, wait: bool) -> Result<(), EngineError> {
        let timeout = (wait && self.busy_slots() > 0).then_some(self.config.poll_timeout);

        if let Some(index) = self.ready.pop(timeout) {
            self.advance(index)?;
            for _ in 0..self.ready.len() {
                let Some(index) = self.ready.pop(None) else {
                    break;
                };
                self.advance(index)?;
            }
        }

        self.fill_free_slots();
        Ok(())
    }

    /// Moves a signalled slot forward by one step.
    fn advance(&mut self, index: SlotIndex) -> Result<(), EngineError> {
        let Some(slot) = self.slots.get_mut(index) else {
            warn!("signal for unknown slot {index}");
            return Ok(());
        };
        slot.bridge.rearm();

        match slot.state {
            SlotState::Available => {
                trace!("stale signal for slot {index}");
                return Ok(());
            }
            SlotState::ReadingRow => return Err(EngineError::ReentrantRead(index)),
            _ => {}
        }

        let Some((mut query, mut consumer)) = slot.lend() else {
            return Ok(());
        };
        let step = self.drive(index, &mut query, consumer.as_mut());
        self.settle(index, query, consumer, step)
    }

    fn drive(
        &mut self,
        index: SlotIndex,
        query: &mut C::Query,
        consumer: &mut dyn Consumer<C>,
    ) -> Step {
        loop {
            let error = match query.next_row() {
                Ok(RowStatus::Wait) => return Step::Idle,
                Ok(RowStatus::DataReady) => {
                    self.slots[index].state = SlotState::ReadingRow;
                    let more = consumer.process_row(query, self, index);
                    self.slots[index].state = SlotState::Attached;
                    if self.slots[index].doomed.is_some() {
                        return Step::Idle;
                    }
                    if !more {
                        return Step::Paused;
                    }
                    continue;
                }
                Ok(RowStatus::Done) => {
                    self.slots[index].state = SlotState::Releasing;
                    if consumer.finish(query, self, index) {
                        return Step::Release;
                    }
                    return Step::Idle;
                }
                Err(err) => err,
            };

            return self.retry(index, query, consumer, error);
        }
    }

    fn retry(
        &mut self,
        index: SlotIndex,
        query: &mut C::Query,
        consumer: &mut dyn Consumer<C>,
        mut error: QueryError,
    ) -> Step {
        loop {
            if !error.is_retryable() {
                return Step::Fail { error, fatal: true };
            }

            let slot = &mut self.slots[index];
            if slot.retry_budget == 0 {
                return Step::Fail {
                    error,
                    fatal: false,
                };
            }
            slot.retry_budget -= 1;
            warn!(
                "slot {index}: {error}, retrying ({} retries left)",
                slot.retry_budget
            );

            slot.state = SlotState::Reseting;
            consumer.reset(query, self, index);
            if self.slots[index].doomed.is_some() {
                return Step::Idle;
            }
            thread::sleep(self.config.retry_delay);

            match query.restart() {
                Ok(()) => return Step::Idle,
                Err(err) => error = err,
            }
        }
    }

    /// Puts lent work back into its slot according to `step`.
    fn settle(
        &mut self,
        index: SlotIndex,
        mut query: C::Query,
        consumer: Box<dyn Consumer<C>>,
        step: Step,
    ) -> Result<(), EngineError> {
        if let Some(err) = self.slots[index].doomed.take() {
            self.fail_lent(index, &mut query, consumer, &err);
            self.detach(index, query);
            self.backfill(index);
            return Ok(());
        }

        match step {
            Step::Idle => {
                self.slots[index].park(query, consumer);
                Ok(())
            }
            Step::Paused => {
                // Buffered rows raise no further signal, so queue the slot ourselves.
                self.slots[index].park(query, consumer);
                self.slots[index].bridge.notify();
                Ok(())
            }
            Step::Release => {
                drop(consumer);
                self.detach(index, query);
                self.backfill(index);
                Ok(())
            }
            Step::Fail { error, fatal } => {
                if fatal {
                    error!("slot {index}: {error}");
                } else {
                    warn!("slot {index}: retries exhausted: {error}");
                }
                self.fail_lent(index, &mut query, consumer, &error);
                self.detach(index, query);
                self.backfill(index);
                if fatal { Err(error.into()) } else { Ok(()) }
            }
        }
    }

    fn abort_all(&mut self, error: &QueryError) {
        self.error = true;

        for index in 0..self.slots.len() {
            if self.slots[index].is_available() {
                continue;
            }
            match self.slots[index].lend() {
                Some((mut query, consumer)) => {
                    self.fail_lent(index, &mut query, consumer, error);
                    self.detach(index, query);
                }
                None => self.slots[index].doomed = Some(error.clone()),
            }
        }

        for mut item in mem::take(&mut self.pending) {
            item.consumer.failed(None, self, None, error);
        }
        self.tick();
    }
}

impl<C: Connection> fmt::Display for QueryEngine<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "slots: {}/{}, active: {}, pending: {}, error: {}",
            self.slots.len(),
            self.config.max_queries,
            self.active,
            self.pending.len(),
            self.error
        )?;
        for slot in &self.slots {
            let query = slot
                .query
                .as_ref()
                .map(|query| {
                    let status = if query.is_active() { "running" } else { "idle" };
                    format!("{} ({status})", query.describe())
                })
                .unwrap_or_else(|| String::from("-"));
            let owner = slot
                .owner
                .map(|id| id.to_string())
                .unwrap_or_else(|| String::from("-"));
            writeln!(f, "  [{}] {:?} {owner} {query}", slot.index, slot.state)?;
        }
        Ok(())
    }
}

impl<C: Connection> Drop for QueryEngine<C> {
    fn drop(&mut self) {
        let busy = self.busy_slots();
        let pending = self.pending.len();
        if busy == 0 && pending == 0 {
            return;
        }

        error!("engine dropped with {busy} busy slots and {pending} pending queries");
        self.abort_all(&QueryError::Cancelled("engine dropped".to_string()));
    }
}
