use std::fmt;

use crate::{CompletionBridge, Connection, Consumer, QueryError, SlotIndex};

/// Identifies a unit of work for the lifetime of the engine that accepted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(pub(crate) u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Scheduling state of a slot.
///
/// ```text
/// Available -> Attached <-> ReadingRow
///                 |  ^
///                 |  '---- Reseting (transient failure, budget left)
///                 v
///             Releasing -> Available
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Available,
    Attached,
    ReadingRow,
    Reseting,
    Releasing,
}

pub(crate) struct Slot<C: Connection> {
    pub index: SlotIndex,
    pub query: Option<C::Query>,
    pub consumer: Option<Box<dyn Consumer<C>>>,
    pub owner: Option<ConsumerId>,
    pub retry_budget: u32,
    pub state: SlotState,
    pub bridge: CompletionBridge,
    /// Cancellation requested while the consumer was lent out to one of its callbacks.
    pub doomed: Option<QueryError>,
}

impl<C: Connection> Slot<C> {
    pub fn new(index: SlotIndex, bridge: CompletionBridge) -> Self {
        Self {
            index,
            query: None,
            consumer: None,
            owner: None,
            retry_budget: 0,
            state: SlotState::Available,
            bridge,
            doomed: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.state == SlotState::Available
    }

    /// Whether the query and consumer are currently parked in the slot.
    pub fn is_parked(&self) -> bool {
        self.query.is_some() && self.consumer.is_some()
    }

    /// Takes the query and consumer out so a callback can borrow the engine.
    pub fn lend(&mut self) -> Option<(C::Query, Box<dyn Consumer<C>>)> {
        if !self.is_parked() {
            return None;
        }
        self.query.take().zip(self.consumer.take())
    }

    pub fn park(&mut self, query: C::Query, consumer: Box<dyn Consumer<C>>) {
        self.query = Some(query);
        self.consumer = Some(consumer);
        self.state = SlotState::Attached;
    }

    pub fn clear(&mut self) {
        self.query = None;
        self.consumer = None;
        self.owner = None;
        self.retry_budget = 0;
        self.doomed = None;
        self.state = SlotState::Available;
    }
}

/// Admitted work waiting for a free slot.
pub(crate) struct PendingItem<C: Connection> {
    pub id: ConsumerId,
    pub consumer: Box<dyn Consumer<C>>,
    pub retry_budget: u32,
}
