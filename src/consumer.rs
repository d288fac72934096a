//! Units of work driven by the engine.
//!
//! Every submission to [`QueryEngine::execute`](crate::QueryEngine::execute) is a boxed
//! [`Consumer`]. The engine owns it until the work is released (`finish` returns `true`),
//! failed, or cancelled, and lends it the query handle of the slot it occupies for every
//! callback. Lookups, scans and chained follow-up queries are all just implementations of
//! this one trait.
use crate::{Connection, QueryEngine, QueryError};

/// Position of a slot in the engine's slot table.
pub type SlotIndex = usize;

pub trait Consumer<C: Connection>: Send {
    /// Called once the slot's query handle is open and registered with its bridge.
    ///
    /// Returning `false` declines the slot; the engine releases it without treating it as an
    /// error.
    fn start(&mut self, query: &mut C::Query, engine: &mut QueryEngine<C>, slot: SlotIndex)
    -> bool;

    /// Called once per available row. Returning `false` stops pulling rows for now; the
    /// engine resumes on its next scheduler pass.
    fn process_row(
        &mut self,
        query: &mut C::Query,
        engine: &mut QueryEngine<C>,
        slot: SlotIndex,
    ) -> bool;

    /// Called before a transient failure restarts the query, so partial state can be dropped.
    fn reset(&mut self, _query: &mut C::Query, _engine: &mut QueryEngine<C>, _slot: SlotIndex) {}

    /// Called when the query completes. Returning `false` keeps the slot attached, e.g. after
    /// issuing a follow-up statement on the same handle.
    fn finish(&mut self, query: &mut C::Query, engine: &mut QueryEngine<C>, slot: SlotIndex)
    -> bool;

    /// Called exactly once when the work fails for good.
    ///
    /// Pending work that never reached a slot receives neither a query nor a slot.
    fn failed(
        &mut self,
        query: Option<&mut C::Query>,
        engine: &mut QueryEngine<C>,
        slot: Option<SlotIndex>,
        error: &QueryError,
    );
}
