pub mod cli;
pub mod config;
pub mod consumer;
pub mod engine;
pub mod error;
pub mod interrupt;
pub mod protocol;
pub mod query;
pub mod statement;

pub use cli::{Command, PromptError, prompt};
pub use config::EngineConfig;
pub use consumer::{Consumer, SlotIndex};
pub use engine::{Admission, CompletionBridge, ConsumerId, EngineTick, QueryEngine, SlotState};
pub use error::{EngineError, QueryError};
pub use interrupt::Interrupt;
pub use query::{Connection, QueryHandle, RowStatus};
pub use statement::{Statement, StatementError};
