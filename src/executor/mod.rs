//! Task execution: handler contract plus the claiming worker pool.

pub mod handler;
pub mod pool;

pub use handler::{HandlerOutcome, HandlerRegistry, StageContext, StageHandler};
pub use pool::PipelineExecutor;
