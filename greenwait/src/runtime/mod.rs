/// Builder for constructing scheduler loops.
pub mod builder;
/// The tick loop that evaluates and dispatches pending jobs.
pub mod supervisor;
/// Execution of claimed jobs.
pub mod worker;

pub use builder::SchedulerLoopBuilder;
pub use supervisor::{SchedulerLoop, ShutdownToken, TickReport};
pub use worker::ExecutionWorker;
