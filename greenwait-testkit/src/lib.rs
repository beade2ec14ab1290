//! Fixtures and test doubles shared by greenwait's integration tests,
//! benches and demos.

pub mod job;
pub mod mock;
pub mod store;

pub use job::*;
pub use mock::*;
pub use store::*;
