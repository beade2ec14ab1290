/// PostgreSQL implementation of [`crate::store::JobStore`].
pub mod postgres;

pub use postgres::PostgresJobStore;
