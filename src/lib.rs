pub mod api;
pub mod config;
pub mod error;
pub mod reconcile;
pub mod scheduler;
pub mod shutdown;
pub mod sync;
