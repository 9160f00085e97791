pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod events;
pub mod fallback;
pub mod model;
pub mod progress;
pub mod records;
pub mod scheduler;
pub mod sink;
pub mod store;
pub mod transfer;

#[cfg(test)]
pub(crate) mod test_support;
