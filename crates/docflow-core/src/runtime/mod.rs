pub mod clock;
pub(crate) mod executor;
pub mod manager;
pub(crate) mod pool;
pub mod processor;
pub mod reaper;
pub mod storage;
pub mod types;
