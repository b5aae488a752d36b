pub mod daemon;
pub mod events;
pub mod storage;
pub mod sync;
pub mod token_store;
