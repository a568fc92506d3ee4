pub mod config;
pub mod credentials;
pub mod state;
pub mod storage;
pub mod sync;
