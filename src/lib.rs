pub mod blob;
pub mod browser;
pub mod capture;
pub mod config;
pub mod logging;
pub mod recorder;
pub mod resource_store;
pub mod rewrite;
pub mod router;
pub mod server;
pub mod session;
pub mod storage;
