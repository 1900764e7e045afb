pub mod cli;
pub mod daemon;
pub mod errors;
pub mod fetch;
pub mod models;
pub mod server;
pub mod storage;
