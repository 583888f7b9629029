pub mod audit;
pub mod client;
pub mod common;
pub mod config;
pub mod consensus;
pub mod ledger;
pub mod logging;
pub mod network;
