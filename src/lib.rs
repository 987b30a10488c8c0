pub mod app;
pub mod archive;
pub mod budget;
pub mod config;
pub mod domain;
pub mod error;
pub mod fdsn;
pub mod inventory;
pub mod ledger;
pub mod mseed;
pub mod output;
pub mod planner;
pub mod preprocess;
pub mod scheduler;
pub mod store;
pub mod trace;
