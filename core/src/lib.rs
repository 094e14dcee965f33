pub mod calculator;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod jobs;
pub mod ledger;
pub mod lifecycle;
pub mod orchestrator;
pub mod ports;
pub mod scheduler;
pub mod store;
pub mod types;
