//! Recurring billing engine and failed-job retry worker.

pub mod billing;
pub mod config;
pub mod engine;
pub mod grpc;
pub mod models;
pub mod retry;
pub mod scheduler;
pub mod services;
pub mod startup;
