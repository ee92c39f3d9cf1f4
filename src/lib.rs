pub mod address;
pub mod aggregator;
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod parser;
pub mod period;
pub mod rpc;
pub mod task;
