pub mod config;
pub mod connection;
pub mod cron;
pub mod crypto;
pub mod error;
pub mod executor;
pub mod fk;
pub mod mapper;
pub mod models;
pub mod repository;
pub mod retry;
pub mod scheduler;
