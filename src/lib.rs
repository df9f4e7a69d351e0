pub mod bootstrap;
pub mod chain;
pub mod config;
pub mod error;
pub mod mirror;
pub mod pool;
pub mod settlement;
