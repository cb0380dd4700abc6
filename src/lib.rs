pub mod config;
pub mod driver;
pub mod error;
pub mod node;
pub mod sandbox;
pub mod scheduler;
pub mod service;
pub mod shutdown;
pub mod store;
pub mod web;
