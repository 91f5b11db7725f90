pub mod classify;
pub mod config;
pub mod engine;
pub mod models;
pub mod policy;
pub mod registry;
pub mod timekeeper;
pub mod trust;
pub mod utils;
