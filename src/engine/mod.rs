pub mod adapters;
pub mod coordinator;
pub mod events;
