pub mod events;
pub mod object;
pub mod object_router;
pub mod object_sender;
pub mod replication;
pub mod replicator;
pub mod store;
