pub mod basic_messages;
pub mod group_router;
pub mod message_router;
pub mod message_sender;
pub mod message_types;
pub mod queue;
