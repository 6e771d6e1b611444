pub mod consumer;
pub mod message;
