pub mod conversation;
pub mod gateway;
pub mod ids;
pub mod message;
