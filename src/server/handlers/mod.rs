//! Route handler modules for the relay REST API.

pub mod conversations;
pub mod health;
pub mod messages;
pub mod push;
pub mod uploads;
pub mod websocket;
