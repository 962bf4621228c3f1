//! Subscriber-facing core: registry, lifecycle, validation and dispatch.

pub mod connection;
pub mod dispatcher;
pub mod events;
pub mod lifecycle;
pub mod registry;
pub mod server;
pub mod validator;
