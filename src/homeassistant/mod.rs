mod connection;
pub mod discovery;
mod message;
mod rest;

pub use connection::{Connection, MessageSender};
pub use message::{includes_entity_id, HassEvent, Incoming, Outgoing, RegistryEntry};
pub use rest::RestApi;
