pub mod automation;
pub mod config;
pub mod consts;
pub mod entities;
pub mod error;
pub mod homeassistant;
pub mod props;
pub mod provision;
pub mod service;
pub mod sidekick;
pub mod state;
pub mod utils;
pub mod webhook;

pub use error::{Error, Result};
pub use props::EntityProps;
pub use sidekick::Sidekick;
