#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod error;
pub(crate) mod serde_helpers;
pub mod types;
pub mod ws;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

pub use types::{ClientId, ClientMessage, ServerMessage};
pub use ws::config::Config;
pub use ws::{ConnectionManager, ConnectionState, SendOptions};
