#![cfg_attr(doc, doc = include_str!("../README.md"))]

mod buffer;
pub mod config;
pub mod error;
pub mod event;
mod socket;
pub mod transport;
pub mod types;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

pub use config::{Config, DelayPolicy, ProtocolsProvider, UrlProvider};
pub use event::{Callback, Event, EventKind, ListenerOptions};
pub use socket::ReconnectingWebSocket;
pub use types::{BinaryType, Message, ReadyState, TerminationCause};
