//! HTTP Handlers

mod callback;
mod connection;
mod events;
mod ping;
mod reconstruction;
mod websocket;

pub use callback::*;
pub use connection::*;
pub use events::*;
pub use ping::*;
pub use reconstruction::*;
pub use websocket::*;
