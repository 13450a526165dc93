//! Client-side surface (spec.md §4.8 "Synchronous client", §4.9
//! "Asynchronous client").

pub mod async_client;
pub mod channel;
pub mod sync_client;

pub use async_client::{AsyncServerStreamingClient, AsyncUnaryClient};
pub use channel::Channel;
pub use sync_client::Client;
