//! # HostLink
//!
//! Client side of the host bridge: drive objects living inside a running game
//! server from a separate process, over one loopback connection.
//!
//! ## Architecture
//!
//! - [`transport`] moves length-prefixed frames.
//! - [`registry`] correlates call ids with replies for both async and blocking
//!   callers.
//! - [`batch`] buffers calls under `frame` / `atomic` scopes.
//! - [`release`] batches host handle releases.
//! - [`events`] fans host events out to handlers.
//! - [`bridge`] ties them to a single connection and owns the reader thread.
//!
//! Values, the codec, and the message shapes come from `hostwire`.

pub mod batch;
pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod mock_transport;
pub mod proxy;
pub mod registry;
pub mod release;
pub mod transport;

pub use batch::BatchMode;
pub use batch::BatchScope;
pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use error::Error;
pub use error::RemoteError;
pub use error::Result;
pub use events::Event;
pub use events::EventHandler;
pub use events::Outcome;
pub use events::SubscribeOptions;
pub use proxy::Attribute;
pub use proxy::Facade;
pub use proxy::Invoker;
pub use proxy::Selector;
pub use registry::CallFuture;
