//! # HostWire
//!
//! The wire half of the host bridge: the dynamic [`Value`] model, the JSON
//! codec for tagged objects, protocol [`Message`]s, and length-prefixed framing.
//!
//! ## Architecture
//!
//! Nothing in this crate touches a socket or a runtime. Framing works over any
//! `Read`/`Write`, messages are plain serde types, and the codec maps JSON to
//! values through a shared [`TypeRegistry`]. Connection state, correlation, and
//! event dispatch live one layer up.

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod registry;
pub mod value;

pub use codec::Codec;
pub use error::Error;
pub use error::Result;
pub use message::CallMessage;
pub use message::Message;
pub use message::Priority;
pub use message::ResultKind;
pub use registry::PlayerDirectory;
pub use registry::TypeRegistry;
pub use value::EnumKind;
pub use value::EnumValue;
pub use value::Fields;
pub use value::HandleLease;
pub use value::Identity;
pub use value::LeaseTable;
pub use value::Position;
pub use value::Proxy;
pub use value::ProxyClass;
pub use value::Reference;
pub use value::ReleaseSink;
pub use value::Value;
