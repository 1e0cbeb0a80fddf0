//! # Chanwire
//!
//! The frame vocabulary spoken by two channel connections.
//!
//! A connection exchanges self-delimited frames over a message pipe. The
//! request frames (`Call`, `CallOk`, `CallErr`, `Cancel`) are keyed by a
//! request id, the subscription frames (`Listen`, `Fire`, `Dispose`) by a
//! subscription id, and `Hello` opens the conversation.

mod error;
mod frame;


pub use error::Error;
pub use error::ErrorKind;
pub use error::Result;
pub use frame::Frame;
pub use frame::FrameKind;
pub use frame::decode_header;
