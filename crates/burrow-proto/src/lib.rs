//! Wire vocabulary shared by the burrow server and client.
//!
//! The control channel speaks sequences of three big-endian primitives
//! (u32, bool, length-prefixed bytes) introduced by a u32 action code.
//! This crate owns those primitives, the action codes, and the
//! generation of the opaque credentials (tokens and session ids) that
//! travel over them.

pub mod action;
pub mod codec;
pub mod credentials;

pub use action::{Action, InvalidAction};
pub use codec::WireError;
