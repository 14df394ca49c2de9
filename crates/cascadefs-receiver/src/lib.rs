#![warn(missing_docs)]

//! The CascadeFS publisher session gate.
//!
//! Publishers obtain a time-bounded lease on a repository subpath, proven
//! by an authenticated session token. The [`reactor`] runs a
//! length-prefixed request/reply loop over a pair of byte streams and
//! issues, identifies, and validates tokens built by the [`token`] module.

pub mod error;
pub mod reactor;
pub mod token;

pub use error::ReceiverError;
pub use reactor::{read_reply, write_request, Command, Reactor};
pub use token::{check_token, generate_session_token, get_token_public_id, SessionToken, TokenError};
