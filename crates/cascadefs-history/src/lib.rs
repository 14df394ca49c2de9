#![warn(missing_docs)]

//! The tagged revision log of a CascadeFS repository.
//!
//! Every published revision can carry named tags, each bound to an update
//! channel. The log answers by-name and by-date lookups, reports the tip
//! of every channel, and supports rolling a channel back to an earlier
//! tag, which deletes everything the channel published since.

pub mod error;
pub mod store;

pub use error::HistoryError;
pub use store::{History, Tag, UpdateChannel};
