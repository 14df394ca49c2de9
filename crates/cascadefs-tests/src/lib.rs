//! Cross-crate scenario tests for the CascadeFS publisher.
//!
//! The per-crate unit tests cover each engine in isolation; this crate
//! drives whole publish cycles: files through the processor, chunk
//! descriptors into the catalog manager, commits into manifests, and
//! revisions into the history log, all against one shared in-memory
//! store.

pub mod harness;

#[cfg(test)]
mod publish_cycle;
#[cfg(test)]
mod session_gate;
