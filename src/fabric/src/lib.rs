//! Message plumbing between compute and memory nodes.
//!
//! The real deployment runs these messages over an RDMA transport; that
//! transport's framing and reliability are not modeled here. What this crate
//! pins down is the contract the memory managers program against: fixed-size
//! request/reply structs, a single `reply()` primitive per request, and a
//! bounded-timeout send-and-wait call. An in-memory fabric implements the
//! same contract for tests and single-host runs.

mod node;
mod wire;

pub use node::*;
pub use wire::*;
