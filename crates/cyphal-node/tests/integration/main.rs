//! Integration test entry point for cyphal-node.
//!
//! Run with: cargo test -p cyphal-node --test integration

mod harness;
mod allocation;
mod heartbeat;
mod queue;
