//! Integration test entry point for fieldlink-node.
//!
//! Run with: cargo test --test integration

mod harness;
mod api;
mod mesh;
mod sync;
