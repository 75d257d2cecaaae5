//! Integration tests for time-warp acceptance testing.
//!
//! - Bounded sessions in thread and single-task process mode
//! - Status line output in the format external harnesses parse
//! - Lock and counter invariants with many concurrent samplers

mod common;
mod contention_test;
mod session_test;
