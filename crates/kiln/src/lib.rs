//! # kiln
//!
//! Operator CLI for the Kiln container build driver.
//!
//! Each subcommand maps onto one [`Driver`](kiln_driver::Driver)
//! operation run against a docker-compatible runtime, which makes the CLI
//! a convenient way to check a runtime setup before a pipeline uses it.

#![warn(missing_docs)]

pub mod cli;
