#![deny(unsafe_code)]

//! Fixtures for daemon tests: configuration builders, a worker launcher that
//! never forks, and a daemon bound inside a temporary directory.

pub mod config;
pub mod daemon;
pub mod launcher;
pub mod tracing_setup;
