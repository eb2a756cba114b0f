// Configuration for qpx
// (c) 2024 Ross Younger

//! Configuration processing
//!
//! Options may come from (in ascending priority): hard-wired defaults, a
//! user configuration file, a file named with `--config`, and command-line
//! overrides. [`Manager`] does the merging; [`Configuration`] is the result,
//! with [`Configuration::check`] enforcing the cross-field rules.

mod manager;
mod structure;

pub use manager::Manager;
pub use structure::Configuration;
