//! Defense profile enforcement for Fastly Compute.

pub mod rules;
