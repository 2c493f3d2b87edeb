//! # DPE Core
//!
//! Defense profile graph model, validator and execution engine.
//!
//! A defense profile is a directed acyclic graph of nodes authored in the
//! visual editor and evaluated once per inbound form submission:
//! - **Start** enters the graph
//! - **Defense** nodes delegate to a pluggable capability (honeypot, IP lists, keyword filters, ...)
//! - **Operator** nodes combine scores (`sum`, `max`, `min`), block signals (`and`, `or`) or branch on score (`threshold_branch`)
//! - **Action** nodes decide the response (allow, block, captcha, tarpit, flag, monitor)
//! - **Observation** nodes record without influencing the decision
//!
//! ## Example
//!
//! ```text
//! [Start] ──► [Honeypot] ──blocked──► [Block 403]
//!                 └─continue─► [Keyword filter] ──► [Sum] ──► [Threshold] ──high──► [Captcha]
//!                                                                  └─low──► [Allow]
//! ```
//!
//! ## Modules
//!
//! - `graph` - Profile definitions and the compiled, validated graph
//! - `nodes` - Node kinds and their typed settings
//! - `ports` - Output handle names
//! - `threshold` - Threshold range sets
//! - `registry` - Defense capability contract and registry
//! - `evaluator` - Per-node semantics
//! - `interpreter` - Single profile walk
//! - `orchestrator` - Multi-profile aggregation
//! - `defense_line` - Attack signature merging
//! - `snapshot` - Immutable configuration snapshots
//! - `simulate` - Dry-run façade
//! - `wasm` - WebAssembly bindings for JavaScript

mod capabilities;
mod config;
mod defense_line;
mod error;
mod evaluator;
mod graph;
mod interpreter;
mod nodes;
mod orchestrator;
mod ports;
mod registry;
mod result;
mod simulate;
mod snapshot;
mod threshold;
mod value;
pub mod wasm;

pub use capabilities::*;
pub use config::*;
pub use defense_line::*;
pub use error::*;
pub use evaluator::*;
pub use graph::*;
pub use interpreter::*;
pub use nodes::*;
pub use orchestrator::*;
pub use ports::*;
pub use registry::*;
pub use result::{ExecutionResult, FinalAction};
pub use simulate::*;
pub use snapshot::*;
pub use threshold::*;
pub use value::*;
