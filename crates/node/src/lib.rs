//! Engine node: wires the job executor, the process runtime and an external
//! task worker from one configuration document.

pub mod config;
pub mod demo;
pub mod node;

pub use config::{DemoConfig, NodeConfig};
pub use node::Node;
