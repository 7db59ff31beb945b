extern crate failure;
extern crate petgraph;
extern crate serde;

pub mod errors;
pub mod graph;

pub use errors::GraphError;
pub use graph::{LayerGraph, Node};
