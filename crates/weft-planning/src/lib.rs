//! Weft Planning - plan construction and graph validation
//!
//! Plans are flat lists of steps with dependency edges. This crate turns
//! them into validated DAGs and lays them out in dispatch batches.

pub mod builder;
pub mod graph;
pub mod templates;

pub use builder::{load_plan, save_plan, PlanBuilder};
pub use graph::PlanGraph;
pub use templates::{command_plan, example_plan};
