//! The optimization agent
//!
//! A ReAct-style loop: analyze the current query's plan, have the planner
//! pick one action, apply it, measure the cost delta, remember what
//! happened, repeat until the query passes or a budget runs out.

pub mod action;
pub mod controller;
pub mod executor;
pub mod hypo;
pub mod memory;
pub mod planner;

pub use action::{Action, PlannedAction};
pub use controller::{OptimizationAgent, Solution};
pub use memory::{IterationMemory, IterationRecord, Outcome};
