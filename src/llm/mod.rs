//! LLM integration
//!
//! The planner and the semantic translator treat the model as a black box:
//! structured prompt in, one JSON object out. Any endpoint honouring that
//! contract works.

pub mod client;

pub use client::LlmClient;
