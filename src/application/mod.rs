//! Application services: the decision-and-rendering pipeline.

pub mod classifier;
pub mod decision;
pub mod error;
pub mod interceptor;
pub mod orchestrator;
pub mod policy;
pub mod render;
