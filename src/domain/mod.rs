//! Domain layer types and invariants.

pub mod cidr;
pub mod classification;
pub mod decision;
pub mod error;
pub mod pattern;
pub mod render;
pub mod rules;
pub mod types;
