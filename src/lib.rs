//! Prerendering reverse proxy: crawlers get rendered HTML snapshots, everyone
//! else is passed through to the origin untouched.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
