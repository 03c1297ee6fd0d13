//! Trace upload preparation: source provenance resolution, manifest
//! construction, and the signed streaming upload pipeline.

pub mod config;
pub mod manifest;
pub mod resolve;
pub mod trace;
pub mod upload;
pub mod util;
pub mod vcs;
