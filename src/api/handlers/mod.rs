//! HTTP endpoint handlers.

pub mod relay;
pub mod system;
