//! Command implementations

pub mod apply;
pub mod facts;
pub mod manifest;
pub mod plan;
pub mod status;
