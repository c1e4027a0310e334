//! Application services layer.

pub mod backend;
pub mod error;
pub mod inventory;
