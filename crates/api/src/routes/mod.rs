//! Route Handlers

pub mod alerts;
pub mod incidents;
pub mod stream;
