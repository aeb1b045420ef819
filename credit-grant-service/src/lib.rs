//! Credit grant scheduling and application engine.

pub mod config;
pub mod models;
pub mod services;
pub mod startup;
