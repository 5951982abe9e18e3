//! # locusdb Configuration Module
//!
//! This module centralizes all configuration constants for locusdb. Constants
//! are grouped by their functional area and interdependencies are documented and
//! enforced through compile-time assertions.
//!
//! Runtime configuration (heap size, locator capacity, persistence, triggers)
//! lives on [`crate::database::DatabaseBuilder`]; the values here are its
//! defaults and hard limits.
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency documentation

pub mod constants;
pub use constants::*;
