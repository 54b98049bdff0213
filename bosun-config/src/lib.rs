//! Configuration loading for bosun.
//!
//! Resolves the daemon configuration from environment variables, config files
//! or defaults, and provides the default on-disk layout for project
//! checkouts.
#![allow(missing_docs)]

pub mod layout;
pub mod models;

pub use layout::LayoutResolver;
pub use models::{BosunConfig, BosunConfigSource, CONFIG_JSON_ENV, CONFIG_PATH_ENV};
