pub mod daemon;

pub use daemon::{BosunConfig, BosunConfigSource, CONFIG_JSON_ENV, CONFIG_PATH_ENV};
