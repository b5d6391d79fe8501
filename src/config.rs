//! Configuration loading. The types live in `ottoflow_shared::config` so the
//! simulator and tests build the same structures.

pub use ottoflow_shared::config::*;

pub const DEFAULT_CONFIG_PATH: &str = "ottoflow.toml";
