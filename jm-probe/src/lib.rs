mod config;
mod error;
mod logging;
mod selftest;

pub use config::{
    ConfigError, DEFAULT_ALIAS_COUNT, DEFAULT_CODE_SIZE, DEFAULT_SEGMENT_SIZE, ProbeConfig,
};
pub use error::ProbeError;
pub use logging::{category_arena, category_jit, init as init_logging, outcome_label};
pub use selftest::{
    ArenaReport, CacheReport, ViewReport, run_arena_check, run_block_cache_check,
    run_host_block_cache_check,
};
