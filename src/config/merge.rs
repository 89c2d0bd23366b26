//! Merge rules: defaults, override order, conflict handling.

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError};

/// Create a Config builder with merge policy defaults applied.
///
/// Later sources override earlier ones key by key, so a file that only sets
/// `client.batch_size_limit` keeps every other default.
pub fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("server.bind_address", "127.0.0.1")?
        .set_default("server.port", 3000)?
        .set_default("client.batch_size_limit", 100)?
        .set_default("client.batch_window_ms", 0)?
        .set_default("client.connect_timeout_secs", 10)?
        .set_default("client.request_timeout_secs", 120)?
        .set_default("logging.level", "info")
}
