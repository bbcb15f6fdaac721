//! Configuration loading.
//!
//! Sources, later ones overriding earlier ones:
//! 1. `config/default.{toml,yaml,json}` relative to the working directory (optional)
//! 2. an explicit file passed on the command line (required when given)
//! 3. environment variables `MQBROKER__<SECTION>__<KEY>`, e.g.
//!    `MQBROKER__SERVER__PORT=1884` or `MQBROKER__AUTH__USERS__ESP32=secret`
//!
//! Anything left unspecified falls back to `Settings::default()`.

mod settings;

use std::path::Path;

use config::{Config, ConfigError, Environment, File};

pub use settings::{
    AuthSettings, BrokerSettings, LogSettings, MAX_INFLIGHT, ServerSettings, Settings,
};

use settings::PartialSettings;

pub const ENV_PREFIX: &str = "MQBROKER";

/// Loads the configuration from the default file, an optional explicit file
/// and environment variables, merged over the defaults.
pub fn load_config(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let mut builder =
        Config::builder().add_source(File::with_name("config/default").required(false));

    if let Some(path) = path {
        builder = builder.add_source(File::from(path));
    }

    let config = builder
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let partial: PartialSettings = config.try_deserialize()?;
    Ok(partial.merge(Settings::default()))
}
