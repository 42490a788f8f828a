mod settings;

use config::{Config, Environment, File};

use settings::PartialSettings;

pub use settings::{ClientSettings, ServerSettings, Settings, SettingsError};

/// Loads the configuration from `config/default` and `RELAYQ__*` environment
/// variables, merged over the built-in defaults.
pub fn load_config() -> Result<Settings, SettingsError> {
    load_config_from("config/default")
}

/// Same as [`load_config`] with an explicit file stem; the file is optional
/// and its format is picked from the extension found on disk.
pub fn load_config_from(path: &str) -> Result<Settings, SettingsError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix("RELAYQ")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    // Merge with defaults
    let default = Settings::default();

    let settings = Settings {
        server: partial.server.unwrap_or_default().merge(default.server),
        client: partial.client.unwrap_or_default().merge(default.client),
        log_level: partial.log_level.unwrap_or(default.log_level),
    };
    Ok(settings)
}

#[cfg(test)]
mod tests;
