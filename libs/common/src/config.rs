//! Layered configuration loading
//!
//! Priority, highest first:
//! 1. Environment variables, `PREFIX_SECTION__KEY=value`
//! 2. The config file, format chosen by extension
//! 3. `T::default()`

use std::path::Path;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Log which config file is in effect; `false` when the file is absent
///
/// Loading happens before the subscriber exists, so services call this once
/// logging is up.
pub fn report_source(path: Option<&Path>) -> bool {
    match path {
        Some(path) if path.exists() => {
            info!("Config file: {}", path.display());
            true
        },
        Some(path) => {
            warn!("Config file {} not found, using defaults", path.display());
            false
        },
        None => {
            info!("No config file, using defaults");
            false
        },
    }
}

/// Build the figment without extracting it
///
/// A missing file is not an error; the service then runs on defaults plus
/// environment overrides.
pub fn figment_for<T>(path: Option<&Path>, env_prefix: &str) -> Result<Figment>
where
    T: Serialize + Default,
{
    let mut figment = Figment::from(Serialized::defaults(T::default()));

    if let Some(path) = path {
        if path.exists() {
            let extension = path
                .extension()
                .and_then(|s| s.to_str())
                .ok_or_else(|| Error::config("config file must have an extension"))?;

            figment = match extension {
                "yaml" | "yml" => figment.merge(Yaml::file(path)),
                "toml" => figment.merge(Toml::file(path)),
                "json" => figment.merge(Json::file(path)),
                other => {
                    return Err(Error::config(format!(
                        "unsupported config format: {other}"
                    )))
                },
            };
            debug!("Config file: {}", path.display());
        }
    }

    Ok(figment.merge(Env::prefixed(env_prefix).split("__")))
}

/// Load `T` from defaults, an optional file and prefixed environment variables
pub fn load_config<T>(path: Option<&Path>, env_prefix: &str) -> Result<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    figment_for::<T>(path, env_prefix)?
        .extract()
        .map_err(|e| Error::config(format!("failed to load configuration: {e}")))
}
