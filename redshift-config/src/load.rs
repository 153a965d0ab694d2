use std::{
    fmt, io,
    path::{Path, PathBuf},
};

use rust_cli_config::builder::{ConfigBuilder, DefaultState};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::environment::Environment;

/// Directory holding `base.*` and `{environment}.*`, relative to the working directory.
const CONFIGURATION_DIR: &str = "configuration";

/// Extensions tried, in order, when looking up a configuration file by stem.
const CONFIG_FILE_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

const ENV_PREFIX: &str = "APP";
const ENV_PREFIX_SEPARATOR: &str = "_";
const ENV_SEPARATOR: &str = "__";
const LIST_SEPARATOR: &str = ",";

/// Implemented by configuration roots that can be loaded with [`load_config`].
pub trait Config {
    /// Keys whose environment-variable values are split on commas into lists.
    const LIST_PARSE_KEYS: &'static [&'static str];
}

/// Which layer of the configuration a file belongs to.
#[derive(Debug, Clone, Copy)]
enum Layer {
    Base,
    Environment(Environment),
    Explicit,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::Base => f.write_str("base configuration"),
            Layer::Environment(env) => write!(f, "{env} environment configuration"),
            Layer::Explicit => f.write_str("configuration file"),
        }
    }
}

/// Errors raised while assembling configuration from files and environment variables.
#[derive(Debug, Error)]
pub enum LoadConfigError {
    #[error("failed to determine the current directory: {0}")]
    CurrentDir(#[source] io::Error),

    #[error("configuration directory `{0}` does not exist")]
    MissingConfigurationDirectory(PathBuf),

    #[error("could not locate {layer} in `{directory}`; attempted: {attempted}")]
    ConfigurationFileMissing {
        layer: String,
        directory: PathBuf,
        attempted: String,
    },

    #[error("configuration file `{0}` does not exist")]
    ExplicitFileMissing(PathBuf),

    #[error("failed to load {layer} from `{path}`: {source}")]
    ConfigurationFileLoad {
        layer: String,
        path: PathBuf,
        source: rust_cli_config::ConfigError,
    },

    #[error("failed to build configuration: {0}")]
    Builder(#[source] rust_cli_config::ConfigError),

    #[error("failed to deserialize configuration: {0}")]
    Deserialization(#[source] rust_cli_config::ConfigError),

    #[error("failed to determine runtime environment: {0}")]
    Environment(#[source] io::Error),
}

/// Loads `configuration/base.*`, overlays `configuration/{APP_ENVIRONMENT}.*` and then
/// `APP_`-prefixed environment variables.
///
/// Nested keys are separated by a double underscore, so `APP_WAREHOUSE__HOST` overrides
/// `warehouse.host`.
pub fn load_config<T>() -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    let base_path = std::env::current_dir().map_err(LoadConfigError::CurrentDir)?;
    let directory = base_path.join(CONFIGURATION_DIR);
    if !directory.is_dir() {
        return Err(LoadConfigError::MissingConfigurationDirectory(directory));
    }

    let environment = Environment::load().map_err(LoadConfigError::Environment)?;

    let base_file = find_configuration_file(&directory, "base", Layer::Base)?;
    let environment_file = find_configuration_file(
        &directory,
        environment.as_str(),
        Layer::Environment(environment),
    )?;

    let builder = rust_cli_config::Config::builder();
    let builder = add_file(builder, Layer::Base, &base_file)?;
    let builder = add_file(builder, Layer::Environment(environment), &environment_file)?;

    finish::<T>(builder)
}

/// Loads a single configuration file given on the command line, then applies the same
/// `APP_` environment overrides as [`load_config`].
pub fn load_config_from_file<T>(path: &Path) -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    if !path.is_file() {
        return Err(LoadConfigError::ExplicitFileMissing(path.to_path_buf()));
    }

    let builder = add_file(rust_cli_config::Config::builder(), Layer::Explicit, path)?;

    finish::<T>(builder)
}

fn finish<T>(builder: ConfigBuilder<DefaultState>) -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    builder
        .add_source(environment_overrides::<T>())
        .build()
        .map_err(LoadConfigError::Builder)?
        .try_deserialize::<T>()
        .map_err(LoadConfigError::Deserialization)
}

fn environment_overrides<T: Config>() -> rust_cli_config::Environment {
    let mut source = rust_cli_config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_PREFIX_SEPARATOR)
        .separator(ENV_SEPARATOR);

    if !T::LIST_PARSE_KEYS.is_empty() {
        source = source.try_parsing(true).list_separator(LIST_SEPARATOR);
        for key in T::LIST_PARSE_KEYS {
            source = source.with_list_parse_key(key);
        }
    }

    source
}

/// Adds a file source and builds once so that a broken file is reported with its layer.
fn add_file(
    builder: ConfigBuilder<DefaultState>,
    layer: Layer,
    path: &Path,
) -> Result<ConfigBuilder<DefaultState>, LoadConfigError> {
    let builder = builder.add_source(rust_cli_config::File::from(path.to_path_buf()));
    builder
        .clone()
        .build()
        .map_err(|source| LoadConfigError::ConfigurationFileLoad {
            layer: layer.to_string(),
            path: path.to_path_buf(),
            source,
        })?;

    Ok(builder)
}

fn find_configuration_file(
    directory: &Path,
    stem: &str,
    layer: Layer,
) -> Result<PathBuf, LoadConfigError> {
    let candidates: Vec<PathBuf> = CONFIG_FILE_EXTENSIONS
        .iter()
        .map(|extension| directory.join(format!("{stem}.{extension}")))
        .collect();

    if let Some(found) = candidates.iter().find(|path| path.is_file()) {
        return Ok(found.clone());
    }

    let attempted = candidates
        .iter()
        .map(|path| format!("`{}`", path.display()))
        .collect::<Vec<_>>()
        .join(", ");

    Err(LoadConfigError::ConfigurationFileMissing {
        layer: layer.to_string(),
        directory: directory.to_path_buf(),
        attempted,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize)]
    struct Sample {
        name: String,
        #[serde(default)]
        size: u32,
    }

    impl Config for Sample {
        const LIST_PARSE_KEYS: &'static [&'static str] = &[];
    }

    #[test]
    fn loads_explicit_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"name": "events", "size": 3}}"#).unwrap();

        let sample: Sample = load_config_from_file(file.path()).unwrap();

        assert_eq!(sample.name, "events");
        assert_eq!(sample.size, 3);
    }

    #[test]
    fn missing_explicit_file_is_reported() {
        let err = load_config_from_file::<Sample>(Path::new("/nonexistent/target.json"))
            .unwrap_err();

        assert!(matches!(err, LoadConfigError::ExplicitFileMissing(_)));
    }

    #[test]
    fn broken_file_reports_its_layer() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, "{{not json").unwrap();

        let err = load_config_from_file::<Sample>(file.path()).unwrap_err();

        assert!(matches!(err, LoadConfigError::ConfigurationFileLoad { .. }));
    }

    #[test]
    fn missing_layer_lists_attempted_paths() {
        let dir = tempfile::tempdir().unwrap();

        let err = find_configuration_file(dir.path(), "base", Layer::Base).unwrap_err();

        let rendered = err.to_string();
        assert!(rendered.contains("base.yaml"));
        assert!(rendered.contains("base.json"));
    }
}
