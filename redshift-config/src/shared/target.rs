use serde::Deserialize;

use crate::Config;
use crate::shared::{LoaderConfig, StagingConfig, ValidationError, WarehouseConfig};

/// Complete configuration of the Redshift target.
///
/// Like its secret-holding sections, it does not implement `Serialize`.
#[derive(Clone, Debug, Deserialize)]
pub struct TargetConfig {
    pub warehouse: WarehouseConfig,
    pub staging: StagingConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
}

impl TargetConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.warehouse.validate()?;
        self.staging.validate()?;
        self.loader.validate()
    }
}

impl Config for TargetConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &["loader.default_select_permissions"];
}
