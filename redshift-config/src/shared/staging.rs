use std::path::PathBuf;

use secrecy::SecretString;
use serde::Deserialize;

use crate::shared::ValidationError;

/// Where flush batches are written before being loaded into the warehouse.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StagingConfig {
    /// Objects are uploaded to S3 and loaded with `COPY ... FROM 's3://...'`.
    S3 {
        bucket: String,
        #[serde(default)]
        key_prefix: String,
        region: String,
        /// Custom endpoint, for S3-compatible stores.
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        access_key_id: Option<String>,
        #[serde(default)]
        secret_access_key: Option<SecretString>,
        /// IAM role Redshift assumes to read the bucket. Key based credentials are used
        /// in the `COPY` when absent.
        #[serde(default)]
        iam_role: Option<String>,
    },
    /// Objects are written under a local directory and streamed with `COPY ... FROM STDIN`.
    Local { path: PathBuf },
}

impl StagingConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            StagingConfig::S3 {
                bucket,
                iam_role,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.trim().is_empty() {
                    return Err(ValidationError::MissingField("staging.bucket".to_string()));
                }

                let has_keys = access_key_id.is_some() && secret_access_key.is_some();
                if iam_role.is_none() && !has_keys {
                    return Err(ValidationError::invalid(
                        "staging",
                        "either `iam_role` or both `access_key_id` and `secret_access_key` must be set",
                    ));
                }

                Ok(())
            }
            StagingConfig::Local { path } => {
                if path.as_os_str().is_empty() {
                    return Err(ValidationError::MissingField("staging.path".to_string()));
                }

                Ok(())
            }
        }
    }
}
