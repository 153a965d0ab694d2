use std::fmt;
use std::io;

/// Environment variable selecting which `configuration/{env}.*` file overlays the base one.
const ENVIRONMENT_VAR: &str = "APP_ENVIRONMENT";

const DEV: &str = "dev";
const STAGING: &str = "staging";
const PROD: &str = "prod";

/// Deployment environment the target runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl Environment {
    /// Reads the environment from `APP_ENVIRONMENT`, falling back to [`Environment::Dev`].
    pub fn load() -> Result<Environment, io::Error> {
        match std::env::var(ENVIRONMENT_VAR) {
            Ok(value) => value.parse(),
            Err(_) => Ok(Environment::Dev),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => DEV,
            Environment::Staging => STAGING,
            Environment::Prod => PROD,
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Environment {
    type Err = io::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            DEV => Ok(Environment::Dev),
            STAGING => Ok(Environment::Staging),
            PROD => Ok(Environment::Prod),
            other => Err(io::Error::other(format!(
                "`{other}` is not a supported environment, expected one of `{DEV}`, `{STAGING}` or `{PROD}`"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_environments_case_insensitively() {
        assert_eq!("PROD".parse::<Environment>().unwrap(), Environment::Prod);
        assert_eq!(" staging ".parse::<Environment>().unwrap(), Environment::Staging);
        assert_eq!("dev".parse::<Environment>().unwrap(), Environment::Dev);
    }

    #[test]
    fn rejects_unknown_environment() {
        let err = "qa".parse::<Environment>().unwrap_err();
        assert!(err.to_string().contains("`qa`"));
    }
}
