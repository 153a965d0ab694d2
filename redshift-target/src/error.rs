use std::backtrace::Backtrace;
use std::error::Error;
use std::fmt;

use redshift_config::LoadConfigError;
use redshift_config::shared::ValidationError;
use redshift_loader::error::LoaderError;
use redshift_telemetry::tracing::TracingError;

fn should_render_backtrace() -> bool {
    matches!(
        std::env::var("RUST_BACKTRACE").as_deref(),
        Ok("1") | Ok("full")
    )
}

pub type TargetResult<T> = Result<T, TargetError>;

/// Error type of the target binary.
///
/// Wraps [`LoaderError`] for failures of the loading engine and carries its own variants for
/// process setup.
#[derive(Debug)]
pub enum TargetError {
    Loader(LoaderError),
    Config(Box<dyn Error + Send + Sync>),
    Io(std::io::Error, Backtrace),
}

impl TargetError {
    pub fn category(&self) -> &'static str {
        match self {
            TargetError::Loader(_) => "loading error",
            TargetError::Config(_) => "configuration error",
            TargetError::Io(_, _) => "i/o error",
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self {
            TargetError::Loader(err) => err.backtrace(),
            TargetError::Config(_) => None,
            TargetError::Io(_, backtrace) => Some(backtrace),
        }
    }

    pub fn config<E: Error + Send + Sync + 'static>(err: E) -> Self {
        TargetError::Config(Box::new(err))
    }

    /// Report printed to stderr before exiting with a failure status.
    pub fn render_report(&self) -> String {
        let mut out = String::new();
        out.push_str("target-redshift failed\n");
        out.push_str(&format!("category: {}\n", self.category()));
        out.push_str(&format!("error: {self}\n"));

        let mut source = Error::source(self);
        let mut idx = 1usize;
        while let Some(err) = source {
            out.push_str(&format!("cause {idx}: {err}\n"));
            source = err.source();
            idx += 1;
        }

        if should_render_backtrace() {
            if let Some(backtrace) = self.backtrace() {
                out.push_str("backtrace:\n");
                out.push_str(&backtrace.to_string());
                if !out.ends_with('\n') {
                    out.push('\n');
                }
            }
        }

        out
    }
}

impl fmt::Display for TargetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetError::Loader(err) => write!(f, "{}", first_line(err)),
            TargetError::Config(source) => write!(f, "configuration error: {source}"),
            TargetError::Io(source, _) => write!(f, "i/o error: {source}"),
        }
    }
}

impl Error for TargetError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TargetError::Loader(err) => err.source(),
            TargetError::Config(source) => Some(source.as_ref()),
            TargetError::Io(source, _) => Some(source),
        }
    }
}

/// Loader errors render their detail and backtrace over several lines. The report shows
/// those separately.
fn first_line(err: &LoaderError) -> String {
    match err.detail() {
        Some(detail) => format!("[{:?}] {}: {detail}", err.kind(), err.description()),
        None => format!("[{:?}] {}", err.kind(), err.description()),
    }
}

impl From<LoaderError> for TargetError {
    fn from(err: LoaderError) -> Self {
        TargetError::Loader(err)
    }
}

impl From<std::io::Error> for TargetError {
    fn from(err: std::io::Error) -> Self {
        TargetError::Io(err, Backtrace::capture())
    }
}

impl From<LoadConfigError> for TargetError {
    fn from(err: LoadConfigError) -> Self {
        TargetError::config(err)
    }
}

impl From<ValidationError> for TargetError {
    fn from(err: ValidationError) -> Self {
        TargetError::config(err)
    }
}

impl From<TracingError> for TargetError {
    fn from(err: TracingError) -> Self {
        TargetError::config(err)
    }
}
