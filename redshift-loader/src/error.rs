//! Error types for the loading engine.
//!
//! [`LoaderError`] carries an [`ErrorKind`] used to decide between retrying, dead-lettering
//! and aborting the run, together with the call site and a backtrace. Errors raised by several
//! flush workers during a drain are aggregated into a single value.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

pub type LoaderResult<T> = Result<T, LoaderError>;

#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Error returned by every fallible operation of the engine.
#[derive(Debug, Clone)]
pub struct LoaderError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    /// Errors collected from several flush workers.
    Many {
        errors: Vec<LoaderError>,
        location: &'static Location<'static>,
    },
}

/// Classification of failures.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Protocol
    MalformedMessage,
    UnknownStream,

    // Schema
    InvalidSchema,
    IncompatibleSchemaChange,
    UnsupportedSchemaChange,

    // Records
    RecordCoercionError,

    // Staging and loading
    StagingWriteError,
    LoadError,

    // Warehouse transport
    WarehouseConnectionFailed,
    WarehouseTransactionConflict,
    WarehouseQueryFailed,

    // Ambient
    ConfigError,
    IoError,
    SerializationError,
    DeserializationError,
    InvalidState,
    FlushWorkerPanic,

    Unknown,
}

impl ErrorKind {
    /// Returns `true` for failures worth retrying with backoff.
    ///
    /// Staging failures are usually capacity or throttling problems. Dropped connections and
    /// serialization conflicts in the warehouse clear up on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::StagingWriteError
                | ErrorKind::WarehouseConnectionFailed
                | ErrorKind::WarehouseTransactionConflict
                | ErrorKind::IoError
        )
    }
}

impl LoaderError {
    /// Returns the kind of this error, or of the first aggregated error.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns every kind contained in this error.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => {
                errors.iter().flat_map(|err| err.kinds()).collect()
            }
        }
    }

    pub fn description(&self) -> &str {
        match self.repr {
            ErrorRepr::Single(ref payload) => &payload.description,
            ErrorRepr::Many { .. } => "multiple errors",
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|err| err.detail()),
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Whether every contained error is transient.
    pub fn is_transient(&self) -> bool {
        let kinds = self.kinds();
        !kinds.is_empty() && kinds.iter().all(ErrorKind::is_transient)
    }

    /// Attaches the originating error. Ignored on aggregated errors.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    /// Re-labels this error with a new kind and description, keeping it as the source.
    #[track_caller]
    pub fn reclassify(self, kind: ErrorKind, description: &'static str) -> LoaderError {
        let detail = self.to_string_first_line();
        LoaderError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(self)),
        )
    }

    fn to_string_first_line(&self) -> String {
        match self.detail() {
            Some(detail) => format!("{}: {}", self.description(), detail),
            None => self.description().to_string(),
        }
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        LoaderError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for LoaderError {
    fn eq(&self, other: &LoaderError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                if let Some(detail) = payload.detail.as_deref() {
                    write!(f, "\n  Detail:")?;
                    for line in detail.lines() {
                        write!(f, "\n    {line}")?;
                    }
                }

                if payload.backtrace.status() == BacktraceStatus::Captured {
                    write!(f, "\n  Backtrace:")?;
                    for line in payload.backtrace.to_string().lines() {
                        write!(f, "\n    {line}")?;
                    }
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                write!(
                    f,
                    "[Many] {} errors aggregated @ {}:{}:{}",
                    errors.len(),
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    if let Some(first) = lines.next() {
                        write!(f, "\n  {}. {first}", index + 1)?;
                    }
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for LoaderError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source.as_ref() as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

impl From<(ErrorKind, &'static str)> for LoaderError {
    #[track_caller]
    fn from((kind, description): (ErrorKind, &'static str)) -> LoaderError {
        LoaderError::from_components(kind, Cow::Borrowed(description), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for LoaderError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, description, detail): (ErrorKind, &'static str, D)) -> LoaderError {
        LoaderError::from_components(kind, Cow::Borrowed(description), Some(detail.into()), None)
    }
}

/// Aggregates errors. A single error is returned unwrapped.
impl<E> From<Vec<E>> for LoaderError
where
    E: Into<LoaderError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> LoaderError {
        let location = Location::caller();
        let errors: Vec<LoaderError> = errors.into_iter().map(Into::into).collect();

        let errors = match <[LoaderError; 1]>::try_from(errors) {
            Ok([error]) => return error,
            Err(errors) => errors,
        };

        LoaderError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<std::io::Error> for LoaderError {
    #[track_caller]
    fn from(err: std::io::Error) -> LoaderError {
        let detail = err.to_string();
        LoaderError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<serde_json::Error> for LoaderError {
    #[track_caller]
    fn from(err: serde_json::Error) -> LoaderError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };

        let detail = err.to_string();
        LoaderError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Classifies warehouse errors by SQLSTATE.
///
/// `40P01` (deadlock) and `40001` (serialization failure) are conflicts, class `08` is a
/// broken connection and everything else reported by the server is a failed query.
impl From<sqlx::Error> for LoaderError {
    #[track_caller]
    fn from(err: sqlx::Error) -> LoaderError {
        let (kind, description) = match &err {
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                Some("40P01") | Some("40001") => (
                    ErrorKind::WarehouseTransactionConflict,
                    "Warehouse transaction conflict",
                ),
                Some(code) if code.starts_with("08") => (
                    ErrorKind::WarehouseConnectionFailed,
                    "Warehouse connection failed",
                ),
                _ => (ErrorKind::WarehouseQueryFailed, "Warehouse query failed"),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => (
                ErrorKind::WarehouseConnectionFailed,
                "Warehouse connection failed",
            ),
            sqlx::Error::Configuration(_) => {
                (ErrorKind::ConfigError, "Warehouse connection misconfigured")
            }
            _ => (ErrorKind::WarehouseQueryFailed, "Warehouse operation failed"),
        };

        let detail = err.to_string();
        LoaderError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<object_store::Error> for LoaderError {
    #[track_caller]
    fn from(err: object_store::Error) -> LoaderError {
        let detail = err.to_string();
        LoaderError::from_components(
            ErrorKind::StagingWriteError,
            Cow::Borrowed("Staging store operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}
