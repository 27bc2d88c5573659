use std::fmt;
use thiserror::Error;
use tokio::time::Duration;

#[derive(Error, Debug)]
pub enum StdError {
    #[error("YamlSerializationError: {0}")]
    YamlSerializationError(#[source] serde_yaml::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("failed to {verb} {kind} {key}: {source}")]
    Store {
        verb: &'static str,
        kind: String,
        key: String,
        #[source]
        source: kube::Error,
    },

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("Metrics Error: {0}")]
    MetricsError(#[source] prometheus::Error),

    #[error("MetadataMissing: {0}")]
    MetadataMissing(String),

    #[error("InvalidSpec: {0}")]
    InvalidSpec(String),

    #[error("{0}")]
    Aggregate(AggregateError),
}

impl StdError {
    pub fn metric_label(&self) -> String {
        match self {
            StdError::YamlSerializationError(_) => "yaml_serialization",
            StdError::KubeError(_) => "kube",
            StdError::Store { .. } => "store",
            StdError::FinalizerError(_) => "finalizer",
            StdError::MetricsError(_) => "metrics",
            StdError::MetadataMissing(_) => "metadata_missing",
            StdError::InvalidSpec(_) => "invalid_spec",
            StdError::Aggregate(_) => "aggregate",
        }
        .to_string()
    }
}

#[derive(Error, Debug)]
pub struct ErrorWithRequeue {
    pub duration: Duration,
    pub error: StdError,
}

impl ErrorWithRequeue {
    pub fn new(error: StdError, duration: Duration) -> ErrorWithRequeue {
        ErrorWithRequeue { error, duration }
    }

    pub fn metric_label(&self) -> String {
        self.error.metric_label()
    }
}

impl fmt::Display for ErrorWithRequeue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (retry in {:?})", self.error, self.duration)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Standard Error: {0}")]
    StdError(#[source] StdError),

    #[error("Error With Requeue: {0}")]
    ErrorWithRequeue(#[source] ErrorWithRequeue),
}

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::StdError(e) => e.metric_label(),
            Error::ErrorWithRequeue(e) => e.metric_label(),
        }
    }

    /// The explicit delay carried by a retryable error.
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Error::ErrorWithRequeue(e) => Some(e.duration),
            Error::StdError(_) => None,
        }
    }

    pub fn invalid_spec(message: impl Into<String>) -> Error {
        Error::StdError(StdError::InvalidSpec(message.into()))
    }

    pub fn requeue(error: StdError, duration: Duration) -> Error {
        Error::ErrorWithRequeue(ErrorWithRequeue::new(error, duration))
    }
}

impl From<StdError> for Error {
    fn from(error: StdError) -> Self {
        Error::StdError(error)
    }
}

/// Every failure collected during one pass over independent children.
#[derive(Debug)]
pub struct AggregateError(pub Vec<Error>);

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} errors occurred: [", self.0.len())?;
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{e}")?;
        }
        write!(f, "]")
    }
}

impl std::error::Error for AggregateError {}

/// Folds the errors of one pass into a single result.
///
/// A lone error is returned as is. Several errors become an aggregate, which is
/// only retryable (with the shortest delay) when every member is retryable.
pub fn aggregate(mut errors: Vec<Error>) -> Result<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => {
            let delays: Vec<Duration> = errors.iter().filter_map(Error::requeue_after).collect();
            let all_retryable = delays.len() == errors.len();
            let error = StdError::Aggregate(AggregateError(errors));
            match delays.into_iter().min() {
                Some(delay) if all_retryable => Err(Error::requeue(error, delay)),
                _ => Err(Error::StdError(error)),
            }
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
