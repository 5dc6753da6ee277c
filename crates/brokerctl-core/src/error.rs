use std::time::Duration;
use thiserror::Error;

/// Failure reported by a backend adapter for a single send or receive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("no data available")]
    NoData,

    #[error("end of stream")]
    EndOfStream,

    #[error("{0}")]
    Fatal(String),
}

impl BackendError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Unavailable(_) | BackendError::Timeout(_) | BackendError::NoData
        )
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("failed to publish message after {attempts} attempt(s): {source}")]
    Publish {
        attempts: u32,
        #[source]
        source: BackendError,
    },

    #[error("receive error: {0}")]
    Receive(#[source] BackendError),

    #[error("fatal stream error: {0}")]
    FatalStream(#[source] BackendError),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Process exit codes, one per error category.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const CONFIG: i32 = 1;
    pub const CONNECTION: i32 = 2;
    pub const PUBLISH: i32 = 3;
    pub const SUBSCRIBE: i32 = 4;
    pub const INTERNAL: i32 = 5;
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => exit_code::CONFIG,
            Error::Connection(_) => exit_code::CONNECTION,
            Error::Publish { .. } => exit_code::PUBLISH,
            Error::Receive(_) | Error::FatalStream(_) => exit_code::SUBSCRIBE,
            Error::Other(_) => exit_code::INTERNAL,
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(format!("failed to parse config: {e}"))
    }
}
