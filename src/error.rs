use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Flat discriminant of [`Error`], used by callers that need to branch on the
/// kind of failure without caring about the wrapped source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidArgument,
    Unauthorized,
    ConnectFailed,
    HostKeyMismatch,
    PoolEmpty,
    StagingDelay,
    SyncFailed,
    ComposeFailed,
    Unimplemented,
    Upstream,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{what} not found: {name}")]
    NotFound { what: &'static str, name: String },
    #[error("{what} already exists: {name}")]
    AlreadyExists { what: &'static str, name: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("failed to connect to {host}: {reason}")]
    ConnectFailed { host: String, reason: String },
    #[error("host key mismatch for {host}: presented key does not match the pinned key")]
    HostKeyMismatch { host: String },
    #[error("no reachable hosts")]
    PoolEmpty,
    #[error(
        "staging the compose root took longer than {0}s, remove large or generated files from the root and restart"
    )]
    StagingDelay(u64),
    #[error("failed to sync bind mount {path} for service {service}: {source}")]
    SyncFailed {
        service: String,
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },
    #[error("compose {operation} failed: {source}")]
    ComposeFailed {
        operation: &'static str,
        #[source]
        source: Box<Error>,
    },
    #[error("{0} is not implemented")]
    Unimplemented(String),
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
    #[error(transparent)]
    Docker(#[from] bollard::errors::Error),
    #[error(transparent)]
    Database(sqlx::Error),
    #[error(transparent)]
    Git(#[from] git2::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Ssh(#[from] russh::Error),
    #[error(transparent)]
    SshKey(#[from] russh_keys::Error),
    #[error(transparent)]
    Sftp(#[from] russh_sftp::client::error::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] Box<figment::Error>),
    #[error("{0}")]
    Upstream(String),
}

impl Error {
    pub fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            what,
            name: name.into(),
        }
    }

    pub fn already_exists(what: &'static str, name: impl Into<String>) -> Self {
        Error::AlreadyExists {
            what,
            name: name.into(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn compose(operation: &'static str, source: Error) -> Self {
        Error::ComposeFailed {
            operation,
            source: Box::new(source),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Unauthorized => ErrorKind::Unauthorized,
            Error::ConnectFailed { .. } => ErrorKind::ConnectFailed,
            Error::HostKeyMismatch { .. } => ErrorKind::HostKeyMismatch,
            Error::PoolEmpty => ErrorKind::PoolEmpty,
            Error::StagingDelay(_) => ErrorKind::StagingDelay,
            Error::SyncFailed { .. } => ErrorKind::SyncFailed,
            Error::ComposeFailed { .. } => ErrorKind::ComposeFailed,
            Error::Unimplemented(_) => ErrorKind::Unimplemented,
            Error::Context { source, .. } => source.kind(),
            Error::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            }) => ErrorKind::NotFound,
            Error::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                ..
            }) => ErrorKind::AlreadyExists,
            _ => ErrorKind::Upstream,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        match value {
            sqlx::Error::RowNotFound => Error::not_found("record", "row"),
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                Error::already_exists("record", db.message().to_string())
            }
            other => Error::Database(other),
        }
    }
}

impl From<figment::Error> for Error {
    fn from(value: figment::Error) -> Self {
        Error::Config(Box::new(value))
    }
}

/// Attach a human readable prefix to an error while keeping its kind.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Context {
            context: context.into(),
            source: Box::new(e.into()),
        })
    }
}
