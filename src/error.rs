//! Broker error taxonomy.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad input: empty destination name, malformed header, invalid
    /// selector or timeout. Returned before any side effect.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The referenced transaction is closed or never existed.
    #[error("no such transaction: {0}")]
    NoSuchTransaction(String),

    #[error("queue manager already started")]
    ManagerAlreadyStarted,

    #[error("queue manager not started")]
    ManagerNotStarted,

    /// Backend activation or write failed (path not a directory,
    /// master index not writable, database locked or unreachable).
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Durable state cannot be deserialized.
    #[error("store corrupt: {0}")]
    StoreCorrupt(String),

    /// RPC transport failed after exhausting connect retries.
    #[error("remote endpoint unavailable: {0}")]
    RemoteUnavailable(String),

    /// A store failure forced the transaction to abort.
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("sql backend error: {0}")]
    Sql(#[from] rusqlite::Error),
}

impl Error {
    /// Stable identifier carried over the wire so remote clients can
    /// reconstruct the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "invalid_argument",
            Error::NoSuchTransaction(_) => "no_such_transaction",
            Error::ManagerAlreadyStarted => "manager_already_started",
            Error::ManagerNotStarted => "manager_not_started",
            Error::StoreUnavailable(_) => "store_unavailable",
            Error::StoreCorrupt(_) => "store_corrupt",
            Error::RemoteUnavailable(_) => "remote_unavailable",
            Error::TransactionAborted(_) => "transaction_aborted",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Sql(_) => "sql",
        }
    }

    /// Rebuild an error from its wire identifier and message.
    pub fn from_wire(kind: &str, message: String) -> Self {
        match kind {
            "invalid_argument" => Error::InvalidArgument(message),
            "no_such_transaction" => Error::NoSuchTransaction(message),
            "manager_already_started" => Error::ManagerAlreadyStarted,
            "manager_not_started" => Error::ManagerNotStarted,
            "store_unavailable" => Error::StoreUnavailable(message),
            "store_corrupt" => Error::StoreCorrupt(message),
            "transaction_aborted" => Error::TransactionAborted(message),
            _ => Error::RemoteUnavailable(message),
        }
    }
}
