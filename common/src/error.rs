use std::path::PathBuf;

/// Errors raised by the ingest loop and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The serial endpoint could not be opened.
    #[error("could not open port {port}: {source}")]
    Connect {
        port: String,
        #[source]
        source: serialport::Error,
    },

    /// The OS could not enumerate its serial ports.
    #[error("could not list serial ports: {0}")]
    ListPorts(#[source] serialport::Error),

    /// Reading from an open serial endpoint failed with something other than a timeout.
    #[error("serial read failed: {0}")]
    Serial(#[source] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// An existing log was written with a different column layout.
    #[error("{} starts with {found:?}, expected {expected:?}", .path.display())]
    SchemaMismatch {
        path: PathBuf,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("row has {found} values, the log has {expected} columns")]
    RowArity { expected: usize, found: usize },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("credentials: {0}")]
    Credentials(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
