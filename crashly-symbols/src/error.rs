use std::path::PathBuf;
use thiserror::Error;

/// Configuration-class failures. Everything that is expected during normal
/// operation (missing dumps, unknown addresses, empty tables) is expressed
/// as a placeholder value plus a logged warning, not as an error.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Could not open symbol dump {0}: {1}")]
    OpenDump(PathBuf, #[source] std::io::Error),

    #[error("Could not read symbol dump {0}: {1}")]
    ReadDump(PathBuf, #[source] std::io::Error),

    #[error("Could not write generated symbol dump {0}: {1}")]
    WriteDump(PathBuf, #[source] std::io::Error),

    #[error("No symbol dump dialect is associated with module {0}")]
    UnsupportedModule(String),

    #[error("Dump generator command failed for {0}: {1}")]
    DumpGenerator(String, String),
}
