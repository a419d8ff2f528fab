use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("could not open log {0}: {1}")]
    OpenLog(PathBuf, #[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid version filter {0:?}, expected YYYY_MM_DD")]
    BadVersionFilter(String),

    #[error("could not read ignore file {0}: {1}")]
    IgnoreFile(PathBuf, #[source] std::io::Error),

    #[error("no log files given")]
    NoInputs,
}
