use crate::bitbucket::BitbucketError;
use crate::directory::DirectoryError;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),
}

#[derive(thiserror::Error, Debug)]
pub enum ReconcilerError {
    #[error(transparent)]
    Bitbucket(#[from] BitbucketError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Errors that stop the service from starting or keep it from serving.
#[derive(thiserror::Error, Debug)]
pub enum StartupError {
    #[error("invalid config: {0}")]
    InvalidConfig(#[from] crate::config::InvalidConfig),
    #[error("could not load directory: {0}")]
    Directory(#[from] DirectoryError),
    #[error("could not reach bitbucket: {0}")]
    Bitbucket(#[from] BitbucketError),
    #[error("workspace {0} is not visible to the configured credentials")]
    UnknownWorkspace(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
