mod cluster_map;
mod local_participant;
mod participant;
mod types;

pub use cluster_map::*;
pub use local_participant::*;
pub use participant::*;
pub use types::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("initialization error: {0}")]
    Initialization(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("store not started: {0}")]
    StoreNotStarted(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::IoError(err.to_string())
    }
}

/// Failure raised out of a partition state-transition callback. The cluster
/// coordinator interprets any of these as "move this replica to ERROR on
/// this node".
#[derive(Error, Debug)]
pub enum StateTransitionError {
    #[error("replica not found: {0}")]
    ReplicaNotFound(String),
    #[error("replica operation failure: {0}")]
    ReplicaOperationFailure(String),
    #[error("store not started: {0}")]
    StoreNotStarted(String),
    #[error("cluster update failure: {0}")]
    ClusterUpdateFailure(String),
}

pub type TransitionResult<T> = std::result::Result<T, StateTransitionError>;
