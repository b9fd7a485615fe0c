//! Error types for the solwatch indexer

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid public key: {0}")]
    InvalidKey(String),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),
}

pub type Result<T> = std::result::Result<T, Error>;
