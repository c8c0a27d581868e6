use kiln_cache::CacheError;
use kiln_scheduler::OrchestratorError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error("invalid build request `{build_key}`: {message}")]
    InvalidRequest { build_key: String, message: String },
}

pub type Result<T> = std::result::Result<T, BuildError>;
