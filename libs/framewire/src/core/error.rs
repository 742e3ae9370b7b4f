use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("buffer pool allocation failed: {0}")]
    PoolAllocation(String),

    #[error("graph error: {0}")]
    Graph(String),

    #[error("worker context has been shut down")]
    ContextShutdown,

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
