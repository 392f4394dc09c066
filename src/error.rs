use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("ERR Invalid port number")]
    InvalidPort,

    #[error("ERR Can't resolve instance hostname '{0}'")]
    Unresolvable(String),

    #[error("ERR Duplicated instance name '{0}'")]
    Duplicate(String),

    #[error("ERR No such master with that name")]
    NoSuchPrimary,

    #[error("ERR Quorum must be 1 or greater")]
    QuorumMustBePositive,

    #[error("ERR Script '{0}' seems non existing or non executable")]
    NonExecutableScript(String),

    #[error("INPROG Failover already in progress")]
    FailoverInProgress,

    #[error("NOGOODSLAVE No suitable replica to promote")]
    NoSuitableReplica,

    #[error("IDONTKNOW I have not enough information to reply. Please ask another supervisor.")]
    InsufficientInfo,

    #[error("ERR config line {line}: {msg}")]
    Config { line: usize, msg: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
