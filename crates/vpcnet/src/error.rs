/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("cidr overlap: {0}")]
    CidrOverlap(String),

    #[error("cidr out of range: {0}")]
    CidrOutOfRange(String),

    #[error("invalid cidr: {0}")]
    CidrInvalid(String),

    #[error("malformed policy: {0}")]
    PolicyMalformed(String),

    #[error("no subnet matches {0}")]
    NoMatchingSubnet(String),

    #[error("command failed: {command}\n{stderr}")]
    Exec { command: String, stderr: String },

    #[error("command timed out after {timeout_secs}s: {command}")]
    Timeout { command: String, timeout_secs: u64 },

    #[error("state corrupt: {0}")]
    StateCorrupt(String),

    #[error("insufficient privilege: {0}")]
    Privilege(String),

    #[error("cannot peer {0} with itself")]
    SelfPeer(String),

    #[error("{0} and {1} are already peered")]
    AlreadyPeered(String, String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
