use std::fmt;

#[derive(Debug)]
pub enum FrameworkError {
    /// Instance record failed validation before any store interaction.
    InvalidInstance(String),
    /// Lease TTL outside the accepted range.
    InvalidTtl(i64),
    /// Target URL did not match any recognized scheme.
    InvalidTarget(String),
    Config(String),
    /// Register called while already in the registered state.
    AlreadyRegistered(String),
    /// Unregister called while not registered.
    NotRegistered(String),
    /// Coordination-store request or stream failure.
    Etcd(String),
    Internal(String),
}

impl fmt::Display for FrameworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameworkError::InvalidInstance(msg) => write!(f, "invalid instance: {}", msg),
            FrameworkError::InvalidTtl(ttl) => {
                write!(f, "invalid lease ttl {}: must be at least 10 seconds", ttl)
            }
            FrameworkError::InvalidTarget(target) => write!(f, "invalid target url: {}", target),
            FrameworkError::Config(msg) => write!(f, "config error: {}", msg),
            FrameworkError::AlreadyRegistered(key) => {
                write!(f, "already registered: {}", key)
            }
            FrameworkError::NotRegistered(key) => write!(f, "not registered: {}", key),
            FrameworkError::Etcd(msg) => write!(f, "etcd error: {}", msg),
            FrameworkError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for FrameworkError {}
