//! Depot access: configuration, sessions, the session pool and the
//! command/result surface over the Perforce client wrapper.

pub mod command;
pub mod config;
pub mod encoding;
pub mod pool;
pub mod result;
pub mod revision;
pub mod session;
pub mod sync_action;
pub mod transport;

/// Session-level failures. Command failures never surface here; they are
/// reported inside [`result::DepotResult`].
#[derive(Debug)]
pub enum SessionError {
    /// No live connection behind the session.
    NotConnected,
    /// The connection configuration could not be resolved.
    Configuration(String),
    /// The underlying client wrapper faulted.
    Transport(String),
    /// I/O outside the wrapper (tickets file, helper process).
    Io(std::io::Error),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::NotConnected => write!(f, "session not connected"),
            SessionError::Configuration(text) => write!(f, "configuration: {text}"),
            SessionError::Transport(text) => write!(f, "transport: {text}"),
            SessionError::Io(error) => write!(f, "io: {error}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<std::io::Error> for SessionError {
    fn from(error: std::io::Error) -> Self {
        SessionError::Io(error)
    }
}
