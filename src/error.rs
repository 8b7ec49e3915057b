//! Failures that cannot be expressed as an Error-kind `TaggedValue`.
//!
//! Script exceptions, compile failures and unsupported values never show up
//! here; they come back as ordinary values. Only resource exhaustion and
//! misuse of the handle surface abort an operation.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// The engine could not allocate (memory limit hit, or a buffer, array or
    /// state could not be created). Fatal to the operation, not the session.
    OutOfMemory(String),
    /// The engine failed outside of script execution.
    Engine(String),
    /// No live session is registered under this handle.
    UnknownSession(u32),
    /// A blocking worker running a session call did not complete.
    Worker(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::OutOfMemory(msg) => write!(f, "script engine out of memory: {msg}"),
            EngineError::Engine(msg) => write!(f, "script engine failure: {msg}"),
            EngineError::UnknownSession(handle) => write!(f, "no session with handle {handle}"),
            EngineError::Worker(msg) => write!(f, "session worker failed: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<mlua::Error> for EngineError {
    fn from(err: mlua::Error) -> Self {
        match err {
            mlua::Error::MemoryError(msg) => EngineError::OutOfMemory(msg),
            other => EngineError::Engine(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_errors_map_to_exhaustion() {
        let err = EngineError::from(mlua::Error::MemoryError("not enough memory".into()));
        assert_eq!(err, EngineError::OutOfMemory("not enough memory".into()));
    }

    #[test]
    fn other_errors_are_engine_failures() {
        let err = EngineError::from(mlua::Error::RuntimeError("bad".into()));
        assert!(matches!(err, EngineError::Engine(msg) if msg.contains("bad")));
    }
}
