pub mod config;
pub mod error;
pub mod host;
pub mod scripting;
pub mod value;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use host::{HostFunction, HostObjectTable, NoHostObjects, ObjectArena};
pub use scripting::{
    convert::Marshal,
    date::ScriptDate,
    managed::SessionId,
    registry::{SessionHandle, SessionRegistry},
    sandbox::TrustLevel,
    session::EngineSession,
};
pub use value::{utf16, TaggedValue, ValueKind};
