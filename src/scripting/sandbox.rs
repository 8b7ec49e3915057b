/// `scripting/sandbox.rs`: standard library restrictions per session
///
/// Every session VM is created with a restricted set of standard libraries.
/// Dangerous libraries (os, io, debug, package) are omitted by default.
/// Sessions can be granted additional trust levels through their config.
use mlua::{Lua, LuaOptions, Result as LuaResult, StdLib};
use serde::{Deserialize, Serialize};

/// Controls which Lua standard libraries are available to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Default: string, table, math, coroutine, utf8. No I/O or OS
    Basic,
    /// Basic + io (for reading files in a scoped path)
    FileRead,
    /// Basic + io, os and package. Only for trusted hosts
    Elevated,
}

impl Default for TrustLevel {
    fn default() -> Self {
        Self::Basic
    }
}

impl TrustLevel {
    pub fn std_libs(&self) -> StdLib {
        let basic = StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::COROUTINE | StdLib::UTF8;
        match self {
            TrustLevel::Basic => basic,
            TrustLevel::FileRead => basic | StdLib::IO,
            TrustLevel::Elevated => basic | StdLib::IO | StdLib::OS | StdLib::PACKAGE,
        }
    }
}

/// Creates a new Lua VM with sandbox restrictions applied.
///
/// The base library is always present; `pcall`, `tostring` and
/// `collectgarbage` come from it.
pub fn create_sandboxed_vm(trust: &TrustLevel) -> LuaResult<Lua> {
    Lua::new_with(trust.std_libs(), LuaOptions::default())
}
