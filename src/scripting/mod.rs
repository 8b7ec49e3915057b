/// `scripting/`: the Lua side of the bridge
///
/// One `EngineSession` owns one sandboxed Lua VM (mlua). Values cross the
/// boundary through `convert::Marshal`; host objects appear in scripts as
/// `managed::ManagedRef` proxies. `registry::SessionRegistry` addresses
/// sessions by handle and runs scripts on tokio's blocking pool.
pub mod convert;
pub mod date;
pub mod managed;
pub mod registry;
pub mod sandbox;
pub mod session;
