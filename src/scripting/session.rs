/// `scripting/session.rs`: one sandboxed Lua state per session
///
/// Every operation locks the session, enters it, does its conversions and
/// engine calls, and exits. Exit is tied to a guard's `Drop`, so it happens
/// exactly once whichever way the operation returns.
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};

use mlua::{ChunkMode, Error as LuaError, Function, Lua, Value};

use super::{
    convert::{error_from_exception, root_cause, root_message, Marshal, TOSTRING_KEY},
    date::register_date,
    managed::{SessionId, SessionLink},
    sandbox::create_sandboxed_vm,
};
use crate::{
    config::EngineConfig,
    error::{EngineError, EngineResult},
    host::HostObjectTable,
    value::TaggedValue,
};

/// Registry slot holding the session's exception trap.
const TRAP_KEY: &str = "script_bridge.trap";

/// Runs a chunk under `xpcall` and returns `ok, value, raised`. The message
/// handler sees every error the script raises, but never an allocation
/// failure, so `raised` is false only for errors of the engine itself.
const TRAP_SOURCE: &str = r#"
local xpcall, rawequal = xpcall, rawequal
local marker = {}
local caught
local function handler(e)
    caught = e
    return marker
end
return function(chunk)
    caught = nil
    local ok, result = xpcall(chunk, handler)
    local e = caught
    caught = nil
    if ok then
        return true, result, false
    elseif rawequal(result, marker) then
        return false, e, true
    end
    return false, result, false
end
"#;

/// Message Lua raises when an allocation fails.
const LUA_MEMORY_ERROR: &[u8] = b"not enough memory";

static NEXT_SESSION_ID: AtomicU32 = AtomicU32::new(1);

struct SessionState {
    lua: Lua,
}

impl Drop for SessionState {
    fn drop(&mut self) {
        // Persistent handles go first; the state itself is closed when `lua`
        // drops right after, which finalizes every remaining proxy.
        for key in [TRAP_KEY, TOSTRING_KEY] {
            if let Err(e) = self.lua.unset_named_registry_value(key) {
                log::warn!("failed to release registry slot {key}: {e}");
            }
        }
    }
}

/// Lock held for the duration of one operation.
struct Entered<'a> {
    state: MutexGuard<'a, SessionState>,
    id: SessionId,
}

impl Drop for Entered<'_> {
    fn drop(&mut self) {
        log::trace!("[{}] exit", self.id);
    }
}

/// An isolated script execution environment.
///
/// Safe to share between threads; calls are serialised on an internal lock,
/// so a second caller blocks until the first returns. Host callbacks made
/// while a call is in progress must not call back into the same session.
pub struct EngineSession {
    link: Arc<SessionLink>,
    config: EngineConfig,
    state: Mutex<SessionState>,
}

impl EngineSession {
    /// Allocate a sandboxed state with its global context and exception trap.
    pub fn create(config: EngineConfig, host: Arc<dyn HostObjectTable>) -> EngineResult<Self> {
        let id = SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed));
        let lua = create_sandboxed_vm(&config.trust_level)?;

        register_date(&lua)?;
        let globals = lua.globals();
        let trap: Function = lua.load(TRAP_SOURCE).set_name("=trap").eval()?;
        let tostring: Function = globals.raw_get("tostring")?;
        lua.set_named_registry_value(TRAP_KEY, trap)?;
        lua.set_named_registry_value(TOSTRING_KEY, tostring)?;

        if let Some(limit) = config.memory_limit {
            lua.set_memory_limit(limit)?;
        }

        log::debug!(
            "[{id}] created (trust {:?}, memory limit {:?})",
            config.trust_level,
            config.memory_limit
        );
        Ok(Self {
            link: Arc::new(SessionLink::new(id, host, config.max_depth)),
            config,
            state: Mutex::new(SessionState { lua }),
        })
    }

    /// Tear the session down. Consuming `self` makes a second dispose
    /// impossible; dropping the session has the same effect.
    pub fn dispose(self) {
        log::debug!("[{}] disposed", self.link.id);
    }

    pub fn id(&self) -> SessionId {
        self.link.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Managed proxies created by this session that are still alive.
    pub fn live_proxies(&self) -> usize {
        self.link.live_proxies()
    }

    /// Compile and run `source` (UTF-16) against the global context.
    ///
    /// Compile failures and thrown exceptions come back as Error values; a
    /// script that fails to compile executes nothing. On success the first
    /// value the chunk returns is converted (Null if it returns nothing).
    pub fn run(&self, source: &[u16]) -> EngineResult<TaggedValue> {
        let entered = self.enter();
        let lua = &entered.state.lua;

        let chunk = lua
            .load(String::from_utf16_lossy(source))
            .set_name(format!("={}", self.config.chunk_name))
            .set_mode(ChunkMode::Text)
            .into_function();
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                log::warn!("[{}] compile failed: {}", self.link.id, root_message(&err));
                return self.script_failure(err);
            }
        };

        let trap: Function = lua.named_registry_value(TRAP_KEY)?;
        let (ok, result, raised): (bool, Value, bool) = trap.call(chunk)?;
        let marshal = Marshal::new(lua, &self.link);
        if ok {
            return Ok(marshal.from_native(&result)?);
        }
        if is_out_of_memory(&result, raised) {
            return Err(EngineError::OutOfMemory(
                String::from_utf8_lossy(LUA_MEMORY_ERROR).into_owned(),
            ));
        }
        let error = error_from_exception(lua, &result)?;
        log::warn!(
            "[{}] script raised: {}",
            self.link.id,
            error.to_string_lossy().unwrap_or_default()
        );
        Ok(error)
    }

    /// Convenience wrapper over [`run`](Self::run) for Rust strings.
    pub fn run_str(&self, source: &str) -> EngineResult<TaggedValue> {
        self.run(&crate::value::utf16(source))
    }

    /// Assign a global. Returns Null on success rather than the value; an
    /// Error value means nothing was assigned.
    pub fn set_global(&self, name: &[u16], value: TaggedValue) -> EngineResult<TaggedValue> {
        let entered = self.enter();
        let lua = &entered.state.lua;

        let native = match Marshal::new(lua, &self.link).to_native(value) {
            Ok(native) => native,
            Err(err) => return self.script_failure(err),
        };
        match lua.globals().set(String::from_utf16_lossy(name), native) {
            Ok(()) => Ok(TaggedValue::Null),
            Err(err) => self.script_failure(err),
        }
    }

    /// Read a global and convert it. Missing globals read as Null.
    pub fn get_global(&self, name: &[u16]) -> EngineResult<TaggedValue> {
        let entered = self.enter();
        let lua = &entered.state.lua;

        let native = match lua.globals().raw_get::<Value>(String::from_utf16_lossy(name)) {
            Ok(native) => native,
            Err(err) => return self.script_failure(err),
        };
        Ok(Marshal::new(lua, &self.link).from_native(&native)?)
    }

    fn enter(&self) -> Entered<'_> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        log::trace!("[{}] enter", self.link.id);
        Entered {
            state,
            id: self.link.id,
        }
    }

    /// Script-domain failures become Error values; allocation failures abort.
    fn script_failure(&self, err: LuaError) -> EngineResult<TaggedValue> {
        match root_cause(&err) {
            LuaError::MemoryError(msg) => Err(EngineError::OutOfMemory(msg.clone())),
            _ => Ok(TaggedValue::error(&root_message(&err))),
        }
    }
}

fn is_out_of_memory(caught: &Value, raised: bool) -> bool {
    match caught {
        Value::Error(err) => matches!(root_cause(err), LuaError::MemoryError(_)),
        Value::String(s) => !raised && *s.as_bytes() == *LUA_MEMORY_ERROR,
        _ => false,
    }
}
