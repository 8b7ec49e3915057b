/// `scripting/managed.rs`: script-side proxies for host objects
///
/// A `ManagedRef` is the payload of one proxy userdata. All proxies of a
/// session share one metatable, built once by mlua for the type, so the
/// metamethods below hold no per-instance state of their own: they read the
/// handle and owning session out of the payload on every call.
use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use mlua::{
    Error as LuaError, Function, Lua, MetaMethod, MultiValue, Result as LuaResult, UserData,
    UserDataMethods, Value,
};
use serde::Serialize;

use super::convert::Marshal;
use crate::{host::HostObjectTable, value::TaggedValue};

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// What a proxy knows about the session that created it.
pub struct SessionLink {
    pub id: SessionId,
    pub host: Arc<dyn HostObjectTable>,
    pub max_depth: usize,
    live: AtomicUsize,
}

impl SessionLink {
    pub fn new(id: SessionId, host: Arc<dyn HostObjectTable>, max_depth: usize) -> Self {
        Self {
            id,
            host,
            max_depth,
            live: AtomicUsize::new(0),
        }
    }

    /// Proxies created by this session that the engine has not yet collected.
    pub fn live_proxies(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

pub struct ManagedRef {
    handle: u32,
    session: Arc<SessionLink>,
}

impl ManagedRef {
    pub fn new(session: Arc<SessionLink>, handle: u32) -> Self {
        session.live.fetch_add(1, Ordering::SeqCst);
        Self { handle, session }
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    fn get_property(&self, lua: &Lua, key: Value) -> LuaResult<Value> {
        let name = property_name(&key)?;
        let result = self.session.host.get_property(self.handle, &name);
        if let TaggedValue::Error(msg) = &result {
            log::warn!(
                "[{}] get '{}' on managed#{} failed: {}",
                self.session.id,
                String::from_utf16_lossy(&name),
                self.handle,
                String::from_utf16_lossy(msg)
            );
        }
        // An Error result raises inside the script.
        Marshal::new(lua, &self.session).to_native(result)
    }

    fn set_property(&self, lua: &Lua, key: Value, value: Value) -> LuaResult<()> {
        let name = property_name(&key)?;
        let tagged = Marshal::new(lua, &self.session).from_native(&value)?;
        if tagged.is_error() {
            return Err(LuaError::RuntimeError(format!(
                "cannot assign a {} to managed property '{}'",
                value.type_name(),
                String::from_utf16_lossy(&name)
            )));
        }
        match self.session.host.set_property(self.handle, &name, tagged) {
            TaggedValue::Error(msg) => {
                let msg = String::from_utf16_lossy(&msg);
                log::warn!(
                    "[{}] set '{}' on managed#{} failed: {msg}",
                    self.session.id,
                    String::from_utf16_lossy(&name),
                    self.handle
                );
                Err(LuaError::RuntimeError(msg))
            }
            _ => Ok(()),
        }
    }

    fn invoke(&self, lua: &Lua, args: MultiValue) -> LuaResult<Value> {
        let marshal = Marshal::new(lua, &self.session);
        let mut tagged = Vec::with_capacity(args.len());
        for arg in args.iter() {
            tagged.push(marshal.from_native(arg)?);
        }
        marshal.to_native(self.session.host.invoke(self.handle, tagged))
    }

    /// Iterator for `pairs(proxy)`: yields `(name, value)` for every name the
    /// host lists, reading each value through the host at iteration time.
    fn pairs(&self, lua: &Lua) -> LuaResult<(Function, Value, Value)> {
        let names = self.session.host.property_names(self.handle);
        let cursor = AtomicUsize::new(0);
        let session = Arc::clone(&self.session);
        let handle = self.handle;
        let next = lua.create_function(move |lua, _: MultiValue| {
            let Some(name) = names.get(cursor.fetch_add(1, Ordering::SeqCst)) else {
                return Ok((Value::Nil, Value::Nil));
            };
            let key = lua.create_string(String::from_utf16_lossy(name))?;
            let value = session.host.get_property(handle, name);
            let value = Marshal::new(lua, &session).to_native(value)?;
            Ok((Value::String(key), value))
        })?;
        Ok((next, Value::Nil, Value::Nil))
    }
}

impl Drop for ManagedRef {
    fn drop(&mut self) {
        self.session.live.fetch_sub(1, Ordering::SeqCst);
        self.session.host.release(self.handle);
    }
}

impl UserData for ManagedRef {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: Value| {
            this.get_property(lua, key)
        });
        methods.add_meta_method(MetaMethod::NewIndex, |lua, this, (key, value): (Value, Value)| {
            this.set_property(lua, key, value)
        });
        methods.add_meta_method(MetaMethod::Call, |lua, this, args: MultiValue| {
            this.invoke(lua, args)
        });
        methods.add_meta_method(MetaMethod::Pairs, |lua, this, ()| this.pairs(lua));
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!("managed#{}", this.handle))
        });
        methods.add_meta_method(MetaMethod::Eq, |_, this, other: Value| {
            Ok(match other {
                Value::UserData(ud) => ud
                    .borrow::<ManagedRef>()
                    .is_ok_and(|r| r.handle == this.handle),
                _ => false,
            })
        });
    }
}

fn property_name(key: &Value) -> LuaResult<Vec<u16>> {
    match key {
        Value::String(s) => Ok(s.to_string_lossy().encode_utf16().collect()),
        other => Err(LuaError::RuntimeError(format!(
            "managed properties are named by strings, not {}",
            other.type_name()
        ))),
    }
}
