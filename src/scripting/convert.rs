/// `scripting/convert.rs`: TaggedValue <-> Lua value conversion
///
/// `Marshal` borrows the Lua state for the duration of one boundary crossing;
/// native values it produces must not outlive that borrow.
use std::sync::Arc;

use mlua::{Error as LuaError, Function, Lua, Result as LuaResult, Table, Value};

use super::{
    date::ScriptDate,
    managed::{ManagedRef, SessionLink},
};
use crate::value::TaggedValue;

/// Registry slot holding the base library `tostring`, captured at session
/// creation so scripts cannot swap it out.
pub(crate) const TOSTRING_KEY: &str = "script_bridge.tostring";

pub struct Marshal<'a> {
    lua: &'a Lua,
    session: &'a Arc<SessionLink>,
}

impl<'a> Marshal<'a> {
    pub fn new(lua: &'a Lua, session: &'a Arc<SessionLink>) -> Self {
        Self { lua, session }
    }

    /// Convert a tagged value into a native one, consuming it.
    ///
    /// Error values cannot be stored as data: converting one raises a script
    /// error carrying the message.
    pub fn to_native(&self, value: TaggedValue) -> LuaResult<Value> {
        self.to_native_at(value, 0, false)
    }

    fn to_native_at(&self, value: TaggedValue, depth: usize, in_array: bool) -> LuaResult<Value> {
        Ok(match value {
            // nil cannot sit inside a sequence without breaking its length.
            TaggedValue::Null if in_array => Value::NULL,
            TaggedValue::Null => Value::Nil,
            TaggedValue::Boolean(b) => Value::Boolean(b),
            TaggedValue::Integer(i) => Value::Integer(i64::from(i)),
            TaggedValue::Number(n) => Value::Number(n),
            TaggedValue::String(units) => {
                Value::String(self.lua.create_string(String::from_utf16_lossy(&units))?)
            }
            TaggedValue::Date(millis) => {
                Value::UserData(self.lua.create_userdata(ScriptDate::from_millis(millis))?)
            }
            TaggedValue::Array(items) => {
                self.check_depth(depth)?;
                let table = self.lua.create_table_with_capacity(items.len(), 0)?;
                for (i, item) in items.into_iter().enumerate() {
                    table.raw_set(i + 1, self.to_native_at(item, depth + 1, true)?)?;
                }
                Value::Table(table)
            }
            TaggedValue::Managed(handle) => {
                let proxy = ManagedRef::new(Arc::clone(self.session), handle);
                Value::UserData(self.lua.create_userdata(proxy)?)
            }
            TaggedValue::Error(msg) => {
                return Err(LuaError::RuntimeError(String::from_utf16_lossy(&msg)));
            }
        })
    }

    /// Classify a native value and convert it.
    ///
    /// Never fails for script-domain reasons: unsupported values and runaway
    /// nesting come back as Error values. An `Err` means the engine itself
    /// failed (allocation).
    pub fn from_native(&self, value: &Value) -> LuaResult<TaggedValue> {
        match self.from_native_at(value, 0) {
            Err(LuaError::RuntimeError(msg)) => Ok(TaggedValue::error(&msg)),
            other => other,
        }
    }

    fn from_native_at(&self, value: &Value, depth: usize) -> LuaResult<TaggedValue> {
        // Integer must be tested before Number: every integer is also a number.
        Ok(match value {
            Value::Nil => TaggedValue::Null,
            Value::LightUserData(ud) if ud.0.is_null() => TaggedValue::Null,
            Value::Boolean(b) => TaggedValue::Boolean(*b),
            Value::Integer(i) => match i32::try_from(*i) {
                Ok(i) => TaggedValue::Integer(i),
                Err(_) => TaggedValue::Number(*i as f64),
            },
            Value::Number(n) => match as_int32(*n) {
                Some(i) => TaggedValue::Integer(i),
                None => TaggedValue::Number(*n),
            },
            Value::String(_) => TaggedValue::String(string_from_native(self.lua, value)?),
            Value::UserData(ud) if ud.is::<ScriptDate>() => {
                TaggedValue::Date(ud.borrow::<ScriptDate>()?.millis)
            }
            Value::Table(table) => match self.array_from_table(table, depth)? {
                Some(items) => TaggedValue::Array(items),
                None => unsupported(value),
            },
            Value::UserData(ud) if ud.is::<ManagedRef>() => {
                TaggedValue::Managed(ud.borrow::<ManagedRef>()?.handle())
            }
            other => unsupported(other),
        })
    }

    /// Elements `1..=#t` of a table whose keys all fall in that range, or
    /// `None` for any other table. Holes read as Null.
    fn array_from_table(&self, table: &Table, depth: usize) -> LuaResult<Option<Vec<TaggedValue>>> {
        self.check_depth(depth)?;
        let len = table.raw_len();
        for pair in table.pairs::<Value, Value>() {
            let (key, _) = pair?;
            if !matches!(key, Value::Integer(k) if k >= 1 && (k as usize) <= len) {
                return Ok(None);
            }
        }

        let mut items = Vec::with_capacity(len);
        for i in 1..=len {
            let item: Value = table.raw_get(i)?;
            items.push(self.from_native_at(&item, depth + 1)?);
        }
        Ok(Some(items))
    }

    fn check_depth(&self, depth: usize) -> LuaResult<()> {
        if depth >= self.session.max_depth {
            return Err(LuaError::RuntimeError(format!(
                "value nesting exceeds {} levels",
                self.session.max_depth
            )));
        }
        Ok(())
    }
}

/// Shared string routine for plain strings and caught exceptions.
///
/// Lua strings are decoded as UTF-8 (invalid sequences become U+FFFD);
/// anything else goes through `tostring`, so `__tostring` is honored.
/// Errors raised by Rust callbacks are reduced to their root cause message.
pub fn string_from_native(lua: &Lua, value: &Value) -> LuaResult<Vec<u16>> {
    let text = match value {
        Value::String(s) => s.to_string_lossy(),
        Value::Error(err) => root_message(err),
        other => {
            let tostring: Function = lua.named_registry_value(TOSTRING_KEY)?;
            tostring.call::<mlua::String>(other.clone())?.to_string_lossy()
        }
    };
    Ok(text.encode_utf16().collect())
}

/// Turn a caught exception value into an Error-kind tagged value.
///
/// If the value cannot be turned into text (its `__tostring` raises or
/// returns a non-string), that failure's message is reported instead. Only
/// an allocation failure is returned as `Err`.
pub fn error_from_exception(lua: &Lua, caught: &Value) -> LuaResult<TaggedValue> {
    match string_from_native(lua, caught) {
        Ok(text) => Ok(TaggedValue::Error(text)),
        Err(err) if matches!(root_cause(&err), LuaError::MemoryError(_)) => Err(err),
        Err(err) => {
            log::debug!("{} exception has no usable text: {err}", caught.type_name());
            Ok(TaggedValue::error(&root_message(&err)))
        }
    }
}

/// Innermost error behind any callback wrapping.
pub fn root_cause(err: &LuaError) -> &LuaError {
    match err {
        LuaError::CallbackError { cause, .. } => root_cause(cause),
        other => other,
    }
}

/// Message of the innermost error, without any traceback mlua appended.
pub fn root_message(err: &LuaError) -> String {
    match root_cause(err) {
        LuaError::RuntimeError(msg) => match msg.split_once("\nstack traceback:") {
            Some((head, _)) => head.to_string(),
            None => msg.clone(),
        },
        LuaError::SyntaxError { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

/// `Some` when `n` is exactly a signed 32-bit integer. Negative zero is not.
fn as_int32(n: f64) -> Option<i32> {
    if n.fract() != 0.0 || n < f64::from(i32::MIN) || n > f64::from(i32::MAX) {
        return None;
    }
    if n == 0.0 && n.is_sign_negative() {
        return None;
    }
    Some(n as i32)
}

fn unsupported(value: &Value) -> TaggedValue {
    log::debug!("cannot marshal a {} value", value.type_name());
    TaggedValue::Error(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        host::NoHostObjects,
        scripting::{
            date::register_date,
            managed::SessionId,
            sandbox::{create_sandboxed_vm, TrustLevel},
        },
        value::utf16,
    };

    fn setup(max_depth: usize) -> (Lua, Arc<SessionLink>) {
        let lua = create_sandboxed_vm(&TrustLevel::Basic).unwrap();
        register_date(&lua).unwrap();
        let tostring: Function = lua.globals().get("tostring").unwrap();
        lua.set_named_registry_value(TOSTRING_KEY, tostring).unwrap();
        let link = Arc::new(SessionLink::new(SessionId(0), Arc::new(NoHostObjects), max_depth));
        (lua, link)
    }

    fn eval(lua: &Lua, src: &str) -> Value {
        lua.load(src).eval().unwrap()
    }

    #[test]
    fn int32_boundaries() {
        assert_eq!(as_int32(2147483647.0), Some(i32::MAX));
        assert_eq!(as_int32(-2147483648.0), Some(i32::MIN));
        assert_eq!(as_int32(2147483648.0), None);
        assert_eq!(as_int32(1.5), None);
        assert_eq!(as_int32(-0.0), None);
        assert_eq!(as_int32(f64::NAN), None);
        assert_eq!(as_int32(f64::INFINITY), None);
    }

    #[test]
    fn classifies_scalars_in_order() {
        let (lua, link) = setup(8);
        let m = Marshal::new(&lua, &link);
        let cases = [
            ("return nil", TaggedValue::Null),
            ("return true", TaggedValue::Boolean(true)),
            ("return 2147483647", TaggedValue::Integer(i32::MAX)),
            ("return 2147483648", TaggedValue::Number(2147483648.0)),
            ("return 1.5", TaggedValue::Number(1.5)),
            ("return 4.0", TaggedValue::Integer(4)),
            ("return 'hi'", TaggedValue::string("hi")),
            ("return Date.from_millis(86400000)", TaggedValue::Date(86_400_000.0)),
        ];
        for (src, expected) in cases {
            assert_eq!(m.from_native(&eval(&lua, src)).unwrap(), expected, "{src}");
        }
    }

    #[test]
    fn strings_keep_embedded_nul_and_non_ascii() {
        let (lua, link) = setup(8);
        let m = Marshal::new(&lua, &link);
        let v = m.from_native(&eval(&lua, r#"return "a\0b€""#)).unwrap();
        assert_eq!(v, TaggedValue::String(vec![0x61, 0, 0x62, 0x20ac]));
        assert_eq!(v.len(), 4);
    }

    #[test]
    fn sequences_become_arrays() {
        let (lua, link) = setup(8);
        let m = Marshal::new(&lua, &link);
        let v = m.from_native(&eval(&lua, "return { 1, 'two', { 3.5 } }")).unwrap();
        assert_eq!(
            v,
            TaggedValue::Array(vec![
                TaggedValue::Integer(1),
                TaggedValue::string("two"),
                TaggedValue::Array(vec![TaggedValue::Number(3.5)]),
            ])
        );
        assert_eq!(m.from_native(&eval(&lua, "return {}")).unwrap(), TaggedValue::Array(vec![]));
    }

    #[test]
    fn unsupported_values_are_empty_errors() {
        let (lua, link) = setup(8);
        let m = Marshal::new(&lua, &link);
        let sources = [
            "return print",
            "return { a = 1 }",
            "return { 1, 2, x = 3 }",
            "return coroutine.create(print)",
        ];
        for src in sources {
            let v = m.from_native(&eval(&lua, src)).unwrap();
            assert!(v.is_error(), "{src}");
            assert_eq!(v.len(), 0, "{src}");
        }
    }

    #[test]
    fn cyclic_tables_hit_depth_limit() {
        let (lua, link) = setup(4);
        let m = Marshal::new(&lua, &link);
        let v = m.from_native(&eval(&lua, "local t = {}; t[1] = t; return t")).unwrap();
        assert_eq!(v, TaggedValue::error("value nesting exceeds 4 levels"));
    }

    #[test]
    fn arrays_round_trip_with_order_and_nulls() {
        let (lua, link) = setup(8);
        let m = Marshal::new(&lua, &link);
        let sample = TaggedValue::Array(vec![
            TaggedValue::Integer(3),
            TaggedValue::Null,
            TaggedValue::string("x"),
            TaggedValue::Array(vec![]),
            TaggedValue::Date(5.0),
        ]);
        let native = m.to_native(sample.clone()).unwrap();
        match &native {
            Value::Table(t) => assert_eq!(t.raw_len(), 5),
            other => panic!("expected table, got {}", other.type_name()),
        }
        assert_eq!(m.from_native(&native).unwrap(), sample);
    }

    #[test]
    fn error_values_raise() {
        let (lua, link) = setup(8);
        let m = Marshal::new(&lua, &link);
        let err = m.to_native(TaggedValue::error("nope")).unwrap_err();
        assert_eq!(root_message(&err), "nope");
    }

    #[test]
    fn managed_handles_round_trip_and_count() {
        let (lua, link) = setup(8);
        let m = Marshal::new(&lua, &link);
        let native = m.to_native(TaggedValue::Managed(7)).unwrap();
        assert_eq!(link.live_proxies(), 1);
        assert_eq!(m.from_native(&native).unwrap(), TaggedValue::Managed(7));
        drop(native);
        lua.gc_collect().unwrap();
        assert_eq!(link.live_proxies(), 0);
    }

    #[test]
    fn exceptions_use_tostring() {
        let (lua, _link) = setup(8);
        let caught = eval(&lua, "return 42");
        assert_eq!(error_from_exception(&lua, &caught).unwrap(), TaggedValue::Error(utf16("42")));
        let wrapped = Value::Error(Box::new(LuaError::CallbackError {
            traceback: String::new(),
            cause: Arc::new(LuaError::RuntimeError("inner".into())),
        }));
        assert_eq!(error_from_exception(&lua, &wrapped).unwrap(), TaggedValue::error("inner"));
    }

    #[test]
    fn exceptions_with_broken_tostring_still_become_errors() {
        let (lua, _link) = setup(8);
        let raising = eval(
            &lua,
            "return setmetatable({}, { __tostring = function() error('inner', 0) end })",
        );
        assert_eq!(error_from_exception(&lua, &raising).unwrap(), TaggedValue::error("inner"));

        let non_string = eval(
            &lua,
            "return setmetatable({}, { __tostring = function() return {} end })",
        );
        let err = error_from_exception(&lua, &non_string).unwrap();
        assert!(err.is_error());
        assert!(!err.to_string_lossy().unwrap().contains("stack traceback"));
    }

    #[test]
    fn sequences_with_holes_carry_null() {
        let (lua, link) = setup(8);
        let m = Marshal::new(&lua, &link);
        let v = m.from_native(&eval(&lua, "return { 1, nil, 3 }")).unwrap();
        assert_eq!(
            v,
            TaggedValue::Array(vec![
                TaggedValue::Integer(1),
                TaggedValue::Null,
                TaggedValue::Integer(3),
            ])
        );
        // Keys outside 1..=#t still make the table unsupported.
        let v = m.from_native(&eval(&lua, "return { 1, 2, [10] = 3 }")).unwrap();
        assert_eq!(v, TaggedValue::Error(vec![]));
    }
}
