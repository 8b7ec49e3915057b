/// `scripting/date.rs`: the script-side Date type
///
/// Lua has no native date value, so dates cross the boundary as `Date`
/// userdata holding milliseconds since the Unix epoch. Scripts build them
/// with `Date.now()` / `Date.from_millis(ms)`.
use chrono::{DateTime, SecondsFormat, Utc};
use mlua::{Lua, MetaMethod, Result as LuaResult, UserData, UserDataMethods, Value};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScriptDate {
    pub millis: f64,
}

impl ScriptDate {
    pub fn from_millis(millis: f64) -> Self {
        Self { millis }
    }

    pub fn now() -> Self {
        Self::from_millis(Utc::now().timestamp_millis() as f64)
    }

    /// RFC 3339 in UTC with millisecond precision, or `Invalid Date` when the
    /// value is not a representable instant.
    pub fn to_rfc3339(&self) -> String {
        if !self.millis.is_finite() {
            return "Invalid Date".to_string();
        }
        match DateTime::<Utc>::from_timestamp_millis(self.millis as i64) {
            Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
            None => "Invalid Date".to_string(),
        }
    }
}

fn other_millis(other: &Value) -> Option<f64> {
    match other {
        Value::UserData(ud) => ud.borrow::<ScriptDate>().ok().map(|d| d.millis),
        _ => None,
    }
}

impl UserData for ScriptDate {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("millis", |_, this, ()| Ok(this.millis));
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(this.to_rfc3339()));
        methods.add_meta_method(MetaMethod::Eq, |_, this, other: Value| {
            Ok(other_millis(&other) == Some(this.millis))
        });
        methods.add_meta_method(MetaMethod::Lt, |_, this, other: Value| {
            Ok(other_millis(&other).is_some_and(|ms| this.millis < ms))
        });
        methods.add_meta_method(MetaMethod::Le, |_, this, other: Value| {
            Ok(other_millis(&other).is_some_and(|ms| this.millis <= ms))
        });
    }
}

/// Install the global `Date` table.
pub fn register_date(lua: &Lua) -> LuaResult<()> {
    let tbl = lua.create_table()?;
    tbl.set("now", lua.create_function(|_, ()| Ok(ScriptDate::now()))?)?;
    tbl.set(
        "from_millis",
        lua.create_function(|_, millis: f64| Ok(ScriptDate::from_millis(millis)))?,
    )?;
    lua.globals().set("Date", tbl)?;
    Ok(())
}
