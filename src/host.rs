//! The host side of managed references.
//!
//! Scripts only ever see a `u32` handle. Whatever the handle names lives in a
//! table owned by the host and is reached through [`HostObjectTable`]; the
//! bridge never caches what it reads, every access re-resolves the handle.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use crate::value::{utf16, TaggedValue};

/// Capability the bridge needs from the host object table.
///
/// Failures are reported as Error-kind values. Calls arrive on the thread that
/// is currently inside the owning session, and must not re-enter that session.
pub trait HostObjectTable: Send + Sync {
    /// Read a named property. A missing object or property is an Error value.
    fn get_property(&self, handle: u32, name: &[u16]) -> TaggedValue;

    /// Assign a named property. Returns Null on success, an Error value
    /// otherwise.
    fn set_property(&self, handle: u32, name: &[u16], value: TaggedValue) -> TaggedValue;

    /// Call the object as a function.
    fn invoke(&self, handle: u32, args: Vec<TaggedValue>) -> TaggedValue {
        let _ = args;
        TaggedValue::error(&format!("managed object {handle} is not callable"))
    }

    /// Property names visible to iteration.
    fn property_names(&self, handle: u32) -> Vec<Vec<u16>> {
        let _ = handle;
        Vec::new()
    }

    /// A script-side proxy for `handle` was collected or its session torn
    /// down. One call per proxy; the object itself stays alive.
    fn release(&self, handle: u32) {
        let _ = handle;
    }
}

/// Host table for sessions that never expose managed objects.
#[derive(Debug, Default)]
pub struct NoHostObjects;

impl HostObjectTable for NoHostObjects {
    fn get_property(&self, handle: u32, _name: &[u16]) -> TaggedValue {
        TaggedValue::error(&format!("no managed object with handle {handle}"))
    }

    fn set_property(&self, handle: u32, _name: &[u16], _value: TaggedValue) -> TaggedValue {
        TaggedValue::error(&format!("no managed object with handle {handle}"))
    }
}

pub type HostFunction = Arc<dyn Fn(Vec<TaggedValue>) -> TaggedValue + Send + Sync>;

#[derive(Default)]
struct HostObject {
    properties: HashMap<Vec<u16>, TaggedValue>,
    call: Option<HostFunction>,
}

/// Arena of host objects addressed by index.
///
/// Handles are never reused, so a stale proxy can only ever resolve to
/// "no such object", never to somebody else's object.
#[derive(Default)]
pub struct ObjectArena {
    slots: Mutex<Vec<Option<HostObject>>>,
    released: AtomicUsize,
}

impl ObjectArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object and return its handle.
    pub fn insert<'a>(&self, properties: impl IntoIterator<Item = (&'a str, TaggedValue)>) -> u32 {
        self.push(HostObject {
            properties: collect_properties(properties),
            call: None,
        })
    }

    /// Store a callable object and return its handle.
    pub fn insert_callable<'a>(
        &self,
        properties: impl IntoIterator<Item = (&'a str, TaggedValue)>,
        call: HostFunction,
    ) -> u32 {
        self.push(HostObject {
            properties: collect_properties(properties),
            call: Some(call),
        })
    }

    /// Drop the object behind `handle`. Returns false if it was already gone.
    pub fn remove(&self, handle: u32) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        match slots.get_mut(handle as usize) {
            Some(slot) => slot.take().is_some(),
            None => false,
        }
    }

    /// Host-side read of a property, bypassing any session.
    pub fn get(&self, handle: u32, name: &str) -> Option<TaggedValue> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .get(handle as usize)
            .and_then(Option::as_ref)
            .and_then(|obj| obj.properties.get(&utf16(name)).cloned())
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many script-side proxies have been released so far.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    fn push(&self, object: HostObject) -> u32 {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = slots.len() as u32;
        slots.push(Some(object));
        handle
    }

    fn with_object<R>(
        &self,
        handle: u32,
        f: impl FnOnce(&mut HostObject) -> R,
    ) -> Result<R, TaggedValue> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        match slots.get_mut(handle as usize).and_then(Option::as_mut) {
            Some(obj) => Ok(f(obj)),
            None => Err(TaggedValue::error(&format!(
                "no managed object with handle {handle}"
            ))),
        }
    }
}

impl HostObjectTable for ObjectArena {
    fn get_property(&self, handle: u32, name: &[u16]) -> TaggedValue {
        let found = self.with_object(handle, |obj| obj.properties.get(name).cloned());
        match found {
            Ok(Some(value)) => value,
            Ok(None) => TaggedValue::error(&format!(
                "managed object {handle} has no property '{}'",
                String::from_utf16_lossy(name)
            )),
            Err(err) => err,
        }
    }

    fn set_property(&self, handle: u32, name: &[u16], value: TaggedValue) -> TaggedValue {
        match self.with_object(handle, |obj| obj.properties.insert(name.to_vec(), value)) {
            Ok(_) => TaggedValue::Null,
            Err(err) => err,
        }
    }

    fn invoke(&self, handle: u32, args: Vec<TaggedValue>) -> TaggedValue {
        // Clone the function out so the arena is unlocked while it runs.
        let call = match self.with_object(handle, |obj| obj.call.clone()) {
            Ok(call) => call,
            Err(err) => return err,
        };
        match call {
            Some(f) => f(args),
            None => TaggedValue::error(&format!("managed object {handle} is not callable")),
        }
    }

    fn property_names(&self, handle: u32) -> Vec<Vec<u16>> {
        let mut names = self
            .with_object(handle, |obj| obj.properties.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        names.sort();
        names
    }

    fn release(&self, handle: u32) {
        log::trace!("managed proxy for handle {handle} released");
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

fn collect_properties<'a>(
    properties: impl IntoIterator<Item = (&'a str, TaggedValue)>,
) -> HashMap<Vec<u16>, TaggedValue> {
    properties
        .into_iter()
        .map(|(name, value)| (utf16(name), value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_sequential_and_never_reused() {
        let arena = ObjectArena::new();
        let a = arena.insert([("x", TaggedValue::Integer(1))]);
        let b = arena.insert([]);
        assert_eq!((a, b), (0, 1));
        assert!(arena.remove(a));
        assert!(!arena.remove(a));
        let c = arena.insert([]);
        assert_eq!(c, 2);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn missing_object_and_property_are_errors() {
        let arena = ObjectArena::new();
        let h = arena.insert([("x", TaggedValue::Integer(42))]);
        assert_eq!(arena.get_property(h, &utf16("x")), TaggedValue::Integer(42));

        let missing = arena.get_property(h, &utf16("y"));
        assert!(missing.is_error());
        assert!(missing.to_string_lossy().unwrap().contains("'y'"));

        assert!(arena.get_property(99, &utf16("x")).is_error());
        assert!(arena.set_property(99, &utf16("x"), TaggedValue::Null).is_error());
    }

    #[test]
    fn set_property_creates_or_overwrites() {
        let arena = ObjectArena::new();
        let h = arena.insert([]);
        assert_eq!(arena.set_property(h, &utf16("name"), "a".into()), TaggedValue::Null);
        assert_eq!(arena.set_property(h, &utf16("name"), "b".into()), TaggedValue::Null);
        assert_eq!(arena.get(h, "name"), Some(TaggedValue::string("b")));
        assert_eq!(arena.property_names(h), vec![utf16("name")]);
    }

    #[test]
    fn invoke_runs_registered_function() {
        let arena = ObjectArena::new();
        let sum: HostFunction = Arc::new(|args: Vec<TaggedValue>| {
            TaggedValue::Number(args.iter().filter_map(TaggedValue::as_f64).sum())
        });
        let h = arena.insert_callable([], sum);
        let plain = arena.insert([]);
        assert_eq!(
            arena.invoke(h, vec![TaggedValue::Integer(2), TaggedValue::Number(0.5)]),
            TaggedValue::Number(2.5)
        );
        assert!(arena.invoke(plain, Vec::new()).is_error());
    }
}
