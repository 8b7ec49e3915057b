/// `scripting/registry.rs`: sessions addressed by opaque handles
///
/// `SessionRegistry` is the handle-based surface over `EngineSession`: callers
/// hold a `SessionHandle` (a plain `u32`) instead of the session itself.
/// The map lock is only held to look a session up, so distinct sessions run
/// concurrently while calls into one session serialise on its own lock.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use serde::{Deserialize, Serialize};

use super::session::EngineSession;
use crate::{
    config::EngineConfig,
    error::{EngineError, EngineResult},
    host::HostObjectTable,
    value::TaggedValue,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle(pub u32);

/// Cheap to clone; every clone sees the same sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<u32, Arc<EngineSession>>>>,
    next_handle: Arc<AtomicU32>,
    host: Arc<dyn HostObjectTable>,
}

impl SessionRegistry {
    /// Every session created here resolves managed handles through `host`.
    pub fn new(host: Arc<dyn HostObjectTable>) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_handle: Arc::new(AtomicU32::new(1)),
            host,
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    pub fn create_session(&self, config: EngineConfig) -> EngineResult<SessionHandle> {
        let session = EngineSession::create(config, Arc::clone(&self.host))?;
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        log::debug!("handle {handle} -> {}", session.id());
        self.lock().insert(handle, Arc::new(session));
        Ok(SessionHandle(handle))
    }

    /// Remove a session. It is torn down once the last in-flight call on it
    /// returns. Disposing an unknown or already disposed handle is an error.
    pub fn dispose_session(&self, handle: SessionHandle) -> EngineResult<()> {
        match self.lock().remove(&handle.0) {
            Some(_) => Ok(()),
            None => Err(EngineError::UnknownSession(handle.0)),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Operations ────────────────────────────────────────────────────────

    pub fn run(&self, handle: SessionHandle, source: &[u16]) -> EngineResult<TaggedValue> {
        self.session(handle)?.run(source)
    }

    pub fn set_global(
        &self,
        handle: SessionHandle,
        name: &[u16],
        value: TaggedValue,
    ) -> EngineResult<TaggedValue> {
        self.session(handle)?.set_global(name, value)
    }

    pub fn get_global(&self, handle: SessionHandle, name: &[u16]) -> EngineResult<TaggedValue> {
        self.session(handle)?.get_global(name)
    }

    /// Run on a blocking worker thread (Lua is sync).
    ///
    /// There is no timeout: dropping the returned future abandons the wait,
    /// but the worker keeps the session locked until the script returns.
    pub async fn run_async(
        &self,
        handle: SessionHandle,
        source: Vec<u16>,
    ) -> EngineResult<TaggedValue> {
        let session = self.session(handle)?;
        tokio::task::spawn_blocking(move || session.run(&source))
            .await
            .map_err(|e| EngineError::Worker(format!("script task panicked: {e}")))?
    }

    fn session(&self, handle: SessionHandle) -> EngineResult<Arc<EngineSession>> {
        self.lock()
            .get(&handle.0)
            .cloned()
            .ok_or(EngineError::UnknownSession(handle.0))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Arc<EngineSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
