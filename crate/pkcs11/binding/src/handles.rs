//! Generational handles for slots, sessions and objects.
//!
//! The driver hands out bare integers which it may recycle at will. Callers
//! receive instead a `{index, generation}` pair: releasing an index bumps its
//! generation, so a handle kept past the end of its scope never resolves
//! again, even once the index (or the native id) is reused.

use std::{
    collections::HashMap,
    fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
    sync::{Arc, Mutex},
};

use pkcs11_sys::{CK_OBJECT_HANDLE, CK_SESSION_HANDLE, CK_SLOT_ID};
use tracing::debug;

use crate::{
    PError, PResult,
    session::{LoginState, SessionState},
};

pub mod kind {
    /// Marker for slot handles
    #[derive(Debug)]
    pub enum Slot {}
    /// Marker for session handles
    #[derive(Debug)]
    pub enum Session {}
    /// Marker for object handles
    #[derive(Debug)]
    pub enum Object {}
}

pub trait HandleKind {
    const NAME: &'static str;
}

impl HandleKind for kind::Slot {
    const NAME: &'static str = "slot";
}

impl HandleKind for kind::Session {
    const NAME: &'static str = "session";
}

impl HandleKind for kind::Object {
    const NAME: &'static str = "object";
}

pub struct Handle<K> {
    index: u32,
    generation: u32,
    _kind: PhantomData<fn() -> K>,
}

pub type SlotHandle = Handle<kind::Slot>;
pub type SessionHandle = Handle<kind::Session>;
pub type ObjectHandle = Handle<kind::Object>;

impl<K> Handle<K> {
    const fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _kind: PhantomData,
        }
    }

    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

// Manual impls: derives would require `K` itself to be Clone, Eq...
impl<K> Clone for Handle<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Handle<K> {}

impl<K> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<K> Eq for Handle<K> {}

impl<K> Hash for Handle<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<K: HandleKind> fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}.{}", K::NAME, self.index, self.generation)
    }
}

impl<K: HandleKind> fmt::Display for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

fn stale<K: HandleKind>(handle: Handle<K>) -> PError {
    PError::InvalidHandle {
        context: format!("{handle} is unknown or no longer valid"),
        rv: None,
    }
}

struct Entry<N, T> {
    generation: u32,
    live: Option<(N, T)>,
}

/// An arena of live handles of one kind, mapping each to its native id `N`
/// and a payload `T`.
pub(crate) struct Table<K, N, T> {
    entries: Vec<Entry<N, T>>,
    free: Vec<u32>,
    by_native: HashMap<N, u32>,
    _kind: PhantomData<fn() -> K>,
}

impl<K, N, T> Table<K, N, T>
where
    K: HandleKind,
    N: Copy + Eq + Hash,
{
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            by_native: HashMap::new(),
            _kind: PhantomData,
        }
    }

    /// Issue a handle for `native`. A native id which is already live keeps
    /// its handle (and its payload): `value` is then discarded.
    pub(crate) fn issue(&mut self, native: N, value: T) -> PResult<Handle<K>> {
        self.issue_with(native, |_| value)
    }

    /// Like [`Table::issue`], building the payload from the new handle.
    pub(crate) fn issue_with(
        &mut self,
        native: N,
        make: impl FnOnce(Handle<K>) -> T,
    ) -> PResult<Handle<K>> {
        if let Some(&index) = self.by_native.get(&native) {
            let generation = self.entries[index as usize].generation;
            return Ok(Handle::new(index, generation));
        }
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(self.entries.len())?;
                self.entries.push(Entry {
                    generation: 0,
                    live: None,
                });
                index
            }
        };
        let entry = &mut self.entries[index as usize];
        let handle = Handle::new(index, entry.generation);
        entry.live = Some((native, make(handle)));
        self.by_native.insert(native, index);
        Ok(handle)
    }

    fn entry(&self, handle: Handle<K>) -> Option<&(N, T)> {
        self.entries
            .get(handle.index as usize)
            .filter(|e| e.generation == handle.generation)
            .and_then(|e| e.live.as_ref())
    }

    pub(crate) fn get(&self, handle: Handle<K>) -> PResult<(N, &T)> {
        self.entry(handle)
            .map(|(native, value)| (*native, value))
            .ok_or_else(|| stale(handle))
    }

    pub(crate) fn resolve(&self, handle: Handle<K>) -> PResult<N> {
        self.get(handle).map(|(native, _)| native)
    }

    pub(crate) fn release(&mut self, handle: Handle<K>) -> PResult<(N, T)> {
        let entry = self
            .entries
            .get_mut(handle.index as usize)
            .filter(|e| e.generation == handle.generation && e.live.is_some())
            .ok_or_else(|| stale(handle))?;
        let (native, value) = entry.live.take().ok_or_else(|| stale(handle))?;
        entry.generation = entry.generation.wrapping_add(1);
        self.by_native.remove(&native);
        self.free.push(handle.index);
        Ok((native, value))
    }

    /// Release every live handle whose payload matches `predicate`.
    pub(crate) fn release_where(&mut self, predicate: impl Fn(&T) -> bool) -> Vec<(N, T)> {
        let mut released = Vec::new();
        for (index, entry) in (0_u32..).zip(self.entries.iter_mut()) {
            if !entry.live.as_ref().is_some_and(|(_, value)| predicate(value)) {
                continue;
            }
            if let Some((native, value)) = entry.live.take() {
                entry.generation = entry.generation.wrapping_add(1);
                self.by_native.remove(&native);
                self.free.push(index);
                released.push((native, value));
            }
        }
        released
    }

    pub(crate) fn clear(&mut self) -> Vec<(N, T)> {
        self.release_where(|_| true)
    }

    /// Payloads of the live handles
    pub(crate) fn values(&self) -> impl Iterator<Item = &T> {
        self.entries
            .iter()
            .filter_map(|e| e.live.as_ref().map(|(_, value)| value))
    }
}

/// Per-session registry entry: the slot it was opened on and its state,
/// locked independently of the registry.
pub(crate) struct SessionEntry {
    pub(crate) handle: SessionHandle,
    pub(crate) slot: SlotHandle,
    pub(crate) state: Arc<Mutex<SessionState>>,
}

/// Lifetime scope of an object handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObjectScope {
    /// Released when the session closes
    Session(SessionHandle),
    /// Released when the module is finalized
    Token,
}

pub(crate) struct HandleRegistry {
    pub(crate) slots: Table<kind::Slot, CK_SLOT_ID, ()>,
    pub(crate) sessions: Table<kind::Session, CK_SESSION_HANDLE, SessionEntry>,
    /// Native object ids are only unique within a token, hence the slot in
    /// the key.
    pub(crate) objects: Table<kind::Object, (SlotHandle, CK_OBJECT_HANDLE), ObjectScope>,
    /// Login is token wide: every session on a slot shares it. Absent means
    /// public.
    pub(crate) logins: HashMap<SlotHandle, LoginState>,
}

impl HandleRegistry {
    pub(crate) fn new() -> Self {
        Self {
            slots: Table::new(),
            sessions: Table::new(),
            objects: Table::new(),
            logins: HashMap::new(),
        }
    }

    pub(crate) fn login_state(&self, slot: SlotHandle) -> LoginState {
        self.logins.get(&slot).copied().unwrap_or_default()
    }

    /// Release a session handle and every object handle scoped to it. The
    /// token is logged out with its last session.
    pub(crate) fn close_session(&mut self, session: SessionHandle) -> PResult<SessionEntry> {
        let (_, entry) = self.sessions.release(session)?;
        let objects = self
            .objects
            .release_where(|scope| *scope == ObjectScope::Session(session));
        if !self.sessions.values().any(|other| other.slot == entry.slot) {
            self.logins.remove(&entry.slot);
        }
        debug!(
            "Released {session} and {} session object handle(s)",
            objects.len()
        );
        Ok(entry)
    }

    /// Release everything; returns the session entries so that their states
    /// can be marked closed.
    pub(crate) fn clear(&mut self) -> Vec<SessionEntry> {
        let objects = self.objects.clear().len();
        let slots = self.slots.clear().len();
        self.logins.clear();
        let sessions: Vec<SessionEntry> = self
            .sessions
            .clear()
            .into_iter()
            .map(|(_, entry)| entry)
            .collect();
        debug!(
            "Invalidated {slots} slot, {} session and {objects} object handle(s)",
            sessions.len()
        );
        sessions
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{HandleRegistry, ObjectScope, SlotHandle, Table, kind};
    use crate::PError;

    #[test]
    fn released_handles_never_resolve_again() {
        let mut table: Table<kind::Object, u64, ()> = Table::new();
        let first = table.issue(42, ()).unwrap();
        assert_eq!(table.resolve(first).unwrap(), 42);
        table.release(first).unwrap();
        assert!(matches!(
            table.resolve(first),
            Err(PError::InvalidHandle { rv: None, .. })
        ));

        // the index is reused, with a new generation, even for the same native id
        let second = table.issue(42, ()).unwrap();
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());
        assert_ne!(first, second);
        assert!(table.resolve(first).is_err());
        assert_eq!(table.resolve(second).unwrap(), 42);
        assert!(table.release(first).is_err());
    }

    #[test]
    fn live_native_ids_keep_their_handle() {
        let mut table: Table<kind::Slot, u64, &str> = Table::new();
        let a = table.issue(1, "first").unwrap();
        let b = table.issue(1, "second").unwrap();
        assert_eq!(a, b);
        assert_eq!(table.get(a).unwrap().1, &"first");
        let c = table.issue(2, "other").unwrap();
        assert_ne!(a, c);
        assert_eq!(table.by_native.len(), 2);

        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn release_where_and_clear() {
        let mut table: Table<kind::Object, u64, bool> = Table::new();
        let keep = table.issue(1, true).unwrap();
        let drop1 = table.issue(2, false).unwrap();
        let drop2 = table.issue(3, false).unwrap();
        assert_eq!(table.release_where(|keep| !keep).len(), 2);
        assert!(table.resolve(keep).is_ok());
        assert!(table.resolve(drop1).is_err());
        assert!(table.resolve(drop2).is_err());
        assert_eq!(table.clear().len(), 1);
        assert!(table.resolve(keep).is_err());
        assert!(table.by_native.is_empty());
    }

    #[test]
    fn closing_a_session_releases_its_objects_only() {
        let mut registry = HandleRegistry::new();
        let slot: SlotHandle = registry.slots.issue(1, ()).unwrap();
        let object_a = registry
            .objects
            .issue((slot, 10), ObjectScope::Token)
            .unwrap();
        let mut tables: Table<kind::Session, u64, ()> = Table::new();
        let session = tables.issue(7, ()).unwrap();
        let object_b = registry
            .objects
            .issue((slot, 11), ObjectScope::Session(session))
            .unwrap();

        let released = registry
            .objects
            .release_where(|scope| *scope == ObjectScope::Session(session));
        assert_eq!(released.len(), 1);
        assert!(registry.objects.resolve(object_a).is_ok());
        assert!(registry.objects.resolve(object_b).is_err());

        assert!(registry.clear().is_empty());
        assert!(registry.objects.resolve(object_a).is_err());
        assert!(registry.slots.resolve(slot).is_err());
    }
}
