//! The [`Module`]: one loaded driver, its lifecycle and the handles issued
//! under it.

use std::{
    ffi::OsStr,
    ptr,
    sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use pkcs11_sys::{CK_C_INITIALIZE_ARGS, CK_INFO, CK_OBJECT_HANDLE, CK_SLOT_ID, CKF_OS_LOCKING_OK};
use tracing::{debug, warn};

use crate::{
    ObjectHandle, PError, PResult, SessionHandle, SlotHandle,
    config::Pkcs11Config,
    handles::{HandleRegistry, ObjectScope},
    info::Info,
    loader::{FunctionList, Pkcs11Lib},
    session::SessionState,
};

/// Options passed to `C_Initialize`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitializeOptions {
    /// Let the driver use the native OS locking primitives
    pub os_locking: bool,
}

impl Default for InitializeOptions {
    fn default() -> Self {
        Self { os_locking: true }
    }
}

pub(crate) struct ModuleState {
    pub(crate) initialized: bool,
    pub(crate) registry: HandleRegistry,
}

/// A PKCS#11 driver and everything opened through it.
///
/// Slots, sessions and objects are designated by generational handles which
/// are all invalidated by [`Module::finalize`]. Calls on different sessions
/// run concurrently; calls on the same session are serialized.
pub struct Module {
    pub(crate) functions: Arc<dyn FunctionList>,
    state: RwLock<ModuleState>,
}

impl Module {
    /// Load the driver library at `path`; the module still has to be
    /// initialized.
    pub fn load<P>(path: P) -> PResult<Self>
    where
        P: AsRef<OsStr>,
    {
        Ok(Self::with_function_list(Arc::new(Pkcs11Lib::load(path)?)))
    }

    /// Bind a module to any function table implementation.
    pub fn with_function_list(functions: Arc<dyn FunctionList>) -> Self {
        Self {
            functions,
            state: RwLock::new(ModuleState {
                initialized: false,
                registry: HandleRegistry::new(),
            }),
        }
    }

    /// Load and initialize the driver described by `config`.
    pub fn from_config(config: &Pkcs11Config) -> PResult<Self> {
        let module = Self::load(&config.library_path)?;
        module.initialize(&config.initialize_options())?;
        Ok(module)
    }

    pub fn initialize(&self, options: &InitializeOptions) -> PResult<()> {
        let mut state = self.write_state()?;
        if state.initialized {
            return Err(PError::AlreadyInitialized);
        }
        let mut init_args = CK_C_INITIALIZE_ARGS {
            CreateMutex: None,
            DestroyMutex: None,
            LockMutex: None,
            UnlockMutex: None,
            flags: if options.os_locking {
                CKF_OS_LOCKING_OK
            } else {
                0
            },
            pReserved: ptr::null_mut(),
        };
        p11_call!(
            self.functions,
            "Failed initializing the PKCS#11 library",
            C_Initialize,
            (&raw mut init_args).cast::<std::ffi::c_void>()
        )?;
        state.initialized = true;
        debug!("PKCS#11 library initialized (OS locking: {})", options.os_locking);
        Ok(())
    }

    /// Finalize the driver; every slot, session and object handle issued so
    /// far is invalidated.
    pub fn finalize(&self) -> PResult<()> {
        let sessions = {
            let mut state = self.write_state()?;
            if !state.initialized {
                return Err(PError::NotInitialized);
            }
            p11_call!(
                self.functions,
                "Failed to finalize the PKCS#11 library",
                C_Finalize,
                ptr::null_mut()
            )?;
            state.initialized = false;
            state.registry.clear()
        };
        // registry lock released: sessions are locked before the registry
        for entry in sessions {
            match entry.state.lock() {
                Ok(mut session) => session.mark_closed(),
                Err(e) => warn!("Session state poisoned during finalize: {e}"),
            }
        }
        debug!("PKCS#11 library finalized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.read_state().is_ok_and(|state| state.initialized)
    }

    pub fn get_info(&self) -> PResult<Info> {
        self.ensure_initialized()?;
        let mut info = CK_INFO::default();
        p11_call!(
            self.functions,
            "Failed getting the library info",
            C_GetInfo,
            &raw mut info
        )?;
        Ok(info.into())
    }

    pub(crate) fn read_state(&self) -> PResult<RwLockReadGuard<'_, ModuleState>> {
        self.state
            .read()
            .map_err(|e| PError::Default(format!("Failed to acquire lock on module state: {e}")))
    }

    pub(crate) fn write_state(&self) -> PResult<RwLockWriteGuard<'_, ModuleState>> {
        self.state
            .write()
            .map_err(|e| PError::Default(format!("Failed to acquire lock on module state: {e}")))
    }

    /// Read access to an initialized module's state
    pub(crate) fn initialized_state(&self) -> PResult<RwLockReadGuard<'_, ModuleState>> {
        let state = self.read_state()?;
        if state.initialized {
            Ok(state)
        } else {
            Err(PError::NotInitialized)
        }
    }

    pub(crate) fn initialized_state_mut(&self) -> PResult<RwLockWriteGuard<'_, ModuleState>> {
        let state = self.write_state()?;
        if state.initialized {
            Ok(state)
        } else {
            Err(PError::NotInitialized)
        }
    }

    fn ensure_initialized(&self) -> PResult<()> {
        self.initialized_state().map(|_| ())
    }

    /// Run `f` on the locked state of `session`. The lock is held for the
    /// whole native call, which serializes calls on the same session.
    pub(crate) fn with_session<R>(
        &self,
        session: SessionHandle,
        f: impl FnOnce(&mut SessionState) -> PResult<R>,
    ) -> PResult<R> {
        let state = {
            let module = self.initialized_state()?;
            let (_, entry) = module.registry.sessions.get(session)?;
            Arc::clone(&entry.state)
        };
        let mut guard = lock_session(&state)?;
        if guard.closed {
            return Err(PError::InvalidHandle {
                context: format!("{session} is closed"),
                rv: None,
            });
        }
        f(&mut guard)
    }

    /// Native id of `object`, which must live on the session's token.
    pub(crate) fn resolve_object(
        &self,
        session: &SessionState,
        object: ObjectHandle,
    ) -> PResult<CK_OBJECT_HANDLE> {
        let module = self.initialized_state()?;
        let (slot, native) = module.registry.objects.resolve(object)?;
        if slot != session.slot {
            return Err(PError::InvalidHandle {
                context: format!("{object} belongs to another token than {}", session.handle),
                rv: None,
            });
        }
        Ok(native)
    }

    pub(crate) fn issue_object(
        &self,
        session: &SessionState,
        native: CK_OBJECT_HANDLE,
        token_object: bool,
    ) -> PResult<ObjectHandle> {
        let scope = if token_object {
            ObjectScope::Token
        } else {
            ObjectScope::Session(session.handle)
        };
        let mut module = self.initialized_state_mut()?;
        module.registry.objects.issue((session.slot, native), scope)
    }

    pub(crate) fn release_object(&self, object: ObjectHandle) -> PResult<()> {
        let mut module = self.initialized_state_mut()?;
        module.registry.objects.release(object).map(|_| ())
    }

    pub(crate) fn resolve_slot(&self, slot: SlotHandle) -> PResult<CK_SLOT_ID> {
        self.initialized_state()?.registry.slots.resolve(slot)
    }
}

pub(crate) fn lock_session(
    state: &Mutex<SessionState>,
) -> PResult<MutexGuard<'_, SessionState>> {
    state
        .lock()
        .map_err(|e| PError::Default(format!("Failed to acquire lock on session state: {e}")))
}

impl Drop for Module {
    fn drop(&mut self) {
        if self.is_initialized() {
            if let Err(e) = self.finalize() {
                warn!("Failed to finalize the PKCS#11 library on drop: {e}");
            }
        }
    }
}
