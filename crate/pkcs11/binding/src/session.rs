use std::sync::{Arc, Mutex};

use pkcs11_sys::{
    CK_FLAGS, CK_SESSION_HANDLE, CK_SESSION_INFO, CK_ULONG, CK_USER_TYPE, CKF_SERIAL_SESSION,
    CKU_CONTEXT_SPECIFIC, CKU_SO, CKU_USER,
};
use tracing::debug;
use zeroize::Zeroizing;

use crate::{
    Module, PError, PResult, SessionHandle, SlotHandle,
    handles::{ObjectScope, SessionEntry},
    info::SessionInfo,
    module::lock_session,
    operation::OperationTable,
};

/// Who is logged in on a token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoginState {
    #[default]
    Public,
    User,
    SecurityOfficer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserType {
    SecurityOfficer,
    User,
    /// Re-authentication for a key with `CKA_ALWAYS_AUTHENTICATE`
    ContextSpecific,
}

impl From<UserType> for CK_USER_TYPE {
    fn from(user_type: UserType) -> Self {
        match user_type {
            UserType::SecurityOfficer => CKU_SO,
            UserType::User => CKU_USER,
            UserType::ContextSpecific => CKU_CONTEXT_SPECIFIC,
        }
    }
}

/// Mutable state of one open session, behind its own lock.
#[derive(Debug)]
pub(crate) struct SessionState {
    pub(crate) handle: SessionHandle,
    pub(crate) native: CK_SESSION_HANDLE,
    pub(crate) slot: SlotHandle,
    pub(crate) operations: OperationTable,
    pub(crate) find_active: bool,
    pub(crate) closed: bool,
}

impl SessionState {
    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
        self.find_active = false;
        self.operations.reset_all();
    }
}

impl Module {
    /// Open a session on `slot`. `CKF_SERIAL_SESSION` is always added to
    /// `flags`; pass `CKF_RW_SESSION` for a read/write session.
    pub fn open_session(&self, slot: SlotHandle, flags: CK_FLAGS) -> PResult<SessionHandle> {
        let slot_id = self.resolve_slot(slot)?;
        let mut native: CK_SESSION_HANDLE = 0;
        p11_call!(
            self.functions,
            "Failed opening a session",
            C_OpenSession,
            slot_id,
            flags | CKF_SERIAL_SESSION,
            std::ptr::null_mut(),
            None,
            &raw mut native
        )?;
        let mut module = self.initialized_state_mut()?;
        let session = module.registry.sessions.issue_with(native, |handle| SessionEntry {
            handle,
            slot,
            state: Arc::new(Mutex::new(SessionState {
                handle,
                native,
                slot,
                operations: OperationTable::default(),
                find_active: false,
                closed: false,
            })),
        })?;
        debug!("Opened {session} on {slot} (native session {native})");
        Ok(session)
    }

    /// Close a session. Its session objects are invalidated, and closing the
    /// last session on a slot logs its token out.
    pub fn close_session(&self, session: SessionHandle) -> PResult<()> {
        let state = {
            let module = self.initialized_state()?;
            let (_, entry) = module.registry.sessions.get(session)?;
            Arc::clone(&entry.state)
        };
        let mut guard = lock_session(&state)?;
        if guard.closed {
            return Err(PError::InvalidHandle {
                context: format!("{session} is already closed"),
                rv: None,
            });
        }
        p11_call!(
            self.functions,
            "Failed closing a session",
            C_CloseSession,
            guard.native
        )?;
        guard.mark_closed();
        self.initialized_state_mut()?
            .registry
            .close_session(session)
            .map(|_| ())
    }

    /// Close every session opened on `slot`.
    pub fn close_all_sessions(&self, slot: SlotHandle) -> PResult<()> {
        let slot_id = self.resolve_slot(slot)?;
        p11_call!(
            self.functions,
            "Failed closing all sessions",
            C_CloseAllSessions,
            slot_id
        )?;
        let sessions = {
            let mut module = self.initialized_state_mut()?;
            let registry = &mut module.registry;
            let closed = registry.sessions.release_where(|entry| entry.slot == slot);
            registry.logins.remove(&slot);
            for (_, entry) in &closed {
                registry
                    .objects
                    .release_where(|scope| *scope == ObjectScope::Session(entry.handle));
            }
            closed
        };
        for (_, entry) in sessions {
            lock_session(&entry.state)?.mark_closed();
        }
        debug!("Closed all sessions on {slot}");
        Ok(())
    }

    pub fn get_session_info(&self, session: SessionHandle) -> PResult<SessionInfo> {
        self.with_session(session, |state| {
            let mut info = CK_SESSION_INFO::default();
            p11_call!(
                self.functions,
                "Failed getting session info",
                C_GetSessionInfo,
                state.native,
                &raw mut info
            )?;
            Ok(SessionInfo::new(state.slot, &info))
        })
    }

    /// Log `user_type` in. The PIN is copied into a zeroized buffer for the
    /// duration of the call and never logged.
    pub fn login(&self, session: SessionHandle, user_type: UserType, pin: &str) -> PResult<()> {
        self.with_session(session, |state| {
            let mut pin = Zeroizing::new(pin.as_bytes().to_vec());
            let pin_len = CK_ULONG::try_from(pin.len())?;
            p11_call!(
                self.functions,
                "Failed logging in",
                C_Login,
                state.native,
                user_type.into(),
                pin.as_mut_ptr(),
                pin_len
            )?;
            let login = match user_type {
                UserType::SecurityOfficer => Some(LoginState::SecurityOfficer),
                UserType::User => Some(LoginState::User),
                UserType::ContextSpecific => None,
            };
            if let Some(login) = login {
                self.initialized_state_mut()?.registry.logins.insert(state.slot, login);
            }
            debug!("{session} logged in as {user_type:?}");
            Ok(())
        })
    }

    pub fn logout(&self, session: SessionHandle) -> PResult<()> {
        self.with_session(session, |state| {
            p11_call!(self.functions, "Failed logging out", C_Logout, state.native)?;
            self.initialized_state_mut()?.registry.logins.remove(&state.slot);
            Ok(())
        })
    }

    /// Login state of the token `session` is opened on, shared by all the
    /// sessions on that slot.
    pub fn login_state(&self, session: SessionHandle) -> PResult<LoginState> {
        self.with_session(session, |state| {
            Ok(self.initialized_state()?.registry.login_state(state.slot))
        })
    }
}
