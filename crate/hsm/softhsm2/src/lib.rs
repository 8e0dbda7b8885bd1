//! Copyright 2024 Cosmian Tech SAS

use std::env;

use cosmian_pkcs11_binding::{
    Module, PError, PResult, Pkcs11Config, SessionHandle, SlotHandle, UserType,
};
use pkcs11_sys::{CK_SLOT_ID, CKF_RW_SESSION};
use tracing::debug;


/// Default location of the SoftHSM2 driver on Debian based systems
pub const SOFTHSM2_PKCS11_LIB: &str = "/usr/lib/softhsm/libsofthsm2.so";
/// Overrides [`SOFTHSM2_PKCS11_LIB`]
pub const SOFTHSM2_PKCS11_LIB_ENV: &str = "SOFTHSM2_PKCS11_LIB";

/// The SoftHSM2 configuration: the driver from `SOFTHSM2_PKCS11_LIB` or its
/// default location, then the generic `PKCS11_LIBRARY_PATH`, `HSM_SLOT_ID`
/// and `HSM_USER_PASSWORD` overrides.
pub fn softhsm2_config() -> PResult<Pkcs11Config> {
    let library_path =
        env::var(SOFTHSM2_PKCS11_LIB_ENV).unwrap_or_else(|_| SOFTHSM2_PKCS11_LIB.to_owned());
    Pkcs11Config::new(library_path).apply_env_overrides()
}

/// An initialized SoftHSM2 module and the slot it works on.
pub struct Softhsm2 {
    pub module: Module,
    pub slot: SlotHandle,
    config: Pkcs11Config,
}

impl Softhsm2 {
    /// Load and initialize the driver, then select the configured slot, or
    /// the first slot holding a token.
    pub fn instantiate(config: Pkcs11Config) -> PResult<Self> {
        let module = Module::from_config(&config)?;
        let slot = match config.slot_id {
            Some(slot_id) => {
                let slot_id = CK_SLOT_ID::try_from(slot_id)
                    .map_err(|e| PError::Config(format!("slot id {slot_id}: {e}")))?;
                module.find_slot(slot_id)?
            }
            None => module
                .get_slot_list(true)?
                .into_iter()
                .next()
                .ok_or_else(|| PError::Config("no SoftHSM2 slot holds a token".to_owned()))?,
        };
        debug!(
            "SoftHSM2 loaded from {}, using {slot}",
            config.library_path.display()
        );
        Ok(Self {
            module,
            slot,
            config,
        })
    }

    /// Open a read/write session logged in as the user.
    pub fn user_session(&self) -> PResult<SessionHandle> {
        let pin = self.config.user_pin.as_ref().ok_or_else(|| {
            PError::Config("the SoftHSM2 user PIN is not configured".to_owned())
        })?;
        let session = self.module.open_session(self.slot, CKF_RW_SESSION)?;
        if let Err(e) = self.module.login(session, UserType::User, pin) {
            self.module.close_session(session)?;
            return Err(e);
        }
        Ok(session)
    }
}
