//! End to end tests of the binding against an in-memory driver.

use std::sync::Arc;

use cosmian_logger::log_init;
use pkcs11_sys::{
    CK_ULONG, CKA_CLASS, CKA_DECRYPT, CKA_ENCRYPT, CKA_EXTRACTABLE, CKA_LABEL, CKA_TOKEN,
    CKA_UNWRAP, CKA_VALUE_LEN, CKA_WRAP, CKF_RW_SESSION, CKM_AES_KEY_GEN, CKO_SECRET_KEY,
};

use crate::{
    Attribute, InitializeOptions, Mechanism, Module, ObjectHandle, PResult, SessionHandle,
    SlotHandle, UserType,
};

mod key_tests;
mod lifecycle_tests;

use mock_driver::{MockDriver, TOKEN_SLOT, USER_PIN};

/// An initialized module over a fresh driver, with a read/write session
/// logged in as the user on the token slot.
pub(crate) struct Fixture {
    pub(crate) driver: Arc<MockDriver>,
    pub(crate) module: Module,
    pub(crate) slot: SlotHandle,
    pub(crate) session: SessionHandle,
}

pub(crate) fn initialized_module() -> PResult<(Arc<MockDriver>, Module)> {
    log_init(None);
    let driver = Arc::new(MockDriver::default());
    let module = Module::with_function_list(driver.clone());
    module.initialize(&InitializeOptions::default())?;
    Ok((driver, module))
}

pub(crate) fn fixture() -> PResult<Fixture> {
    let (driver, module) = initialized_module()?;
    let slot = module.find_slot(TOKEN_SLOT)?;
    let session = module.open_session(slot, CKF_RW_SESSION)?;
    module.login(session, UserType::User, USER_PIN)?;
    Ok(Fixture {
        driver,
        module,
        slot,
        session,
    })
}

/// A session AES key usable for encryption and key wrapping.
pub(crate) fn aes_key(fixture: &Fixture, len: CK_ULONG, label: &str) -> PResult<ObjectHandle> {
    fixture.module.generate_key(
        fixture.session,
        &Mechanism::new(CKM_AES_KEY_GEN),
        &[
            Attribute::ulong(CKA_CLASS, CKO_SECRET_KEY),
            Attribute::bool(CKA_TOKEN, false),
            Attribute::bytes(CKA_LABEL, label),
            Attribute::ulong(CKA_VALUE_LEN, len),
            Attribute::bool(CKA_ENCRYPT, true),
            Attribute::bool(CKA_DECRYPT, true),
            Attribute::bool(CKA_WRAP, true),
            Attribute::bool(CKA_UNWRAP, true),
            Attribute::bool(CKA_EXTRACTABLE, true),
        ],
    )
}
