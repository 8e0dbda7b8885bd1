use std::sync::Arc;

use cosmian_logger::log_init;
use pkcs11_sys::{
    CKA_CLASS, CKA_LABEL, CKA_TOKEN, CKF_DECRYPT, CKF_ENCRYPT, CKF_OS_LOCKING_OK, CKF_RW_SESSION,
    CKF_SERIAL_SESSION, CKM_AES_CBC, CKM_SHA512, CKO_DATA, CKR_SESSION_HANDLE_INVALID,
    CKR_SLOT_ID_INVALID, CKR_TOKEN_NOT_PRESENT, CKS_RO_PUBLIC_SESSION, CKS_RO_USER_FUNCTIONS,
    CKS_RW_USER_FUNCTIONS,
};

use super::{
    fixture, initialized_module,
    mock_driver::{EMPTY_SLOT, MECHANISMS, MockDriver, TOKEN_SLOT, USER_PIN},
};
use crate::{
    Attribute, ErrorCategory, InitializeOptions, LoginState, Module, PError, PResult, UserType,
};

#[test]
fn load_from_wrong_library() {
    log_init(None);
    let err = Module::load("some/wrong/lib").err();
    assert!(matches!(err, Some(PError::LibraryLoad(_))), "{err:?}");
    assert_eq!(err.map(|e| e.category()), Some(ErrorCategory::Load));
}

#[test]
fn initialize_and_finalize() -> PResult<()> {
    log_init(None);
    let driver = Arc::new(MockDriver::default());
    let module = Module::with_function_list(driver.clone());
    assert!(!module.is_initialized());

    // nothing reaches the driver before initialize
    assert!(matches!(module.get_slot_list(true), Err(PError::NotInitialized)));
    assert!(matches!(module.get_info(), Err(PError::NotInitialized)));
    assert!(matches!(module.finalize(), Err(PError::NotInitialized)));
    assert_eq!(driver.calls("C_GetSlotList"), 0);
    assert_eq!(driver.calls("C_Finalize"), 0);

    module.initialize(&InitializeOptions::default())?;
    assert!(module.is_initialized());
    assert_eq!(driver.init_flags(), CKF_OS_LOCKING_OK);
    assert!(matches!(
        module.initialize(&InitializeOptions::default()),
        Err(PError::AlreadyInitialized)
    ));
    assert_eq!(driver.calls("C_Initialize"), 1);

    module.finalize()?;
    assert!(!module.is_initialized());
    module.initialize(&InitializeOptions { os_locking: false })?;
    assert_eq!(driver.init_flags(), 0);
    Ok(())
}

#[test]
fn module_info() -> PResult<()> {
    let (_driver, module) = initialized_module()?;
    let info = module.get_info()?;
    assert_eq!(info.cryptokiVersion.to_string(), "2.40");
    assert_eq!(info.manufacturerID, "Cosmian");
    assert_eq!(info.flags, 0);
    assert_eq!(info.libraryDescription, "In-memory test driver");
    assert!(info.to_string().contains("Library Version: 1.2"));
    Ok(())
}

#[test]
fn slots_and_tokens() -> PResult<()> {
    let (_driver, module) = initialized_module()?;
    let with_token = module.get_slot_list(true)?;
    let all = module.get_slot_list(false)?;
    assert_eq!(with_token.len(), 1);
    assert_eq!(all.len(), 2);
    // a slot keeps its handle across listings
    assert!(all.contains(&with_token[0]));
    assert_eq!(module.slot_id(with_token[0])?, TOKEN_SLOT);

    let slot_info = module.get_slot_info(with_token[0])?;
    assert!(slot_info.token_present());
    assert_eq!(slot_info.slotDescription, format!("Mock slot {TOKEN_SLOT}"));
    let token = module.get_token_info(with_token[0])?;
    assert_eq!(token.label, "mock token");
    assert_eq!(token.ulSessionCount, 0);

    let empty = module.find_slot(EMPTY_SLOT)?;
    assert!(!module.get_slot_info(empty)?.token_present());
    let err = module.get_token_info(empty).unwrap_err();
    assert_eq!(err.rv(), Some(CKR_TOKEN_NOT_PRESENT));
    assert_eq!(err.category(), ErrorCategory::Device);
    assert!(module.open_session(empty, 0).is_err());

    let err = module.find_slot(99).unwrap_err();
    assert!(matches!(err, PError::InvalidHandle { .. }));
    assert_eq!(err.rv(), Some(CKR_SLOT_ID_INVALID));
    Ok(())
}

#[test]
fn mechanisms() -> PResult<()> {
    let (_driver, module) = initialized_module()?;
    let slot = module.find_slot(TOKEN_SLOT)?;
    assert_eq!(module.get_mechanism_list(slot)?, MECHANISMS.to_vec());
    let cbc = module.get_mechanism_info(slot, CKM_AES_CBC)?;
    assert!(cbc.supports(CKF_ENCRYPT | CKF_DECRYPT));
    assert_eq!((cbc.ulMinKeySize, cbc.ulMaxKeySize), (16, 32));
    assert!(matches!(
        module.get_mechanism_info(slot, CKM_SHA512),
        Err(PError::MechanismInvalid { .. })
    ));
    Ok(())
}

#[test]
fn session_info_and_login() -> PResult<()> {
    let (driver, module) = initialized_module()?;
    let slot = module.find_slot(TOKEN_SLOT)?;

    let read_only = module.open_session(slot, 0)?;
    let info = module.get_session_info(read_only)?;
    assert_eq!(info.slot, slot);
    assert_eq!(info.slotID, TOKEN_SLOT);
    assert_eq!(info.state, CKS_RO_PUBLIC_SESSION);
    // serial sessions are requested even when not asked for
    assert_eq!(info.flags, CKF_SERIAL_SESSION);
    assert!(!info.is_read_write());

    let session = module.open_session(slot, CKF_RW_SESSION)?;
    let err = module.login(session, UserType::User, "wrong").unwrap_err();
    assert!(matches!(err, PError::PinIncorrect { .. }));
    assert!(err.is_recoverable());
    assert_eq!(module.login_state(session)?, LoginState::Public);

    module.login(session, UserType::User, USER_PIN)?;
    assert_eq!(module.login_state(session)?, LoginState::User);
    assert!(driver.is_logged_in(TOKEN_SLOT));
    let info = module.get_session_info(session)?;
    assert_eq!(info.state, CKS_RW_USER_FUNCTIONS);
    assert!(info.is_read_write());
    assert_eq!(module.get_token_info(slot)?.ulRwSessionCount, 1);

    // a second login is reported, not absorbed
    assert!(module.login(session, UserType::User, USER_PIN).is_err());

    module.logout(session)?;
    assert_eq!(module.login_state(session)?, LoginState::Public);
    assert!(!driver.is_logged_in(TOKEN_SLOT));
    Ok(())
}

#[test]
fn login_is_shared_by_the_sessions_of_a_token() -> PResult<()> {
    let (driver, module) = initialized_module()?;
    let slot = module.find_slot(TOKEN_SLOT)?;
    let first = module.open_session(slot, CKF_RW_SESSION)?;
    let second = module.open_session(slot, 0)?;

    module.login(first, UserType::User, USER_PIN)?;
    assert_eq!(module.login_state(second)?, LoginState::User);
    assert_eq!(module.get_session_info(second)?.state, CKS_RO_USER_FUNCTIONS);

    module.logout(second)?;
    assert_eq!(module.login_state(first)?, LoginState::Public);

    module.login(second, UserType::User, USER_PIN)?;
    module.close_session(first)?;
    assert_eq!(module.login_state(second)?, LoginState::User);

    // the token is logged out with its last session
    module.close_session(second)?;
    assert!(!driver.is_logged_in(TOKEN_SLOT));
    let third = module.open_session(slot, 0)?;
    assert_eq!(module.login_state(third)?, LoginState::Public);
    Ok(())
}

#[test]
fn closed_session_handles_are_stale() -> PResult<()> {
    let f = fixture()?;
    let object = f.module.create_object(
        f.session,
        &[
            Attribute::ulong(CKA_CLASS, CKO_DATA),
            Attribute::bool(CKA_TOKEN, false),
            Attribute::bytes(CKA_LABEL, "session object"),
        ],
    )?;
    f.module.close_session(f.session)?;

    let err = f.module.get_session_info(f.session).unwrap_err();
    assert!(matches!(err, PError::InvalidHandle { rv: None, .. }));
    assert_eq!(err.category(), ErrorCategory::Handle);
    assert!(f.module.close_session(f.session).is_err());
    assert_eq!(f.driver.calls("C_CloseSession"), 1);

    // the object died with its session; a new session cannot reach it
    let session = f.module.open_session(f.slot, CKF_RW_SESSION)?;
    assert_ne!(session, f.session);
    assert!(matches!(
        f.module.get_attribute_value(session, object, &[CKA_LABEL]),
        Err(PError::InvalidHandle { .. })
    ));
    Ok(())
}

#[test]
fn close_all_sessions_of_a_slot() -> PResult<()> {
    let f = fixture()?;
    let other = f.module.open_session(f.slot, 0)?;
    f.module.close_all_sessions(f.slot)?;
    for session in [f.session, other] {
        assert!(matches!(
            f.module.get_session_info(session),
            Err(PError::InvalidHandle { .. })
        ));
    }
    assert_eq!(f.module.get_token_info(f.slot)?.ulSessionCount, 0);
    Ok(())
}

#[test]
fn finalize_invalidates_every_handle() -> PResult<()> {
    let f = fixture()?;
    f.module.finalize()?;
    assert!(matches!(
        f.module.get_session_info(f.session),
        Err(PError::NotInitialized)
    ));

    f.module.initialize(&InitializeOptions::default())?;
    assert!(matches!(
        f.module.get_session_info(f.session),
        Err(PError::InvalidHandle { .. })
    ));
    assert!(matches!(
        f.module.get_slot_info(f.slot),
        Err(PError::InvalidHandle { .. })
    ));
    // slots are listed again under new handles
    let slot = f.module.find_slot(TOKEN_SLOT)?;
    assert_ne!(slot, f.slot);
    f.module.open_session(slot, 0)?;
    Ok(())
}

#[test]
fn driver_rejected_session_keeps_the_error_code() -> PResult<()> {
    let f = fixture()?;
    // closed behind the binding's back
    unsafe {
        crate::FunctionList::C_CloseAllSessions(&*f.driver, TOKEN_SLOT);
    }
    let err = f.module.get_session_info(f.session).unwrap_err();
    assert_eq!(err.rv(), Some(CKR_SESSION_HANDLE_INVALID));
    Ok(())
}

#[test]
fn random() -> PResult<()> {
    let f = fixture()?;
    let seed = [7_u8; 20];
    let returned = f.module.seed_random(f.session, &seed)?;
    assert_eq!(returned.as_ptr(), seed.as_ptr());
    assert_eq!(returned.len(), 20);

    let mut buffer = [0_u8; 20];
    let filled = f.module.generate_random(f.session, &mut buffer)?;
    assert_eq!(filled.len(), 20);
    assert!(filled.iter().any(|b| *b != 0));
    Ok(())
}
