//! Copyright 2024 Cosmian Tech SAS
//!
//! Safe access to a PKCS#11 (Cryptoki v2.x) driver loaded at runtime.
//!
//! A [`Module`] owns the loaded driver. Slots, sessions and objects are
//! designated by generational handles; attributes and mechanisms are
//! described by Rust values and laid out for the driver on each call. The
//! streaming Init / Update / Final protocol is tracked per session and per
//! operation kind.

#![allow(non_snake_case)]
#![allow(clippy::missing_safety_doc)]

/// Call a Cryptoki entry point through a function table and translate its
/// return code; a macro keeps the argument pointers inline.
macro_rules! p11_call {
    ($functions:expr, $context:expr, $function:ident $(, $arg:expr)* $(,)?) => {{
        #[allow(unused_unsafe)]
        let rv = unsafe { $crate::loader::FunctionList::$function(&*$functions $(, $arg)*) };
        tracing::trace!(
            "{} -> {}",
            stringify!($function),
            $crate::error::rv_name(rv)
        );
        $crate::error::check_rv(rv, $context)
    }};
}

pub use attribute::{
    Attribute, AttributeValue, Date, NativeTemplate, UNAVAILABLE_INFORMATION, ValueShape,
    decode_value, value_shape,
};
pub use config::{HSM_SLOT_ID_ENV, HSM_USER_PASSWORD_ENV, PKCS11_LIBRARY_PATH_ENV, Pkcs11Config};
pub use error::{ErrorCategory, PError, PResult, rv_name, rv_to_error};
pub use handles::{Handle, HandleKind, ObjectHandle, SessionHandle, SlotHandle, kind};
pub use info::{Info, MechanismInfo, SessionInfo, SlotInfo, TokenInfo, Version};
pub use keys::{DerivedKey, KeyPair};
pub use loader::{FunctionList, Pkcs11Lib};
pub use mechanism::{
    EncodedMechanism, Mechanism, MechanismParameter, ParameterShape, encode, parameter_shape,
};
pub use module::{InitializeOptions, Module};
pub use operation::{OperationKind, OperationState};
pub use session::{LoginState, UserType};

mod attribute;
mod config;
mod crypto;
mod error;
mod handles;
mod info;
mod keys;
mod loader;
mod mechanism;
mod module;
mod object;
mod operation;
mod random;
mod session;
mod slot;

#[cfg(test)]
mod tests;
