//! Copyright 2024 Cosmian Tech SAS

use pkcs11_sys::*;
use thiserror::Error;

pub type PResult<T> = Result<T, PError>;

/// Coarse classification of a failure, sufficient for a caller to decide
/// whether to retry (e.g. with a larger buffer) or to abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Library loading, ABI mismatch, double initialization
    Load,
    /// Invalid or stale slot, session or object handle
    Handle,
    /// Malformed attribute or mechanism descriptor
    Argument,
    /// Undersized output buffer
    Buffer,
    /// Expected cryptographic outcome, such as an invalid signature
    Cryptographic,
    /// Token removed, PIN incorrect, device fault
    Device,
    /// Update without Init, double Init
    Sequence,
    Other,
}

#[derive(Error, Debug)]
pub enum PError {
    #[error("{0}")]
    Default(String),

    #[error("Error loading the PKCS#11 library: {0}")]
    LibraryLoad(String),

    #[error("The PKCS#11 module is already initialized")]
    AlreadyInitialized,

    #[error("The PKCS#11 module is not initialized")]
    NotInitialized,

    #[error("{context}: invalid handle{}", rv_suffix(*.rv))]
    InvalidHandle { context: String, rv: Option<CK_RV> },

    #[error("{context}: bad arguments{}", rv_suffix(*.rv))]
    ArgumentsBad { context: String, rv: Option<CK_RV> },

    #[error("{context}: output buffer too small{}", required_suffix(*.required))]
    BufferTooSmall {
        context: String,
        required: Option<usize>,
    },

    #[error("{context}: signature invalid{}", rv_suffix(Some(*.rv)))]
    SignatureInvalid { context: String, rv: CK_RV },

    #[error("{context}: mechanism invalid{}", rv_suffix(Some(*.rv)))]
    MechanismInvalid { context: String, rv: CK_RV },

    #[error("Unsupported mechanism: {0}")]
    UnsupportedMechanism(String),

    #[error("{context}: key type inconsistent{}", rv_suffix(Some(*.rv)))]
    KeyTypeInconsistent { context: String, rv: CK_RV },

    #[error("{context}: function failed{}", rv_suffix(Some(*.rv)))]
    FunctionFailed { context: String, rv: CK_RV },

    #[error("{context}: device error{}", rv_suffix(Some(*.rv)))]
    Device { context: String, rv: CK_RV },

    #[error("{context}: PIN incorrect{}", rv_suffix(Some(*.rv)))]
    PinIncorrect { context: String, rv: CK_RV },

    #[error("A {0} operation is already active on this session")]
    OperationAlreadyActive(String),

    #[error("No {0} operation is initialized on this session")]
    OperationNotInitialized(String),

    #[error("{context}{}", rv_suffix(Some(*.rv)))]
    Cryptoki { context: String, rv: CK_RV },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    TryFromIntError(#[from] std::num::TryFromIntError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl From<libloading::Error> for PError {
    fn from(e: libloading::Error) -> Self {
        Self::LibraryLoad(e.to_string())
    }
}

fn rv_suffix(rv: Option<CK_RV>) -> String {
    rv.map_or_else(String::new, |rv| format!(" ({}, 0x{rv:08X})", rv_name(rv)))
}

fn required_suffix(required: Option<usize>) -> String {
    required.map_or_else(String::new, |r| format!(" ({r} bytes required)"))
}

impl PError {
    /// The native return code behind this error, if it came from the driver.
    #[must_use]
    pub const fn rv(&self) -> Option<CK_RV> {
        match self {
            Self::InvalidHandle { rv, .. } | Self::ArgumentsBad { rv, .. } => *rv,
            Self::BufferTooSmall { .. } => Some(CKR_BUFFER_TOO_SMALL),
            Self::SignatureInvalid { rv, .. }
            | Self::MechanismInvalid { rv, .. }
            | Self::KeyTypeInconsistent { rv, .. }
            | Self::FunctionFailed { rv, .. }
            | Self::Device { rv, .. }
            | Self::PinIncorrect { rv, .. }
            | Self::Cryptoki { rv, .. } => Some(*rv),
            _ => None,
        }
    }

    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::LibraryLoad(_) | Self::AlreadyInitialized | Self::NotInitialized => {
                ErrorCategory::Load
            }
            Self::InvalidHandle { .. } => ErrorCategory::Handle,
            Self::ArgumentsBad { .. }
            | Self::MechanismInvalid { .. }
            | Self::UnsupportedMechanism(_)
            | Self::KeyTypeInconsistent { .. }
            | Self::TryFromIntError(_) => ErrorCategory::Argument,
            Self::BufferTooSmall { .. } => ErrorCategory::Buffer,
            Self::SignatureInvalid { .. } => ErrorCategory::Cryptographic,
            Self::Device { .. } | Self::PinIncorrect { .. } => ErrorCategory::Device,
            Self::OperationAlreadyActive(_) | Self::OperationNotInitialized(_) => {
                ErrorCategory::Sequence
            }
            Self::Default(_)
            | Self::FunctionFailed { .. }
            | Self::Cryptoki { .. }
            | Self::Config(_)
            | Self::Io(_)
            | Self::Toml(_) => ErrorCategory::Other,
        }
    }

    /// Whether the caller may reasonably retry the same call with different
    /// inputs (a larger buffer, another PIN) without tearing anything down.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::BufferTooSmall { .. } | Self::PinIncorrect { .. } | Self::SignatureInvalid { .. }
        )
    }
}

/// Translate a non-`CKR_OK` return code into a categorized error.
///
/// `CKR_BUFFER_TOO_SMALL` is translated without a required size: call sites
/// which know the length reported by the driver build the error themselves.
pub fn rv_to_error(rv: CK_RV, context: impl Into<String>) -> PError {
    let context = context.into();
    match rv {
        CKR_SESSION_HANDLE_INVALID
        | CKR_SESSION_CLOSED
        | CKR_OBJECT_HANDLE_INVALID
        | CKR_KEY_HANDLE_INVALID
        | CKR_SLOT_ID_INVALID
        | CKR_WRAPPING_KEY_HANDLE_INVALID
        | CKR_UNWRAPPING_KEY_HANDLE_INVALID => PError::InvalidHandle {
            context,
            rv: Some(rv),
        },
        CKR_ARGUMENTS_BAD
        | CKR_ATTRIBUTE_READ_ONLY
        | CKR_ATTRIBUTE_TYPE_INVALID
        | CKR_ATTRIBUTE_VALUE_INVALID
        | CKR_TEMPLATE_INCOMPLETE
        | CKR_TEMPLATE_INCONSISTENT
        | CKR_DATA_INVALID
        | CKR_DATA_LEN_RANGE
        | CKR_ENCRYPTED_DATA_INVALID
        | CKR_ENCRYPTED_DATA_LEN_RANGE
        | CKR_USER_TYPE_INVALID
        | CKR_PIN_INVALID
        | CKR_PIN_LEN_RANGE => PError::ArgumentsBad {
            context,
            rv: Some(rv),
        },
        CKR_BUFFER_TOO_SMALL => PError::BufferTooSmall {
            context,
            required: None,
        },
        CKR_SIGNATURE_INVALID | CKR_SIGNATURE_LEN_RANGE => {
            PError::SignatureInvalid { context, rv }
        }
        CKR_MECHANISM_INVALID | CKR_MECHANISM_PARAM_INVALID => {
            PError::MechanismInvalid { context, rv }
        }
        CKR_KEY_TYPE_INCONSISTENT
        | CKR_WRAPPING_KEY_TYPE_INCONSISTENT
        | CKR_UNWRAPPING_KEY_TYPE_INCONSISTENT => PError::KeyTypeInconsistent { context, rv },
        CKR_FUNCTION_FAILED | CKR_GENERAL_ERROR => PError::FunctionFailed { context, rv },
        CKR_DEVICE_ERROR
        | CKR_DEVICE_MEMORY
        | CKR_DEVICE_REMOVED
        | CKR_TOKEN_NOT_PRESENT
        | CKR_TOKEN_NOT_RECOGNIZED => PError::Device { context, rv },
        CKR_PIN_INCORRECT => PError::PinIncorrect { context, rv },
        CKR_CRYPTOKI_ALREADY_INITIALIZED => PError::AlreadyInitialized,
        CKR_CRYPTOKI_NOT_INITIALIZED => PError::NotInitialized,
        CKR_OPERATION_ACTIVE => PError::OperationAlreadyActive(context),
        CKR_OPERATION_NOT_INITIALIZED => PError::OperationNotInitialized(context),
        _ => PError::Cryptoki { context, rv },
    }
}

/// `Ok(())` for `CKR_OK`, the translated error otherwise.
pub(crate) fn check_rv(rv: CK_RV, context: &str) -> PResult<()> {
    if rv == CKR_OK {
        Ok(())
    } else {
        Err(rv_to_error(rv, context))
    }
}

/// Symbolic name of a return code, for logs and error messages.
#[must_use]
pub fn rv_name(rv: CK_RV) -> &'static str {
    match rv {
        CKR_OK => "CKR_OK",
        CKR_CANCEL => "CKR_CANCEL",
        CKR_HOST_MEMORY => "CKR_HOST_MEMORY",
        CKR_SLOT_ID_INVALID => "CKR_SLOT_ID_INVALID",
        CKR_GENERAL_ERROR => "CKR_GENERAL_ERROR",
        CKR_FUNCTION_FAILED => "CKR_FUNCTION_FAILED",
        CKR_ARGUMENTS_BAD => "CKR_ARGUMENTS_BAD",
        CKR_NO_EVENT => "CKR_NO_EVENT",
        CKR_NEED_TO_CREATE_THREADS => "CKR_NEED_TO_CREATE_THREADS",
        CKR_CANT_LOCK => "CKR_CANT_LOCK",
        CKR_ATTRIBUTE_READ_ONLY => "CKR_ATTRIBUTE_READ_ONLY",
        CKR_ATTRIBUTE_SENSITIVE => "CKR_ATTRIBUTE_SENSITIVE",
        CKR_ATTRIBUTE_TYPE_INVALID => "CKR_ATTRIBUTE_TYPE_INVALID",
        CKR_ATTRIBUTE_VALUE_INVALID => "CKR_ATTRIBUTE_VALUE_INVALID",
        CKR_DATA_INVALID => "CKR_DATA_INVALID",
        CKR_DATA_LEN_RANGE => "CKR_DATA_LEN_RANGE",
        CKR_DEVICE_ERROR => "CKR_DEVICE_ERROR",
        CKR_DEVICE_MEMORY => "CKR_DEVICE_MEMORY",
        CKR_DEVICE_REMOVED => "CKR_DEVICE_REMOVED",
        CKR_ENCRYPTED_DATA_INVALID => "CKR_ENCRYPTED_DATA_INVALID",
        CKR_ENCRYPTED_DATA_LEN_RANGE => "CKR_ENCRYPTED_DATA_LEN_RANGE",
        CKR_FUNCTION_CANCELED => "CKR_FUNCTION_CANCELED",
        CKR_FUNCTION_NOT_PARALLEL => "CKR_FUNCTION_NOT_PARALLEL",
        CKR_FUNCTION_NOT_SUPPORTED => "CKR_FUNCTION_NOT_SUPPORTED",
        CKR_KEY_HANDLE_INVALID => "CKR_KEY_HANDLE_INVALID",
        CKR_KEY_SIZE_RANGE => "CKR_KEY_SIZE_RANGE",
        CKR_KEY_TYPE_INCONSISTENT => "CKR_KEY_TYPE_INCONSISTENT",
        CKR_KEY_FUNCTION_NOT_PERMITTED => "CKR_KEY_FUNCTION_NOT_PERMITTED",
        CKR_KEY_NOT_WRAPPABLE => "CKR_KEY_NOT_WRAPPABLE",
        CKR_KEY_UNEXTRACTABLE => "CKR_KEY_UNEXTRACTABLE",
        CKR_MECHANISM_INVALID => "CKR_MECHANISM_INVALID",
        CKR_MECHANISM_PARAM_INVALID => "CKR_MECHANISM_PARAM_INVALID",
        CKR_OBJECT_HANDLE_INVALID => "CKR_OBJECT_HANDLE_INVALID",
        CKR_OPERATION_ACTIVE => "CKR_OPERATION_ACTIVE",
        CKR_OPERATION_NOT_INITIALIZED => "CKR_OPERATION_NOT_INITIALIZED",
        CKR_PIN_INCORRECT => "CKR_PIN_INCORRECT",
        CKR_PIN_INVALID => "CKR_PIN_INVALID",
        CKR_PIN_LEN_RANGE => "CKR_PIN_LEN_RANGE",
        CKR_PIN_EXPIRED => "CKR_PIN_EXPIRED",
        CKR_PIN_LOCKED => "CKR_PIN_LOCKED",
        CKR_SESSION_CLOSED => "CKR_SESSION_CLOSED",
        CKR_SESSION_COUNT => "CKR_SESSION_COUNT",
        CKR_SESSION_HANDLE_INVALID => "CKR_SESSION_HANDLE_INVALID",
        CKR_SESSION_PARALLEL_NOT_SUPPORTED => "CKR_SESSION_PARALLEL_NOT_SUPPORTED",
        CKR_SESSION_READ_ONLY => "CKR_SESSION_READ_ONLY",
        CKR_SESSION_EXISTS => "CKR_SESSION_EXISTS",
        CKR_SESSION_READ_ONLY_EXISTS => "CKR_SESSION_READ_ONLY_EXISTS",
        CKR_SESSION_READ_WRITE_SO_EXISTS => "CKR_SESSION_READ_WRITE_SO_EXISTS",
        CKR_SIGNATURE_INVALID => "CKR_SIGNATURE_INVALID",
        CKR_SIGNATURE_LEN_RANGE => "CKR_SIGNATURE_LEN_RANGE",
        CKR_TEMPLATE_INCOMPLETE => "CKR_TEMPLATE_INCOMPLETE",
        CKR_TEMPLATE_INCONSISTENT => "CKR_TEMPLATE_INCONSISTENT",
        CKR_TOKEN_NOT_PRESENT => "CKR_TOKEN_NOT_PRESENT",
        CKR_TOKEN_NOT_RECOGNIZED => "CKR_TOKEN_NOT_RECOGNIZED",
        CKR_TOKEN_WRITE_PROTECTED => "CKR_TOKEN_WRITE_PROTECTED",
        CKR_UNWRAPPING_KEY_HANDLE_INVALID => "CKR_UNWRAPPING_KEY_HANDLE_INVALID",
        CKR_UNWRAPPING_KEY_TYPE_INCONSISTENT => "CKR_UNWRAPPING_KEY_TYPE_INCONSISTENT",
        CKR_USER_ALREADY_LOGGED_IN => "CKR_USER_ALREADY_LOGGED_IN",
        CKR_USER_NOT_LOGGED_IN => "CKR_USER_NOT_LOGGED_IN",
        CKR_USER_PIN_NOT_INITIALIZED => "CKR_USER_PIN_NOT_INITIALIZED",
        CKR_USER_TYPE_INVALID => "CKR_USER_TYPE_INVALID",
        CKR_USER_ANOTHER_ALREADY_LOGGED_IN => "CKR_USER_ANOTHER_ALREADY_LOGGED_IN",
        CKR_WRAPPED_KEY_INVALID => "CKR_WRAPPED_KEY_INVALID",
        CKR_WRAPPING_KEY_HANDLE_INVALID => "CKR_WRAPPING_KEY_HANDLE_INVALID",
        CKR_WRAPPING_KEY_TYPE_INCONSISTENT => "CKR_WRAPPING_KEY_TYPE_INCONSISTENT",
        CKR_RANDOM_SEED_NOT_SUPPORTED => "CKR_RANDOM_SEED_NOT_SUPPORTED",
        CKR_RANDOM_NO_RNG => "CKR_RANDOM_NO_RNG",
        CKR_BUFFER_TOO_SMALL => "CKR_BUFFER_TOO_SMALL",
        CKR_CRYPTOKI_NOT_INITIALIZED => "CKR_CRYPTOKI_NOT_INITIALIZED",
        CKR_CRYPTOKI_ALREADY_INITIALIZED => "CKR_CRYPTOKI_ALREADY_INITIALIZED",
        _ => "CKR_VENDOR_OR_UNKNOWN",
    }
}
