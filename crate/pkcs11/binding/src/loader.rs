use std::{ffi::OsStr, ptr};

use libloading::Library;
use pkcs11_sys::*;
use tracing::{debug, info};

use crate::{PError, PResult, error::rv_name};

/// Declares the Cryptoki entry points once and derives from that list
/// both the [`FunctionList`] trait and its dispatch through a loaded
/// `CK_FUNCTION_LIST`.
macro_rules! function_list {
    ($($name:ident($($arg:ident: $ty:ty),* $(,)?);)*) => {
        /// The Cryptoki v2.x function table.
        ///
        /// [`Pkcs11Lib`] dispatches every entry through the table returned by
        /// the driver's `C_GetFunctionList`; any other implementation (an
        /// in-process driver, a recording proxy) can be plugged into a
        /// [`crate::Module`] instead. Entries not overridden answer
        /// `CKR_FUNCTION_NOT_SUPPORTED`.
        ///
        /// # Safety
        ///
        /// Every entry has the exact contract of the C function of the same
        /// name: pointers must be valid for the lengths given next to them.
        pub trait FunctionList: Send + Sync {
            $(
                unsafe fn $name(&self, $($arg: $ty),*) -> CK_RV {
                    let _ = ($($arg,)*);
                    CKR_FUNCTION_NOT_SUPPORTED
                }
            )*
        }

        impl FunctionList for Pkcs11Lib {
            $(
                unsafe fn $name(&self, $($arg: $ty),*) -> CK_RV {
                    // SAFETY: `functions` was checked non-null at load time and
                    // the table lives as long as `_library`.
                    match unsafe { (*self.functions).$name } {
                        Some(function) => unsafe { function($($arg),*) },
                        None => CKR_FUNCTION_NOT_SUPPORTED,
                    }
                }
            )*
        }
    };
}

function_list! {
    C_Initialize(pInitArgs: CK_VOID_PTR);
    C_Finalize(pReserved: CK_VOID_PTR);
    C_GetInfo(pInfo: CK_INFO_PTR);
    C_GetSlotList(tokenPresent: CK_BBOOL, pSlotList: CK_SLOT_ID_PTR, pulCount: CK_ULONG_PTR);
    C_GetSlotInfo(slotID: CK_SLOT_ID, pInfo: CK_SLOT_INFO_PTR);
    C_GetTokenInfo(slotID: CK_SLOT_ID, pInfo: CK_TOKEN_INFO_PTR);
    C_GetMechanismList(
        slotID: CK_SLOT_ID,
        pMechanismList: CK_MECHANISM_TYPE_PTR,
        pulCount: CK_ULONG_PTR,
    );
    C_GetMechanismInfo(slotID: CK_SLOT_ID, type_: CK_MECHANISM_TYPE, pInfo: CK_MECHANISM_INFO_PTR);
    C_OpenSession(
        slotID: CK_SLOT_ID,
        flags: CK_FLAGS,
        pApplication: CK_VOID_PTR,
        Notify: CK_NOTIFY,
        phSession: CK_SESSION_HANDLE_PTR,
    );
    C_CloseSession(hSession: CK_SESSION_HANDLE);
    C_CloseAllSessions(slotID: CK_SLOT_ID);
    C_GetSessionInfo(hSession: CK_SESSION_HANDLE, pInfo: CK_SESSION_INFO_PTR);
    C_Login(
        hSession: CK_SESSION_HANDLE,
        userType: CK_USER_TYPE,
        pPin: CK_UTF8CHAR_PTR,
        ulPinLen: CK_ULONG,
    );
    C_Logout(hSession: CK_SESSION_HANDLE);
    C_CreateObject(
        hSession: CK_SESSION_HANDLE,
        pTemplate: CK_ATTRIBUTE_PTR,
        ulCount: CK_ULONG,
        phObject: CK_OBJECT_HANDLE_PTR,
    );
    C_DestroyObject(hSession: CK_SESSION_HANDLE, hObject: CK_OBJECT_HANDLE);
    C_GetAttributeValue(
        hSession: CK_SESSION_HANDLE,
        hObject: CK_OBJECT_HANDLE,
        pTemplate: CK_ATTRIBUTE_PTR,
        ulCount: CK_ULONG,
    );
    C_SetAttributeValue(
        hSession: CK_SESSION_HANDLE,
        hObject: CK_OBJECT_HANDLE,
        pTemplate: CK_ATTRIBUTE_PTR,
        ulCount: CK_ULONG,
    );
    C_FindObjectsInit(hSession: CK_SESSION_HANDLE, pTemplate: CK_ATTRIBUTE_PTR, ulCount: CK_ULONG);
    C_FindObjects(
        hSession: CK_SESSION_HANDLE,
        phObject: CK_OBJECT_HANDLE_PTR,
        ulMaxObjectCount: CK_ULONG,
        pulObjectCount: CK_ULONG_PTR,
    );
    C_FindObjectsFinal(hSession: CK_SESSION_HANDLE);
    C_EncryptInit(hSession: CK_SESSION_HANDLE, pMechanism: CK_MECHANISM_PTR, hKey: CK_OBJECT_HANDLE);
    C_Encrypt(
        hSession: CK_SESSION_HANDLE,
        pData: CK_BYTE_PTR,
        ulDataLen: CK_ULONG,
        pEncryptedData: CK_BYTE_PTR,
        pulEncryptedDataLen: CK_ULONG_PTR,
    );
    C_EncryptUpdate(
        hSession: CK_SESSION_HANDLE,
        pPart: CK_BYTE_PTR,
        ulPartLen: CK_ULONG,
        pEncryptedPart: CK_BYTE_PTR,
        pulEncryptedPartLen: CK_ULONG_PTR,
    );
    C_EncryptFinal(
        hSession: CK_SESSION_HANDLE,
        pLastEncryptedPart: CK_BYTE_PTR,
        pulLastEncryptedPartLen: CK_ULONG_PTR,
    );
    C_DecryptInit(hSession: CK_SESSION_HANDLE, pMechanism: CK_MECHANISM_PTR, hKey: CK_OBJECT_HANDLE);
    C_Decrypt(
        hSession: CK_SESSION_HANDLE,
        pEncryptedData: CK_BYTE_PTR,
        ulEncryptedDataLen: CK_ULONG,
        pData: CK_BYTE_PTR,
        pulDataLen: CK_ULONG_PTR,
    );
    C_DecryptUpdate(
        hSession: CK_SESSION_HANDLE,
        pEncryptedPart: CK_BYTE_PTR,
        ulEncryptedPartLen: CK_ULONG,
        pPart: CK_BYTE_PTR,
        pulPartLen: CK_ULONG_PTR,
    );
    C_DecryptFinal(
        hSession: CK_SESSION_HANDLE,
        pLastPart: CK_BYTE_PTR,
        pulLastPartLen: CK_ULONG_PTR,
    );
    C_DigestInit(hSession: CK_SESSION_HANDLE, pMechanism: CK_MECHANISM_PTR);
    C_Digest(
        hSession: CK_SESSION_HANDLE,
        pData: CK_BYTE_PTR,
        ulDataLen: CK_ULONG,
        pDigest: CK_BYTE_PTR,
        pulDigestLen: CK_ULONG_PTR,
    );
    C_DigestUpdate(hSession: CK_SESSION_HANDLE, pPart: CK_BYTE_PTR, ulPartLen: CK_ULONG);
    C_DigestKey(hSession: CK_SESSION_HANDLE, hKey: CK_OBJECT_HANDLE);
    C_DigestFinal(hSession: CK_SESSION_HANDLE, pDigest: CK_BYTE_PTR, pulDigestLen: CK_ULONG_PTR);
    C_SignInit(hSession: CK_SESSION_HANDLE, pMechanism: CK_MECHANISM_PTR, hKey: CK_OBJECT_HANDLE);
    C_Sign(
        hSession: CK_SESSION_HANDLE,
        pData: CK_BYTE_PTR,
        ulDataLen: CK_ULONG,
        pSignature: CK_BYTE_PTR,
        pulSignatureLen: CK_ULONG_PTR,
    );
    C_SignUpdate(hSession: CK_SESSION_HANDLE, pPart: CK_BYTE_PTR, ulPartLen: CK_ULONG);
    C_SignFinal(
        hSession: CK_SESSION_HANDLE,
        pSignature: CK_BYTE_PTR,
        pulSignatureLen: CK_ULONG_PTR,
    );
    C_VerifyInit(hSession: CK_SESSION_HANDLE, pMechanism: CK_MECHANISM_PTR, hKey: CK_OBJECT_HANDLE);
    C_Verify(
        hSession: CK_SESSION_HANDLE,
        pData: CK_BYTE_PTR,
        ulDataLen: CK_ULONG,
        pSignature: CK_BYTE_PTR,
        ulSignatureLen: CK_ULONG,
    );
    C_VerifyUpdate(hSession: CK_SESSION_HANDLE, pPart: CK_BYTE_PTR, ulPartLen: CK_ULONG);
    C_VerifyFinal(hSession: CK_SESSION_HANDLE, pSignature: CK_BYTE_PTR, ulSignatureLen: CK_ULONG);
    C_GenerateKey(
        hSession: CK_SESSION_HANDLE,
        pMechanism: CK_MECHANISM_PTR,
        pTemplate: CK_ATTRIBUTE_PTR,
        ulCount: CK_ULONG,
        phKey: CK_OBJECT_HANDLE_PTR,
    );
    C_GenerateKeyPair(
        hSession: CK_SESSION_HANDLE,
        pMechanism: CK_MECHANISM_PTR,
        pPublicKeyTemplate: CK_ATTRIBUTE_PTR,
        ulPublicKeyAttributeCount: CK_ULONG,
        pPrivateKeyTemplate: CK_ATTRIBUTE_PTR,
        ulPrivateKeyAttributeCount: CK_ULONG,
        phPublicKey: CK_OBJECT_HANDLE_PTR,
        phPrivateKey: CK_OBJECT_HANDLE_PTR,
    );
    C_WrapKey(
        hSession: CK_SESSION_HANDLE,
        pMechanism: CK_MECHANISM_PTR,
        hWrappingKey: CK_OBJECT_HANDLE,
        hKey: CK_OBJECT_HANDLE,
        pWrappedKey: CK_BYTE_PTR,
        pulWrappedKeyLen: CK_ULONG_PTR,
    );
    C_UnwrapKey(
        hSession: CK_SESSION_HANDLE,
        pMechanism: CK_MECHANISM_PTR,
        hUnwrappingKey: CK_OBJECT_HANDLE,
        pWrappedKey: CK_BYTE_PTR,
        ulWrappedKeyLen: CK_ULONG,
        pTemplate: CK_ATTRIBUTE_PTR,
        ulAttributeCount: CK_ULONG,
        phKey: CK_OBJECT_HANDLE_PTR,
    );
    C_DeriveKey(
        hSession: CK_SESSION_HANDLE,
        pMechanism: CK_MECHANISM_PTR,
        hBaseKey: CK_OBJECT_HANDLE,
        pTemplate: CK_ATTRIBUTE_PTR,
        ulAttributeCount: CK_ULONG,
        phKey: CK_OBJECT_HANDLE_PTR,
    );
    C_SeedRandom(hSession: CK_SESSION_HANDLE, pSeed: CK_BYTE_PTR, ulSeedLen: CK_ULONG);
    C_GenerateRandom(hSession: CK_SESSION_HANDLE, RandomData: CK_BYTE_PTR, ulRandomLen: CK_ULONG);
}

/// A dynamically loaded PKCS#11 driver and the function table it exported.
pub struct Pkcs11Lib {
    functions: *const CK_FUNCTION_LIST,
    // we need to keep the library alive
    _library: Library,
}

// SAFETY: the function table is immutable once returned by the driver, and
// drivers initialized with CKF_OS_LOCKING_OK are safe to call from any thread.
unsafe impl Send for Pkcs11Lib {}
unsafe impl Sync for Pkcs11Lib {}

impl Pkcs11Lib {
    /// Open the driver at `path` and resolve its function table through
    /// `C_GetFunctionList`.
    pub fn load<P>(path: P) -> PResult<Self>
    where
        P: AsRef<OsStr>,
    {
        let path = path.as_ref();
        info!("Loading PKCS#11 library {}", path.to_string_lossy());
        let library = unsafe { Library::new(path) }?;
        let mut functions: CK_FUNCTION_LIST_PTR = ptr::null_mut();
        let rv = {
            let get_function_list = unsafe {
                library.get::<unsafe extern "C" fn(CK_FUNCTION_LIST_PTR_PTR) -> CK_RV>(
                    b"C_GetFunctionList",
                )
            }?;
            unsafe { get_function_list(&raw mut functions) }
        };
        if rv != CKR_OK {
            return Err(PError::LibraryLoad(format!(
                "C_GetFunctionList failed: {} (0x{rv:08X})",
                rv_name(rv)
            )));
        }
        if functions.is_null() {
            return Err(PError::LibraryLoad(
                "C_GetFunctionList returned a null function table".to_owned(),
            ));
        }
        let version = unsafe { (*functions).version };
        ensure_supported_version(version)?;
        debug!(
            "Resolved Cryptoki function table v{}.{}",
            version.major, version.minor
        );
        Ok(Self {
            functions,
            _library: library,
        })
    }
}

/// Only the v2.x function table layout is understood.
pub(crate) fn ensure_supported_version(version: CK_VERSION) -> PResult<()> {
    if version.major == 2 {
        Ok(())
    } else {
        Err(PError::LibraryLoad(format!(
            "unsupported Cryptoki function table version {}.{}",
            version.major, version.minor
        )))
    }
}

#[cfg(test)]
mod tests {
    use pkcs11_sys::CK_VERSION;

    use super::{Pkcs11Lib, ensure_supported_version};
    use crate::PError;

    #[test]
    fn rejects_missing_library() {
        let result = Pkcs11Lib::load("/nonexistent/dir/libnotapkcs11.so");
        assert!(matches!(result, Err(PError::LibraryLoad(_))));
    }

    #[test]
    fn only_v2_tables_are_accepted() {
        assert!(ensure_supported_version(CK_VERSION { major: 2, minor: 40 }).is_ok());
        assert!(matches!(
            ensure_supported_version(CK_VERSION { major: 3, minor: 0 }),
            Err(PError::LibraryLoad(_))
        ));
        assert!(matches!(
            ensure_supported_version(CK_VERSION { major: 1, minor: 0 }),
            Err(PError::LibraryLoad(_))
        ));
    }
}
