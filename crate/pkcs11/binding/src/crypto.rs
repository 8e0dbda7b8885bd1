//! Streaming and single-shot digest, encryption and signature operations.
//!
//! Each kind of operation follows Init → Update* → Final on its session.
//! Sequencing errors are caught here, before the driver is called.

use std::ptr;

use pkcs11_sys::{CK_BYTE_PTR, CK_RV, CK_SESSION_HANDLE, CK_ULONG, CK_ULONG_PTR, CKR_OK};
use tracing::{trace, warn};
use zeroize::Zeroizing;

use crate::{
    Mechanism, Module, ObjectHandle, OperationKind, OperationState, PError, PResult,
    SessionHandle,
    error::rv_name,
    loader::FunctionList,
    mechanism::encode,
    operation::call_with_output,
};

fn input_len(input: &[u8]) -> PResult<CK_ULONG> {
    Ok(CK_ULONG::try_from(input.len())?)
}

impl Module {
    fn operation_init(
        &self,
        session: SessionHandle,
        kind: OperationKind,
        mechanism: &Mechanism,
        key: Option<ObjectHandle>,
    ) -> PResult<()> {
        let mut encoded = encode(mechanism)?;
        self.with_session(session, |state| {
            state.operations.ensure_idle(kind)?;
            let key = match key {
                Some(key) => Some(self.resolve_object(state, key)?),
                None => None,
            };
            let native = state.native;
            let mechanism_ptr = encoded.as_mut_ptr();
            match (kind, key) {
                (OperationKind::Digest, _) => p11_call!(
                    self.functions,
                    "Failed initializing digest",
                    C_DigestInit,
                    native,
                    mechanism_ptr
                ),
                (OperationKind::Encrypt, Some(key)) => p11_call!(
                    self.functions,
                    "Failed initializing encryption",
                    C_EncryptInit,
                    native,
                    mechanism_ptr,
                    key
                ),
                (OperationKind::Decrypt, Some(key)) => p11_call!(
                    self.functions,
                    "Failed initializing decryption",
                    C_DecryptInit,
                    native,
                    mechanism_ptr,
                    key
                ),
                (OperationKind::Sign, Some(key)) => p11_call!(
                    self.functions,
                    "Failed initializing signature",
                    C_SignInit,
                    native,
                    mechanism_ptr,
                    key
                ),
                (OperationKind::Verify, Some(key)) => p11_call!(
                    self.functions,
                    "Failed initializing verification",
                    C_VerifyInit,
                    native,
                    mechanism_ptr,
                    key
                ),
                (kind, None) => Err(PError::ArgumentsBad {
                    context: format!("a {kind} operation requires a key"),
                    rv: None,
                }),
            }?;
            state.operations.activate(kind);
            trace!(
                "{session}: {kind} initialized with mechanism 0x{:08X}",
                encoded.mechanism_type()
            );
            Ok(())
        })
    }

    /// An update call writing into `output`.
    fn update_into(
        &self,
        session: SessionHandle,
        kind: OperationKind,
        context: &str,
        output: &mut [u8],
        call: impl FnOnce(CK_SESSION_HANDLE, CK_BYTE_PTR, CK_ULONG_PTR) -> CK_RV,
    ) -> PResult<usize> {
        self.with_session(session, |state| {
            state.operations.ensure_initialized(kind)?;
            let native = state.native;
            let result = call_with_output(output, context, |out, len| call(native, out, len));
            state.operations.settle_update(kind, &result);
            result
        })
    }

    /// An update call consuming input only.
    fn update_input(
        &self,
        session: SessionHandle,
        kind: OperationKind,
        call: impl FnOnce(CK_SESSION_HANDLE) -> PResult<()>,
    ) -> PResult<()> {
        self.with_session(session, |state| {
            state.operations.ensure_initialized(kind)?;
            let result = call(state.native);
            state.operations.settle_update(kind, &result);
            result
        })
    }

    /// A final call writing into `output`. The operation is idle afterwards
    /// whatever the outcome. When the buffer is too small, the result is
    /// drained into a scratch buffer so that the driver ends the operation
    /// too, and the required size is reported. A driver which does not
    /// report that size is asked for it with a length query first.
    fn final_into(
        &self,
        session: SessionHandle,
        kind: OperationKind,
        context: &str,
        output: &mut [u8],
        call: impl Fn(CK_SESSION_HANDLE, CK_BYTE_PTR, CK_ULONG_PTR) -> CK_RV,
    ) -> PResult<usize> {
        self.with_session(session, |state| {
            state.operations.ensure_initialized(kind)?;
            let native = state.native;
            let _finishing = state.operations.finishing(kind);
            match call_with_output(output, context, |out, len| call(native, out, len)) {
                Err(PError::BufferTooSmall { context, required }) => {
                    let required = required.or_else(|| {
                        let mut len: CK_ULONG = 0;
                        let rv = call(native, ptr::null_mut(), &raw mut len);
                        if rv == CKR_OK {
                            usize::try_from(len).ok()
                        } else {
                            warn!("{kind} final length query failed: {}", rv_name(rv));
                            None
                        }
                    });
                    if let Some(required) = required {
                        let mut scratch = Zeroizing::new(vec![0_u8; required]);
                        if let Err(e) = call_with_output(&mut scratch, &context, |out, len| {
                            call(native, out, len)
                        }) {
                            warn!("{kind} final could not be drained: {e}");
                        }
                    }
                    Err(PError::BufferTooSmall { context, required })
                }
                result => result,
            }
        })
    }

    /// A single-shot call (`C_Encrypt`, `C_Sign`...) on an initialized
    /// operation. Only an undersized buffer leaves the operation running.
    fn single_into(
        &self,
        session: SessionHandle,
        kind: OperationKind,
        context: &str,
        output: &mut [u8],
        call: impl FnOnce(CK_SESSION_HANDLE, CK_BYTE_PTR, CK_ULONG_PTR) -> CK_RV,
    ) -> PResult<usize> {
        self.with_session(session, |state| {
            state.operations.ensure_initialized(kind)?;
            let native = state.native;
            let result = call_with_output(output, context, |out, len| call(native, out, len));
            state.operations.settle_single(kind, &result);
            result
        })
    }

    /// State of the `kind` operation on `session`
    pub fn operation_state(
        &self,
        session: SessionHandle,
        kind: OperationKind,
    ) -> PResult<OperationState> {
        self.with_session(session, |state| Ok(state.operations.state(kind)))
    }

    // Digest

    pub fn digest_init(&self, session: SessionHandle, mechanism: &Mechanism) -> PResult<()> {
        self.operation_init(session, OperationKind::Digest, mechanism, None)
    }

    pub fn digest_update(&self, session: SessionHandle, data: &[u8]) -> PResult<()> {
        let len = input_len(data)?;
        self.update_input(session, OperationKind::Digest, |native| {
            p11_call!(
                self.functions,
                "Failed digesting data",
                C_DigestUpdate,
                native,
                data.as_ptr().cast_mut(),
                len
            )
        })
    }

    /// Feed the value of a secret key into the running digest.
    pub fn digest_key(&self, session: SessionHandle, key: ObjectHandle) -> PResult<()> {
        self.with_session(session, |state| {
            state.operations.ensure_initialized(OperationKind::Digest)?;
            let key = self.resolve_object(state, key)?;
            let result = p11_call!(
                self.functions,
                "Failed digesting key",
                C_DigestKey,
                state.native,
                key
            );
            state.operations.settle_update(OperationKind::Digest, &result);
            result
        })
    }

    pub fn digest_final(&self, session: SessionHandle, output: &mut [u8]) -> PResult<usize> {
        let functions = &*self.functions;
        self.final_into(
            session,
            OperationKind::Digest,
            "Failed finalizing digest",
            output,
            |native, out, len| unsafe { functions.C_DigestFinal(native, out, len) },
        )
    }

    pub fn digest(&self, session: SessionHandle, data: &[u8], output: &mut [u8]) -> PResult<usize> {
        let data_len = input_len(data)?;
        let functions = &*self.functions;
        self.single_into(
            session,
            OperationKind::Digest,
            "Failed digesting",
            output,
            |native, out, len| unsafe {
                functions.C_Digest(native, data.as_ptr().cast_mut(), data_len, out, len)
            },
        )
    }

    // Encryption

    pub fn encrypt_init(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        key: ObjectHandle,
    ) -> PResult<()> {
        self.operation_init(session, OperationKind::Encrypt, mechanism, Some(key))
    }

    pub fn encrypt_update(
        &self,
        session: SessionHandle,
        data: &[u8],
        output: &mut [u8],
    ) -> PResult<usize> {
        let data_len = input_len(data)?;
        let functions = &*self.functions;
        self.update_into(
            session,
            OperationKind::Encrypt,
            "Failed encrypting data",
            output,
            |native, out, len| unsafe {
                functions.C_EncryptUpdate(native, data.as_ptr().cast_mut(), data_len, out, len)
            },
        )
    }

    pub fn encrypt_final(&self, session: SessionHandle, output: &mut [u8]) -> PResult<usize> {
        let functions = &*self.functions;
        self.final_into(
            session,
            OperationKind::Encrypt,
            "Failed finalizing encryption",
            output,
            |native, out, len| unsafe { functions.C_EncryptFinal(native, out, len) },
        )
    }

    pub fn encrypt(&self, session: SessionHandle, data: &[u8], output: &mut [u8]) -> PResult<usize> {
        let data_len = input_len(data)?;
        let functions = &*self.functions;
        self.single_into(
            session,
            OperationKind::Encrypt,
            "Failed encrypting",
            output,
            |native, out, len| unsafe {
                functions.C_Encrypt(native, data.as_ptr().cast_mut(), data_len, out, len)
            },
        )
    }

    // Decryption

    pub fn decrypt_init(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        key: ObjectHandle,
    ) -> PResult<()> {
        self.operation_init(session, OperationKind::Decrypt, mechanism, Some(key))
    }

    pub fn decrypt_update(
        &self,
        session: SessionHandle,
        data: &[u8],
        output: &mut [u8],
    ) -> PResult<usize> {
        let data_len = input_len(data)?;
        let functions = &*self.functions;
        self.update_into(
            session,
            OperationKind::Decrypt,
            "Failed decrypting data",
            output,
            |native, out, len| unsafe {
                functions.C_DecryptUpdate(native, data.as_ptr().cast_mut(), data_len, out, len)
            },
        )
    }

    pub fn decrypt_final(&self, session: SessionHandle, output: &mut [u8]) -> PResult<usize> {
        let functions = &*self.functions;
        self.final_into(
            session,
            OperationKind::Decrypt,
            "Failed finalizing decryption",
            output,
            |native, out, len| unsafe { functions.C_DecryptFinal(native, out, len) },
        )
    }

    pub fn decrypt(&self, session: SessionHandle, data: &[u8], output: &mut [u8]) -> PResult<usize> {
        let data_len = input_len(data)?;
        let functions = &*self.functions;
        self.single_into(
            session,
            OperationKind::Decrypt,
            "Failed decrypting",
            output,
            |native, out, len| unsafe {
                functions.C_Decrypt(native, data.as_ptr().cast_mut(), data_len, out, len)
            },
        )
    }

    // Signature

    pub fn sign_init(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        key: ObjectHandle,
    ) -> PResult<()> {
        self.operation_init(session, OperationKind::Sign, mechanism, Some(key))
    }

    pub fn sign_update(&self, session: SessionHandle, data: &[u8]) -> PResult<()> {
        let len = input_len(data)?;
        self.update_input(session, OperationKind::Sign, |native| {
            p11_call!(
                self.functions,
                "Failed signing data",
                C_SignUpdate,
                native,
                data.as_ptr().cast_mut(),
                len
            )
        })
    }

    pub fn sign_final(&self, session: SessionHandle, output: &mut [u8]) -> PResult<usize> {
        let functions = &*self.functions;
        self.final_into(
            session,
            OperationKind::Sign,
            "Failed finalizing signature",
            output,
            |native, out, len| unsafe { functions.C_SignFinal(native, out, len) },
        )
    }

    pub fn sign(&self, session: SessionHandle, data: &[u8], output: &mut [u8]) -> PResult<usize> {
        let data_len = input_len(data)?;
        let functions = &*self.functions;
        self.single_into(
            session,
            OperationKind::Sign,
            "Failed signing",
            output,
            |native, out, len| unsafe {
                functions.C_Sign(native, data.as_ptr().cast_mut(), data_len, out, len)
            },
        )
    }

    // Verification

    pub fn verify_init(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        key: ObjectHandle,
    ) -> PResult<()> {
        self.operation_init(session, OperationKind::Verify, mechanism, Some(key))
    }

    pub fn verify_update(&self, session: SessionHandle, data: &[u8]) -> PResult<()> {
        let len = input_len(data)?;
        self.update_input(session, OperationKind::Verify, |native| {
            p11_call!(
                self.functions,
                "Failed verifying data",
                C_VerifyUpdate,
                native,
                data.as_ptr().cast_mut(),
                len
            )
        })
    }

    /// Check `signature` against the data streamed so far: `Ok(())` or
    /// [`PError::SignatureInvalid`].
    pub fn verify_final(&self, session: SessionHandle, signature: &[u8]) -> PResult<()> {
        let signature_len = input_len(signature)?;
        self.with_session(session, |state| {
            state.operations.ensure_initialized(OperationKind::Verify)?;
            let native = state.native;
            let _finishing = state.operations.finishing(OperationKind::Verify);
            p11_call!(
                self.functions,
                "Verification failed",
                C_VerifyFinal,
                native,
                signature.as_ptr().cast_mut(),
                signature_len
            )
        })
    }

    /// Single-shot verification of `data` against `signature`.
    pub fn verify(&self, session: SessionHandle, data: &[u8], signature: &[u8]) -> PResult<()> {
        let data_len = input_len(data)?;
        let signature_len = input_len(signature)?;
        self.with_session(session, |state| {
            state.operations.ensure_initialized(OperationKind::Verify)?;
            let native = state.native;
            let _finishing = state.operations.finishing(OperationKind::Verify);
            p11_call!(
                self.functions,
                "Verification failed",
                C_Verify,
                native,
                data.as_ptr().cast_mut(),
                data_len,
                signature.as_ptr().cast_mut(),
                signature_len
            )
        })
    }
}
