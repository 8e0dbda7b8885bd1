//! Single-shot key management: generation, derivation, wrapping.

use pkcs11_sys::{CK_OBJECT_HANDLE, CK_ULONG, CKA_VALUE};
use tracing::{debug, warn};

use crate::{
    Attribute, Mechanism, Module, ObjectHandle, PError, PResult, SessionHandle,
    attribute::{NativeTemplate, is_token_template},
    loader::FunctionList,
    mechanism::encode,
    object::read_attribute_values,
    operation::call_with_output,
};

/// The two halves of a generated key pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPair {
    pub public_key: ObjectHandle,
    pub private_key: ObjectHandle,
}

/// A derived key, and the length of its value when it was copied into the
/// caller's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivedKey {
    pub key: ObjectHandle,
    /// `None` when no buffer was given or the driver does not expose the
    /// value (sensitive or non-extractable key)
    pub value_len: Option<usize>,
}

impl Module {
    pub fn generate_key(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        template: &[Attribute],
    ) -> PResult<ObjectHandle> {
        let mut encoded = encode(mechanism)?;
        let mut native_template = NativeTemplate::new(template)?;
        self.with_session(session, |state| {
            let mut key: CK_OBJECT_HANDLE = 0;
            p11_call!(
                self.functions,
                "Failed generating key",
                C_GenerateKey,
                state.native,
                encoded.as_mut_ptr(),
                native_template.as_mut_ptr(),
                native_template.count()?,
                &raw mut key
            )?;
            let key = self.issue_object(state, key, is_token_template(template))?;
            debug!("Generated {key} with mechanism 0x{:08X}", mechanism.mechanism_type);
            Ok(key)
        })
    }

    pub fn generate_key_pair(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> PResult<KeyPair> {
        let mut encoded = encode(mechanism)?;
        let mut public_native = NativeTemplate::new(public_template)?;
        let mut private_native = NativeTemplate::new(private_template)?;
        self.with_session(session, |state| {
            let mut public_key: CK_OBJECT_HANDLE = 0;
            let mut private_key: CK_OBJECT_HANDLE = 0;
            p11_call!(
                self.functions,
                "Failed generating key pair",
                C_GenerateKeyPair,
                state.native,
                encoded.as_mut_ptr(),
                public_native.as_mut_ptr(),
                public_native.count()?,
                private_native.as_mut_ptr(),
                private_native.count()?,
                &raw mut public_key,
                &raw mut private_key
            )?;
            let key_pair = KeyPair {
                public_key: self.issue_object(
                    state,
                    public_key,
                    is_token_template(public_template),
                )?,
                private_key: self.issue_object(
                    state,
                    private_key,
                    is_token_template(private_template),
                )?,
            };
            debug!(
                "Generated key pair {} / {}",
                key_pair.public_key, key_pair.private_key
            );
            Ok(key_pair)
        })
    }

    /// Derive a key from `base_key`.
    ///
    /// When `extra` is given, the derived key's `CKA_VALUE` is copied into
    /// it if the driver exposes the value. A buffer too small for the value
    /// fails with [`PError::BufferTooSmall`]. On that error, or when the value
    /// cannot be read, the derived key is destroyed again so that the call has
    /// no lasting effect.
    pub fn derive_key(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        base_key: ObjectHandle,
        template: &[Attribute],
        extra: Option<&mut [u8]>,
    ) -> PResult<DerivedKey> {
        let mut encoded = encode(mechanism)?;
        let mut native_template = NativeTemplate::new(template)?;
        self.with_session(session, |state| {
            let base = self.resolve_object(state, base_key)?;
            let mut derived: CK_OBJECT_HANDLE = 0;
            p11_call!(
                self.functions,
                "Failed deriving key",
                C_DeriveKey,
                state.native,
                encoded.as_mut_ptr(),
                base,
                native_template.as_mut_ptr(),
                native_template.count()?,
                &raw mut derived
            )?;
            let key = self.issue_object(state, derived, is_token_template(template))?;
            debug!("Derived {key} from {base_key}");
            let Some(extra) = extra else {
                return Ok(DerivedKey {
                    key,
                    value_len: None,
                });
            };
            // the derived key must not outlive a failed call
            let native = state.native;
            let discard = || -> PResult<()> {
                if let Err(e) = p11_call!(
                    self.functions,
                    "Failed destroying the derived key",
                    C_DestroyObject,
                    native,
                    derived
                ) {
                    warn!("{e}");
                }
                self.release_object(key)
            };
            let read = read_attribute_values(&*self.functions, native, derived, &[CKA_VALUE]);
            let mut values = match read {
                Ok(values) => values,
                Err(e) => {
                    discard()?;
                    return Err(e);
                }
            };
            let Some(value) = values.pop().flatten() else {
                return Ok(DerivedKey {
                    key,
                    value_len: None,
                });
            };
            if value.len() > extra.len() {
                discard()?;
                return Err(PError::BufferTooSmall {
                    context: "derived key value".to_owned(),
                    required: Some(value.len()),
                });
            }
            extra[..value.len()].copy_from_slice(&value);
            Ok(DerivedKey {
                key,
                value_len: Some(value.len()),
            })
        })
    }

    /// Wrap (export encrypted) `key` with `wrapping_key` into `output`.
    pub fn wrap_key(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        wrapping_key: ObjectHandle,
        key: ObjectHandle,
        output: &mut [u8],
    ) -> PResult<usize> {
        let mut encoded = encode(mechanism)?;
        self.with_session(session, |state| {
            let wrapping = self.resolve_object(state, wrapping_key)?;
            let wrapped = self.resolve_object(state, key)?;
            let native = state.native;
            let functions = &*self.functions;
            call_with_output(output, "Failed wrapping key", |out, out_len| unsafe {
                functions.C_WrapKey(
                    native,
                    encoded.as_mut_ptr(),
                    wrapping,
                    wrapped,
                    out,
                    out_len,
                )
            })
        })
    }

    /// Unwrap (import) `wrapped` with `unwrapping_key` as a new key
    /// described by `template`.
    pub fn unwrap_key(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        unwrapping_key: ObjectHandle,
        wrapped: &[u8],
        template: &[Attribute],
    ) -> PResult<ObjectHandle> {
        let mut encoded = encode(mechanism)?;
        let mut native_template = NativeTemplate::new(template)?;
        self.with_session(session, |state| {
            let unwrapping = self.resolve_object(state, unwrapping_key)?;
            let mut key: CK_OBJECT_HANDLE = 0;
            p11_call!(
                self.functions,
                "Failed unwrapping key",
                C_UnwrapKey,
                state.native,
                encoded.as_mut_ptr(),
                unwrapping,
                wrapped.as_ptr().cast_mut(),
                CK_ULONG::try_from(wrapped.len())?,
                native_template.as_mut_ptr(),
                native_template.count()?,
                &raw mut key
            )?;
            self.issue_object(state, key, is_token_template(template))
        })
    }
}
