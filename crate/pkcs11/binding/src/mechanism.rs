//! Mechanism descriptors and their encoding into `CK_MECHANISM`.

use std::{mem::size_of, ptr};

use pkcs11_sys::*;

use crate::{PError, PResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MechanismParameter {
    /// Raw parameter bytes, e.g. a CBC initialization vector
    Bytes(Vec<u8>),
    /// `CK_ECDH1_DERIVE_PARAMS`
    Ecdh1Derive {
        kdf: CK_EC_KDF_TYPE,
        shared_data: Option<Vec<u8>>,
        public_data: Vec<u8>,
    },
    /// `CK_RSA_PKCS_OAEP_PARAMS`, with `CKZ_DATA_SPECIFIED` as source
    RsaOaep {
        hash_alg: CK_MECHANISM_TYPE,
        mgf: CK_RSA_PKCS_MGF_TYPE,
        source_data: Option<Vec<u8>>,
    },
    /// `CK_RSA_PKCS_PSS_PARAMS`
    RsaPss {
        hash_alg: CK_MECHANISM_TYPE,
        mgf: CK_RSA_PKCS_MGF_TYPE,
        salt_len: CK_ULONG,
    },
}

impl MechanismParameter {
    const fn shape(&self) -> ParameterShape {
        match self {
            Self::Bytes(_) => ParameterShape::Bytes,
            Self::Ecdh1Derive { .. } => ParameterShape::Ecdh1Derive,
            Self::RsaOaep { .. } => ParameterShape::RsaOaep,
            Self::RsaPss { .. } => ParameterShape::RsaPss,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mechanism {
    pub mechanism_type: CK_MECHANISM_TYPE,
    pub parameter: Option<MechanismParameter>,
}

impl Mechanism {
    #[must_use]
    pub const fn new(mechanism_type: CK_MECHANISM_TYPE) -> Self {
        Self {
            mechanism_type,
            parameter: None,
        }
    }

    #[must_use]
    pub const fn with_parameter(
        mechanism_type: CK_MECHANISM_TYPE,
        parameter: MechanismParameter,
    ) -> Self {
        Self {
            mechanism_type,
            parameter: Some(parameter),
        }
    }

    /// A mechanism taking an initialization vector, e.g. `CKM_AES_CBC`
    pub fn with_iv(mechanism_type: CK_MECHANISM_TYPE, iv: impl Into<Vec<u8>>) -> Self {
        Self::with_parameter(mechanism_type, MechanismParameter::Bytes(iv.into()))
    }
}

/// Parameter layout accepted by a mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterShape {
    None,
    Bytes,
    Ecdh1Derive,
    RsaOaep,
    RsaPss,
}

/// Parameter layout of the known mechanisms; `None` for mechanisms this
/// layer knows nothing about, which only accept raw bytes.
#[must_use]
pub const fn parameter_shape(mechanism_type: CK_MECHANISM_TYPE) -> Option<ParameterShape> {
    let shape = match mechanism_type {
        CKM_ECDH1_DERIVE | CKM_ECDH1_COFACTOR_DERIVE => ParameterShape::Ecdh1Derive,
        CKM_RSA_PKCS_OAEP => ParameterShape::RsaOaep,
        CKM_RSA_PKCS_PSS
        | CKM_SHA1_RSA_PKCS_PSS
        | CKM_SHA256_RSA_PKCS_PSS
        | CKM_SHA384_RSA_PKCS_PSS
        | CKM_SHA512_RSA_PKCS_PSS => ParameterShape::RsaPss,
        CKM_AES_CBC | CKM_AES_CBC_PAD | CKM_DES3_CBC | CKM_DES3_CBC_PAD | CKM_AES_KEY_WRAP
        | CKM_AES_KEY_WRAP_PAD => ParameterShape::Bytes,
        CKM_RSA_PKCS_KEY_PAIR_GEN
        | CKM_EC_KEY_PAIR_GEN
        | CKM_AES_KEY_GEN
        | CKM_DES3_KEY_GEN
        | CKM_GENERIC_SECRET_KEY_GEN
        | CKM_RSA_PKCS
        | CKM_RSA_X_509
        | CKM_SHA1_RSA_PKCS
        | CKM_SHA256_RSA_PKCS
        | CKM_SHA384_RSA_PKCS
        | CKM_SHA512_RSA_PKCS
        | CKM_ECDSA
        | CKM_ECDSA_SHA1
        | CKM_SHA_1
        | CKM_SHA256
        | CKM_SHA384
        | CKM_SHA512
        | CKM_SHA256_HMAC
        | CKM_AES_ECB => ParameterShape::None,
        _ => return None,
    };
    Some(shape)
}

/// Owned backing store of a native parameter. Structures are boxed and the
/// nested buffers are heap allocated, so the pointers stored in `raw` stay
/// valid when the encoded mechanism moves.
enum ParameterStorage {
    None,
    Bytes(Vec<u8>),
    Ecdh1Derive {
        _params: Box<CK_ECDH1_DERIVE_PARAMS>,
        _shared_data: Vec<u8>,
        _public_data: Vec<u8>,
    },
    RsaOaep {
        _params: Box<CK_RSA_PKCS_OAEP_PARAMS>,
        _source_data: Vec<u8>,
    },
    RsaPss(Box<CK_RSA_PKCS_PSS_PARAMS>),
}

/// A `CK_MECHANISM` together with everything it points to; it must outlive
/// the native call it is passed to.
pub struct EncodedMechanism {
    raw: CK_MECHANISM,
    _storage: ParameterStorage,
}

impl EncodedMechanism {
    pub fn as_mut_ptr(&mut self) -> CK_MECHANISM_PTR {
        &raw mut self.raw
    }

    #[must_use]
    pub const fn mechanism_type(&self) -> CK_MECHANISM_TYPE {
        self.raw.mechanism
    }
}

fn buffer_parts(buffer: &mut Vec<u8>) -> PResult<(CK_BYTE_PTR, CK_ULONG)> {
    if buffer.is_empty() {
        Ok((ptr::null_mut(), 0))
    } else {
        Ok((buffer.as_mut_ptr(), CK_ULONG::try_from(buffer.len())?))
    }
}

fn struct_len<T>() -> PResult<CK_ULONG> {
    Ok(CK_ULONG::try_from(size_of::<T>())?)
}

/// Lay out a mechanism for the driver.
///
/// Structured parameters are checked against the mechanism's parameter
/// shape: a structure the mechanism does not take is an
/// [`PError::UnsupportedMechanism`]; raw bytes for a mechanism which takes a
/// structure (or nothing) are [`PError::ArgumentsBad`].
pub fn encode(mechanism: &Mechanism) -> PResult<EncodedMechanism> {
    let mechanism_type = mechanism.mechanism_type;
    let expected = parameter_shape(mechanism_type);
    if let Some(parameter) = &mechanism.parameter {
        let given = parameter.shape();
        match (given, expected) {
            (ParameterShape::Bytes, None | Some(ParameterShape::Bytes)) => {}
            (ParameterShape::Bytes, Some(expected)) => {
                return Err(PError::ArgumentsBad {
                    context: format!(
                        "mechanism 0x{mechanism_type:08X} expects a {expected:?} parameter, not raw \
                         bytes"
                    ),
                    rv: None,
                });
            }
            (given, expected) if Some(given) != expected => {
                return Err(PError::UnsupportedMechanism(format!(
                    "mechanism 0x{mechanism_type:08X} does not take a {given:?} parameter"
                )));
            }
            _ => {}
        }
    }

    let (pParameter, ulParameterLen, storage): (CK_VOID_PTR, CK_ULONG, ParameterStorage) =
        match &mechanism.parameter {
            None => (ptr::null_mut(), 0, ParameterStorage::None),
            Some(MechanismParameter::Bytes(bytes)) => {
                let mut bytes = bytes.clone();
                let (pointer, len) = buffer_parts(&mut bytes)?;
                (pointer.cast(), len, ParameterStorage::Bytes(bytes))
            }
            Some(MechanismParameter::Ecdh1Derive {
                kdf,
                shared_data,
                public_data,
            }) => {
                let mut shared_data = shared_data.clone().unwrap_or_default();
                let mut public_data = public_data.clone();
                let (pSharedData, ulSharedDataLen) = buffer_parts(&mut shared_data)?;
                let (pPublicData, ulPublicDataLen) = buffer_parts(&mut public_data)?;
                let mut params = Box::new(CK_ECDH1_DERIVE_PARAMS {
                    kdf: *kdf,
                    ulSharedDataLen,
                    pSharedData,
                    ulPublicDataLen,
                    pPublicData,
                });
                (
                    (&raw mut *params).cast(),
                    struct_len::<CK_ECDH1_DERIVE_PARAMS>()?,
                    ParameterStorage::Ecdh1Derive {
                        _params: params,
                        _shared_data: shared_data,
                        _public_data: public_data,
                    },
                )
            }
            Some(MechanismParameter::RsaOaep {
                hash_alg,
                mgf,
                source_data,
            }) => {
                let mut source_data = source_data.clone().unwrap_or_default();
                let (pSourceData, ulSourceDataLen) = buffer_parts(&mut source_data)?;
                let mut params = Box::new(CK_RSA_PKCS_OAEP_PARAMS {
                    hashAlg: *hash_alg,
                    mgf: *mgf,
                    source: CKZ_DATA_SPECIFIED,
                    pSourceData: pSourceData.cast(),
                    ulSourceDataLen,
                });
                (
                    (&raw mut *params).cast(),
                    struct_len::<CK_RSA_PKCS_OAEP_PARAMS>()?,
                    ParameterStorage::RsaOaep {
                        _params: params,
                        _source_data: source_data,
                    },
                )
            }
            Some(MechanismParameter::RsaPss {
                hash_alg,
                mgf,
                salt_len,
            }) => {
                let mut params = Box::new(CK_RSA_PKCS_PSS_PARAMS {
                    hashAlg: *hash_alg,
                    mgf: *mgf,
                    sLen: *salt_len,
                });
                (
                    (&raw mut *params).cast(),
                    struct_len::<CK_RSA_PKCS_PSS_PARAMS>()?,
                    ParameterStorage::RsaPss(params),
                )
            }
        };

    Ok(EncodedMechanism {
        raw: CK_MECHANISM {
            mechanism: mechanism_type,
            pParameter,
            ulParameterLen,
        },
        _storage: storage,
    })
}
