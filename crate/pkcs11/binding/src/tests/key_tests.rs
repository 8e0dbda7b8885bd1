use pkcs11_sys::{
    CKA_CLASS, CKA_DERIVE, CKA_EC_PARAMS, CKA_EC_POINT, CKA_ENCRYPT, CKA_EXTRACTABLE,
    CKA_KEY_TYPE, CKA_LABEL, CKA_MODULUS, CKA_MODULUS_BITS, CKA_PRIVATE_EXPONENT,
    CKA_PUBLIC_EXPONENT, CKA_SENSITIVE, CKA_SIGN, CKA_TOKEN, CKA_VALUE, CKA_VALUE_LEN,
    CKA_VERIFY, CKD_SHA1_KDF, CKK_AES, CKM_AES_KEY_GEN, CKM_AES_KEY_WRAP, CKM_EC_KEY_PAIR_GEN,
    CKM_ECDH1_DERIVE, CKM_RSA_PKCS_KEY_PAIR_GEN, CKO_PRIVATE_KEY, CKO_PUBLIC_KEY, CKO_SECRET_KEY,
    CKR_FUNCTION_FAILED, CKR_TEMPLATE_INCOMPLETE, CKR_WRAPPED_KEY_INVALID,
};

use super::{Fixture, aes_key, fixture};
use crate::{Attribute, KeyPair, Mechanism, MechanismParameter, PError, PResult};

/// DER encoded OID of the P-256 curve
const P256_PARAMS: &str = "06082A8648CE3D030107";

fn ec_key_pair(f: &Fixture) -> PResult<KeyPair> {
    let params = hex::decode(P256_PARAMS).map_err(|e| PError::Default(e.to_string()))?;
    f.module.generate_key_pair(
        f.session,
        &Mechanism::new(CKM_EC_KEY_PAIR_GEN),
        &[
            Attribute::ulong(CKA_CLASS, CKO_PUBLIC_KEY),
            Attribute::bool(CKA_TOKEN, false),
            Attribute::bytes(CKA_EC_PARAMS, params),
        ],
        &[
            Attribute::ulong(CKA_CLASS, CKO_PRIVATE_KEY),
            Attribute::bool(CKA_TOKEN, false),
            Attribute::bool(CKA_DERIVE, true),
        ],
    )
}

fn derived_aes_template(sensitive: bool) -> Vec<Attribute> {
    vec![
        Attribute::ulong(CKA_CLASS, CKO_SECRET_KEY),
        Attribute::bool(CKA_TOKEN, false),
        Attribute::ulong(CKA_KEY_TYPE, CKK_AES),
        Attribute::bytes(CKA_LABEL, "derived"),
        Attribute::bool(CKA_ENCRYPT, true),
        Attribute::bool(CKA_SENSITIVE, sensitive),
        Attribute::ulong(CKA_VALUE_LEN, 32),
    ]
}

fn ecdh(public_data: Vec<u8>) -> Mechanism {
    Mechanism::with_parameter(
        CKM_ECDH1_DERIVE,
        MechanismParameter::Ecdh1Derive {
            kdf: CKD_SHA1_KDF,
            shared_data: None,
            public_data,
        },
    )
}

fn public_point(f: &Fixture, keys: &KeyPair) -> PResult<Vec<u8>> {
    let point = f
        .module
        .get_attribute_value(f.session, keys.public_key, &[CKA_EC_POINT])?;
    point[0]
        .as_bytes()
        .map(<[u8]>::to_vec)
        .ok_or_else(|| PError::Default("no EC point".to_owned()))
}

#[test]
fn generate_key_template_errors() -> PResult<()> {
    let f = fixture()?;
    let err = f
        .module
        .generate_key(
            f.session,
            &Mechanism::new(CKM_AES_KEY_GEN),
            &[
                Attribute::ulong(CKA_CLASS, CKO_SECRET_KEY),
                Attribute::bool(CKA_TOKEN, false),
            ],
        )
        .unwrap_err();
    assert!(matches!(err, PError::ArgumentsBad { .. }));
    assert_eq!(err.rv(), Some(CKR_TEMPLATE_INCOMPLETE));
    assert_eq!(f.driver.object_count(), 0);
    Ok(())
}

#[test]
fn rsa_key_pair_attributes() -> PResult<()> {
    let f = fixture()?;
    let keys = f.module.generate_key_pair(
        f.session,
        &Mechanism::new(CKM_RSA_PKCS_KEY_PAIR_GEN),
        &[
            Attribute::bool(CKA_TOKEN, false),
            Attribute::bytes(CKA_PUBLIC_EXPONENT, [1_u8, 0, 1]),
            Attribute::ulong(CKA_MODULUS_BITS, 1024),
            Attribute::bool(CKA_VERIFY, true),
        ],
        &[
            Attribute::bool(CKA_TOKEN, false),
            Attribute::bool(CKA_SIGN, true),
        ],
    )?;
    assert_ne!(keys.public_key, keys.private_key);

    let public = f.module.get_attribute_value(
        f.session,
        keys.public_key,
        &[CKA_CLASS, CKA_MODULUS, CKA_PUBLIC_EXPONENT],
    )?;
    assert_eq!(public[0].as_ulong(), Some(CKO_PUBLIC_KEY));
    assert_eq!(public[1].as_bytes().map(<[u8]>::len), Some(128));
    assert_eq!(public[2].as_bytes(), Some(&[1_u8, 0, 1][..]));

    // the private exponent stays inside the token
    let private = f.module.get_attribute_value(
        f.session,
        keys.private_key,
        &[CKA_MODULUS, CKA_PRIVATE_EXPONENT],
    )?;
    assert_eq!(private[0].as_bytes(), public[1].as_bytes());
    assert_eq!(private[1].attr_type, CKA_PRIVATE_EXPONENT);
    assert_eq!(private[1].value, None);
    Ok(())
}

#[test]
fn ecdh_derivation() -> PResult<()> {
    let f = fixture()?;
    let keys = ec_key_pair(&f)?;
    let point = public_point(&f, &keys)?;
    assert_eq!(point.len(), 65);
    assert_eq!(point[0], 0x04);

    let mut extra = [0_u8; 32];
    let derived = f.module.derive_key(
        f.session,
        &ecdh(point.clone()),
        keys.private_key,
        &derived_aes_template(false),
        Some(&mut extra[..]),
    )?;
    assert_eq!(derived.value_len, Some(32));
    assert!(extra.iter().any(|b| *b != 0));

    // the parameter structure reached the driver intact
    let record = f
        .driver
        .last_derive()
        .ok_or_else(|| PError::Default("no derive".to_owned()))?;
    assert_eq!(record.kdf, CKD_SHA1_KDF);
    assert!(record.shared_data.is_empty());
    assert_eq!(record.public_data, point);

    let value = f
        .module
        .get_attribute_value(f.session, derived.key, &[CKA_VALUE, CKA_KEY_TYPE])?;
    assert_eq!(value[0].as_bytes(), Some(&extra[..]));
    assert_eq!(value[1].as_ulong(), Some(CKK_AES));
    Ok(())
}

#[test]
fn derivation_value_buffer() -> PResult<()> {
    let f = fixture()?;
    let keys = ec_key_pair(&f)?;
    let point = public_point(&f, &keys)?;
    let objects = f.driver.object_count();

    // too small: the derived key is destroyed again
    let mut short = [0_u8; 16];
    let err = f
        .module
        .derive_key(
            f.session,
            &ecdh(point.clone()),
            keys.private_key,
            &derived_aes_template(false),
            Some(&mut short[..]),
        )
        .unwrap_err();
    assert!(matches!(err, PError::BufferTooSmall {
        required: Some(32),
        ..
    }));
    assert_eq!(f.driver.object_count(), objects);

    let derived = f.module.derive_key(
        f.session,
        &ecdh(point.clone()),
        keys.private_key,
        &derived_aes_template(false),
        None,
    )?;
    assert_eq!(derived.value_len, None);

    // a sensitive value cannot be copied out
    let mut extra = [0_u8; 32];
    let derived = f.module.derive_key(
        f.session,
        &ecdh(point),
        keys.private_key,
        &derived_aes_template(true),
        Some(&mut extra[..]),
    )?;
    assert_eq!(derived.value_len, None);
    assert_eq!(extra, [0_u8; 32]);
    Ok(())
}

#[test]
fn unreadable_derived_value_destroys_the_key() -> PResult<()> {
    let f = fixture()?;
    let keys = ec_key_pair(&f)?;
    let point = public_point(&f, &keys)?;
    let objects = f.driver.object_count();

    f.driver.fail_next("C_GetAttributeValue", CKR_FUNCTION_FAILED);
    let mut extra = [0_u8; 32];
    let err = f
        .module
        .derive_key(
            f.session,
            &ecdh(point),
            keys.private_key,
            &derived_aes_template(false),
            Some(&mut extra[..]),
        )
        .unwrap_err();
    assert!(matches!(err, PError::FunctionFailed { .. }));
    assert_eq!(err.rv(), Some(CKR_FUNCTION_FAILED));
    assert_eq!(f.driver.calls("C_DestroyObject"), 1);
    assert_eq!(f.driver.object_count(), objects);
    Ok(())
}

#[test]
fn derivation_needs_a_structured_parameter() -> PResult<()> {
    let f = fixture()?;
    let keys = ec_key_pair(&f)?;
    let calls = f.driver.calls("C_DeriveKey");
    let raw = Mechanism::with_parameter(CKM_ECDH1_DERIVE, MechanismParameter::Bytes(vec![1; 8]));
    assert!(matches!(
        f.module.derive_key(
            f.session,
            &raw,
            keys.private_key,
            &derived_aes_template(false),
            None
        ),
        Err(PError::ArgumentsBad { rv: None, .. })
    ));
    assert_eq!(f.driver.calls("C_DeriveKey"), calls);
    Ok(())
}

#[test]
fn wrap_and_unwrap() -> PResult<()> {
    let f = fixture()?;
    let wrapping_key = aes_key(&f, 32, "wrapping key")?;
    let key = aes_key(&f, 16, "wrapped key")?;
    let wrap = Mechanism::new(CKM_AES_KEY_WRAP);

    let err = f
        .module
        .wrap_key(f.session, &wrap, wrapping_key, key, &mut [0; 8])
        .unwrap_err();
    assert!(matches!(err, PError::BufferTooSmall {
        required: Some(24),
        ..
    }));

    let mut wrapped = [0_u8; 64];
    let len = f
        .module
        .wrap_key(f.session, &wrap, wrapping_key, key, &mut wrapped)?;
    assert_eq!(len, 24);

    let unwrapped = f.module.unwrap_key(
        f.session,
        &wrap,
        wrapping_key,
        &wrapped[..len],
        &[
            Attribute::ulong(CKA_CLASS, CKO_SECRET_KEY),
            Attribute::ulong(CKA_KEY_TYPE, CKK_AES),
            Attribute::bool(CKA_TOKEN, false),
            Attribute::bool(CKA_EXTRACTABLE, true),
            Attribute::bytes(CKA_LABEL, "unwrapped key"),
        ],
    )?;
    assert_ne!(unwrapped, key);
    let original = f.module.get_attribute_value(f.session, key, &[CKA_VALUE])?;
    let recovered = f
        .module
        .get_attribute_value(f.session, unwrapped, &[CKA_VALUE, CKA_VALUE_LEN])?;
    assert_eq!(recovered[0].as_bytes(), original[0].as_bytes());
    assert_eq!(recovered[1].as_ulong(), Some(16));

    // a corrupted blob is rejected by the driver
    wrapped[0] ^= 0xFF;
    let err = f
        .module
        .unwrap_key(f.session, &wrap, wrapping_key, &wrapped[..len], &[])
        .unwrap_err();
    assert_eq!(err.rv(), Some(CKR_WRAPPED_KEY_INVALID));
    Ok(())
}
