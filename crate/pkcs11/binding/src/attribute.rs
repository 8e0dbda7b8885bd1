//! Attribute descriptors and their native `CK_ATTRIBUTE` layout.

use std::{mem::size_of, ptr};

use pkcs11_sys::*;

use crate::{PError, PResult};

/// Value of `ulValueLen` for an attribute the driver cannot return.
pub const UNAVAILABLE_INFORMATION: CK_ULONG = CK_ULONG::MAX;

/// A `CK_DATE`: eight ASCII digits `YYYYMMDD` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Date {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

impl Date {
    #[must_use]
    pub const fn new(year: u16, month: u8, day: u8) -> Self {
        Self { year, month, day }
    }

    fn to_native(self) -> PResult<CK_DATE> {
        if self.year > 9999 || !(1..=12).contains(&self.month) || !(1..=31).contains(&self.day) {
            return Err(PError::ArgumentsBad {
                context: format!("invalid date {self:?}"),
                rv: None,
            });
        }
        let digits = format!("{:04}{:02}{:02}", self.year, self.month, self.day);
        let bytes = digits.as_bytes();
        let mut date = CK_DATE::default();
        date.year.copy_from_slice(&bytes[0..4]);
        date.month.copy_from_slice(&bytes[4..6]);
        date.day.copy_from_slice(&bytes[6..8]);
        Ok(date)
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 8 || !bytes.iter().all(u8::is_ascii_digit) {
            return None;
        }
        let number = |range: std::ops::Range<usize>| {
            bytes[range]
                .iter()
                .fold(0_u16, |acc, d| acc * 10 + u16::from(d - b'0'))
        };
        Some(Self {
            year: number(0..4),
            month: u8::try_from(number(4..6)).ok()?,
            day: u8::try_from(number(6..8)).ok()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    Bool(bool),
    Ulong(CK_ULONG),
    Bytes(Vec<u8>),
    Date(Date),
}

/// A `(type, value)` pair. A `None` value is only meaningful in results:
/// the driver could not (or would not) return it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: CK_ATTRIBUTE_TYPE,
    pub value: Option<AttributeValue>,
}

impl Attribute {
    #[must_use]
    pub const fn new(attr_type: CK_ATTRIBUTE_TYPE, value: AttributeValue) -> Self {
        Self {
            attr_type,
            value: Some(value),
        }
    }

    #[must_use]
    pub const fn bool(attr_type: CK_ATTRIBUTE_TYPE, value: bool) -> Self {
        Self::new(attr_type, AttributeValue::Bool(value))
    }

    #[must_use]
    pub const fn ulong(attr_type: CK_ATTRIBUTE_TYPE, value: CK_ULONG) -> Self {
        Self::new(attr_type, AttributeValue::Ulong(value))
    }

    pub fn bytes(attr_type: CK_ATTRIBUTE_TYPE, value: impl Into<Vec<u8>>) -> Self {
        Self::new(attr_type, AttributeValue::Bytes(value.into()))
    }

    #[must_use]
    pub const fn date(attr_type: CK_ATTRIBUTE_TYPE, value: Date) -> Self {
        Self::new(attr_type, AttributeValue::Date(value))
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self.value {
            Some(AttributeValue::Bool(b)) => Some(b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_ulong(&self) -> Option<CK_ULONG> {
        match self.value {
            Some(AttributeValue::Ulong(u)) => Some(u),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.value {
            Some(AttributeValue::Bytes(b)) => Some(b),
            _ => None,
        }
    }
}

/// Native representation expected for an attribute type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueShape {
    Bool,
    Ulong,
    Date,
    Bytes,
}

/// The value shape is decided by the attribute type alone; unknown and
/// vendor types are opaque bytes.
#[must_use]
pub const fn value_shape(attr_type: CK_ATTRIBUTE_TYPE) -> ValueShape {
    match attr_type {
        CKA_TOKEN
        | CKA_PRIVATE
        | CKA_MODIFIABLE
        | CKA_TRUSTED
        | CKA_SENSITIVE
        | CKA_ENCRYPT
        | CKA_DECRYPT
        | CKA_WRAP
        | CKA_UNWRAP
        | CKA_SIGN
        | CKA_SIGN_RECOVER
        | CKA_VERIFY
        | CKA_VERIFY_RECOVER
        | CKA_DERIVE
        | CKA_EXTRACTABLE
        | CKA_LOCAL
        | CKA_NEVER_EXTRACTABLE
        | CKA_ALWAYS_SENSITIVE
        | CKA_WRAP_WITH_TRUSTED
        | CKA_ALWAYS_AUTHENTICATE => ValueShape::Bool,
        CKA_CLASS
        | CKA_KEY_TYPE
        | CKA_CERTIFICATE_TYPE
        | CKA_CERTIFICATE_CATEGORY
        | CKA_VALUE_LEN
        | CKA_VALUE_BITS
        | CKA_MODULUS_BITS
        | CKA_PRIME_BITS
        | CKA_KEY_GEN_MECHANISM
        | CKA_HW_FEATURE_TYPE => ValueShape::Ulong,
        CKA_START_DATE | CKA_END_DATE => ValueShape::Date,
        _ => ValueShape::Bytes,
    }
}

/// Decode a value returned by the driver. Values whose length does not match
/// the expected shape are kept as raw bytes.
#[must_use]
pub fn decode_value(attr_type: CK_ATTRIBUTE_TYPE, bytes: &[u8]) -> AttributeValue {
    match value_shape(attr_type) {
        ValueShape::Bool if bytes.len() == size_of::<CK_BBOOL>() => {
            AttributeValue::Bool(bytes[0] != CK_FALSE)
        }
        ValueShape::Ulong => <[u8; size_of::<CK_ULONG>()]>::try_from(bytes).map_or_else(
            |_| AttributeValue::Bytes(bytes.to_vec()),
            |b| AttributeValue::Ulong(CK_ULONG::from_ne_bytes(b)),
        ),
        ValueShape::Date => Date::from_bytes(bytes).map_or_else(
            || AttributeValue::Bytes(bytes.to_vec()),
            AttributeValue::Date,
        ),
        _ => AttributeValue::Bytes(bytes.to_vec()),
    }
}

/// Owned backing store of one native attribute value. Scalars are boxed so
/// that their address survives moves of the template.
enum ValueStorage {
    Bool(Box<CK_BBOOL>),
    Ulong(Box<CK_ULONG>),
    Date(Box<CK_DATE>),
    Bytes(Vec<u8>),
}

impl ValueStorage {
    fn pointer_and_len(&mut self) -> PResult<(CK_VOID_PTR, CK_ULONG)> {
        let (pointer, len): (CK_VOID_PTR, usize) = match self {
            Self::Bool(b) => ((&raw mut **b).cast(), size_of::<CK_BBOOL>()),
            Self::Ulong(u) => ((&raw mut **u).cast(), size_of::<CK_ULONG>()),
            Self::Date(d) => ((&raw mut **d).cast(), size_of::<CK_DATE>()),
            Self::Bytes(v) if v.is_empty() => (ptr::null_mut(), 0),
            Self::Bytes(v) => (v.as_mut_ptr().cast(), v.len()),
        };
        Ok((pointer, CK_ULONG::try_from(len)?))
    }
}

fn shape_mismatch(attr_type: CK_ATTRIBUTE_TYPE, shape: ValueShape, value: &AttributeValue) -> PError {
    PError::ArgumentsBad {
        context: format!(
            "attribute 0x{attr_type:08X} expects a {shape:?} value, got {value:?}"
        ),
        rv: None,
    }
}

fn storage_for(attr_type: CK_ATTRIBUTE_TYPE, value: &AttributeValue) -> PResult<ValueStorage> {
    let shape = value_shape(attr_type);
    let storage = match (shape, value) {
        (ValueShape::Bool | ValueShape::Bytes, AttributeValue::Bool(b)) => {
            ValueStorage::Bool(Box::new(if *b { CK_TRUE } else { CK_FALSE }))
        }
        (ValueShape::Ulong | ValueShape::Bytes, AttributeValue::Ulong(u)) => {
            ValueStorage::Ulong(Box::new(*u))
        }
        (ValueShape::Date | ValueShape::Bytes, AttributeValue::Date(d)) => {
            ValueStorage::Date(Box::new(d.to_native()?))
        }
        (ValueShape::Bytes, AttributeValue::Bytes(b)) => ValueStorage::Bytes(b.clone()),
        (shape, value) => return Err(shape_mismatch(attr_type, shape, value)),
    };
    Ok(storage)
}

/// A template laid out for the driver: the `CK_ATTRIBUTE` array and the
/// buffers its entries point to.
pub struct NativeTemplate {
    attributes: Vec<CK_ATTRIBUTE>,
    _storage: Vec<ValueStorage>,
}

impl NativeTemplate {
    /// Lay out a template for a create, set, find or generate call; every
    /// entry must carry a value matching its type.
    pub fn new(template: &[Attribute]) -> PResult<Self> {
        let mut storage = Vec::with_capacity(template.len());
        let mut attributes = Vec::with_capacity(template.len());
        for attribute in template {
            let value = attribute.value.as_ref().ok_or_else(|| PError::ArgumentsBad {
                context: format!(
                    "attribute 0x{:08X} has no value",
                    attribute.attr_type
                ),
                rv: None,
            })?;
            let mut value = storage_for(attribute.attr_type, value)?;
            let (pValue, ulValueLen) = value.pointer_and_len()?;
            attributes.push(CK_ATTRIBUTE {
                type_: attribute.attr_type,
                pValue,
                ulValueLen,
            });
            storage.push(value);
        }
        Ok(Self {
            attributes,
            _storage: storage,
        })
    }

    pub fn as_mut_ptr(&mut self) -> CK_ATTRIBUTE_PTR {
        if self.attributes.is_empty() {
            ptr::null_mut()
        } else {
            self.attributes.as_mut_ptr()
        }
    }

    pub fn count(&self) -> PResult<CK_ULONG> {
        Ok(CK_ULONG::try_from(self.attributes.len())?)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

/// Objects created from a template holding `CKA_TOKEN = true` outlive their
/// session.
pub(crate) fn is_token_template(template: &[Attribute]) -> bool {
    template
        .iter()
        .any(|a| a.attr_type == CKA_TOKEN && a.as_bool() == Some(true))
}
