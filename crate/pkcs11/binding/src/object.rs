//! Object management and the two-pass attribute read.

use std::ptr;

use pkcs11_sys::{
    CK_ATTRIBUTE, CK_ATTRIBUTE_TYPE, CK_OBJECT_HANDLE, CK_SESSION_HANDLE, CK_ULONG, CKA_TOKEN,
    CKR_ATTRIBUTE_SENSITIVE, CKR_ATTRIBUTE_TYPE_INVALID, CKR_OK,
};
use tracing::{debug, trace, warn};

use crate::{
    Attribute, Module, ObjectHandle, PError, PResult, SessionHandle,
    attribute::{NativeTemplate, UNAVAILABLE_INFORMATION, decode_value, is_token_template},
    error::{rv_name, rv_to_error},
    loader::FunctionList,
};

/// Object handles fetched per `C_FindObjects` call by
/// [`Module::find_all_objects`].
const FIND_BATCH: usize = 64;

/// Raw value of each attribute in `types`, `None` for those the driver
/// reports as unavailable (sensitive, or not applicable to the object).
///
/// Pass one queries every length with null value pointers; pass two
/// allocates exactly those lengths and fills them. A failure of the second
/// pass is always an error.
pub(crate) fn read_attribute_values(
    functions: &dyn FunctionList,
    session: CK_SESSION_HANDLE,
    object: CK_OBJECT_HANDLE,
    types: &[CK_ATTRIBUTE_TYPE],
) -> PResult<Vec<Option<Vec<u8>>>> {
    if types.is_empty() {
        return Ok(Vec::new());
    }
    let mut query: Vec<CK_ATTRIBUTE> = types
        .iter()
        .map(|&type_| CK_ATTRIBUTE {
            type_,
            pValue: ptr::null_mut(),
            ulValueLen: 0,
        })
        .collect();
    let count = CK_ULONG::try_from(query.len())?;
    let rv = unsafe { functions.C_GetAttributeValue(session, object, query.as_mut_ptr(), count) };
    trace!("C_GetAttributeValue (lengths) -> {}", rv_name(rv));
    match rv {
        CKR_OK | CKR_ATTRIBUTE_SENSITIVE | CKR_ATTRIBUTE_TYPE_INVALID => {}
        rv => return Err(rv_to_error(rv, "Failed querying attribute lengths")),
    }

    let mut values: Vec<Option<Vec<u8>>> = Vec::with_capacity(query.len());
    for attribute in &query {
        if attribute.ulValueLen == UNAVAILABLE_INFORMATION {
            values.push(None);
        } else {
            values.push(Some(vec![0_u8; usize::try_from(attribute.ulValueLen)?]));
        }
    }

    let mut fill = Vec::new();
    let mut filled = Vec::new();
    for (index, (value, &type_)) in values.iter_mut().zip(types).enumerate() {
        if let Some(buffer) = value.as_mut().filter(|b| !b.is_empty()) {
            fill.push(CK_ATTRIBUTE {
                type_,
                pValue: buffer.as_mut_ptr().cast(),
                ulValueLen: CK_ULONG::try_from(buffer.len())?,
            });
            filled.push(index);
        }
    }
    if fill.is_empty() {
        return Ok(values);
    }
    p11_call!(
        functions,
        "Failed reading attribute values",
        C_GetAttributeValue,
        session,
        object,
        fill.as_mut_ptr(),
        CK_ULONG::try_from(fill.len())?
    )?;
    for (attribute, index) in fill.iter().zip(filled) {
        let Some(buffer) = values[index].as_mut() else {
            continue;
        };
        if attribute.ulValueLen == UNAVAILABLE_INFORMATION {
            return Err(PError::Default(format!(
                "attribute 0x{:08X} became unavailable while being read",
                attribute.type_
            )));
        }
        let len = usize::try_from(attribute.ulValueLen)?;
        if len > buffer.len() {
            return Err(PError::BufferTooSmall {
                context: format!("attribute 0x{:08X} grew while being read", attribute.type_),
                required: Some(len),
            });
        }
        buffer.truncate(len);
    }
    Ok(values)
}

impl Module {
    pub fn create_object(
        &self,
        session: SessionHandle,
        template: &[Attribute],
    ) -> PResult<ObjectHandle> {
        let mut native_template = NativeTemplate::new(template)?;
        self.with_session(session, |state| {
            let mut object: CK_OBJECT_HANDLE = 0;
            p11_call!(
                self.functions,
                "Failed creating an object",
                C_CreateObject,
                state.native,
                native_template.as_mut_ptr(),
                native_template.count()?,
                &raw mut object
            )?;
            self.issue_object(state, object, is_token_template(template))
        })
    }

    pub fn destroy_object(&self, session: SessionHandle, object: ObjectHandle) -> PResult<()> {
        self.with_session(session, |state| {
            let native = self.resolve_object(state, object)?;
            p11_call!(
                self.functions,
                "Failed destroying an object",
                C_DestroyObject,
                state.native,
                native
            )?;
            self.release_object(object)?;
            debug!("Destroyed {object}");
            Ok(())
        })
    }

    /// Read the attributes `types` of `object`, in order. Attributes the
    /// driver cannot return (sensitive, or not defined for this object) come
    /// back with a `None` value.
    pub fn get_attribute_value(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        types: &[CK_ATTRIBUTE_TYPE],
    ) -> PResult<Vec<Attribute>> {
        self.with_session(session, |state| {
            let native = self.resolve_object(state, object)?;
            let values = read_attribute_values(&*self.functions, state.native, native, types)?;
            Ok(types
                .iter()
                .zip(values)
                .map(|(&attr_type, value)| Attribute {
                    attr_type,
                    value: value.map(|bytes| decode_value(attr_type, &bytes)),
                })
                .collect())
        })
    }

    /// Write `attributes` in a single native call; nothing is rolled back if
    /// the driver rejects one of them.
    pub fn set_attribute_value(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        attributes: &[Attribute],
    ) -> PResult<()> {
        let mut template = NativeTemplate::new(attributes)?;
        self.with_session(session, |state| {
            let native = self.resolve_object(state, object)?;
            p11_call!(
                self.functions,
                "Failed setting attribute values",
                C_SetAttributeValue,
                state.native,
                native,
                template.as_mut_ptr(),
                template.count()?
            )
        })
    }

    /// Start a search for the objects matching `filter`, or all objects.
    pub fn find_objects_init(
        &self,
        session: SessionHandle,
        filter: Option<&[Attribute]>,
    ) -> PResult<()> {
        let mut template = NativeTemplate::new(filter.unwrap_or_default())?;
        self.with_session(session, |state| {
            if state.find_active {
                return Err(PError::OperationAlreadyActive("find".to_owned()));
            }
            p11_call!(
                self.functions,
                "Failed initializing object search",
                C_FindObjectsInit,
                state.native,
                template.as_mut_ptr(),
                template.count()?
            )?;
            state.find_active = true;
            Ok(())
        })
    }

    /// Up to `max_objects` further matches; an empty vector once the search
    /// is exhausted. Each match's `CKA_TOKEN` decides whether its handle is
    /// scoped to this session or to the module.
    pub fn find_objects(
        &self,
        session: SessionHandle,
        max_objects: usize,
    ) -> PResult<Vec<ObjectHandle>> {
        self.with_session(session, |state| {
            if !state.find_active {
                return Err(PError::OperationNotInitialized("find".to_owned()));
            }
            if max_objects == 0 {
                return Ok(Vec::new());
            }
            let mut found: Vec<CK_OBJECT_HANDLE> = vec![0; max_objects];
            let mut count: CK_ULONG = 0;
            p11_call!(
                self.functions,
                "Failed searching objects",
                C_FindObjects,
                state.native,
                found.as_mut_ptr(),
                CK_ULONG::try_from(max_objects)?,
                &raw mut count
            )?;
            found.truncate(usize::try_from(count)?.min(max_objects));
            // token objects outlive the session which found them
            found
                .into_iter()
                .map(|native| {
                    let token = read_attribute_values(
                        &*self.functions,
                        state.native,
                        native,
                        &[CKA_TOKEN],
                    )?
                    .pop()
                    .flatten()
                    .is_some_and(|value| value.first().is_some_and(|b| *b != 0));
                    self.issue_object(state, native, token)
                })
                .collect()
        })
    }

    /// End the search. The session is freed for a new search even if the
    /// driver reports an error.
    pub fn find_objects_final(&self, session: SessionHandle) -> PResult<()> {
        self.with_session(session, |state| {
            if !state.find_active {
                return Err(PError::OperationNotInitialized("find".to_owned()));
            }
            state.find_active = false;
            p11_call!(
                self.functions,
                "Failed finalizing object search",
                C_FindObjectsFinal,
                state.native
            )
        })
    }

    /// Every object matching `filter`: init, find until exhausted, final.
    pub fn find_all_objects(
        &self,
        session: SessionHandle,
        filter: Option<&[Attribute]>,
    ) -> PResult<Vec<ObjectHandle>> {
        self.find_objects_init(session, filter)?;
        let mut objects = Vec::new();
        loop {
            match self.find_objects(session, FIND_BATCH) {
                Ok(batch) => {
                    let exhausted = batch.len() < FIND_BATCH;
                    objects.extend(batch);
                    if exhausted {
                        break;
                    }
                }
                Err(e) => {
                    if let Err(final_error) = self.find_objects_final(session) {
                        warn!("Failed finalizing object search after an error: {final_error}");
                    }
                    return Err(e);
                }
            }
        }
        self.find_objects_final(session)?;
        Ok(objects)
    }
}
