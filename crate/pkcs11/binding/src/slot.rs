use std::ptr;

use pkcs11_sys::{
    CK_FALSE, CK_MECHANISM_INFO, CK_MECHANISM_TYPE, CK_SLOT_ID, CK_SLOT_INFO, CK_TOKEN_INFO,
    CK_TRUE, CK_ULONG, CKR_BUFFER_TOO_SMALL, CKR_SLOT_ID_INVALID,
};
use tracing::{debug, trace};

use crate::{
    Module, PError, PResult, SlotHandle,
    error::{check_rv, rv_name},
    info::{MechanismInfo, SlotInfo, TokenInfo},
    loader::FunctionList,
};

/// Drivers may grow a list between the count query and the fill call; give
/// up after that many attempts.
const MAX_LIST_ATTEMPTS: usize = 4;

/// Two-pass list retrieval: query the count with a null buffer, then fill.
fn read_list<T: Copy + Default>(
    context: &str,
    mut call: impl FnMut(*mut T, *mut CK_ULONG) -> pkcs11_sys::CK_RV,
) -> PResult<Vec<T>> {
    for _ in 0..MAX_LIST_ATTEMPTS {
        let mut count: CK_ULONG = 0;
        check_rv(call(ptr::null_mut(), &raw mut count), context)?;
        let mut list = vec![T::default(); usize::try_from(count)?];
        if list.is_empty() {
            return Ok(list);
        }
        let rv = call(list.as_mut_ptr(), &raw mut count);
        trace!("{context} -> {}", rv_name(rv));
        if rv == CKR_BUFFER_TOO_SMALL {
            continue;
        }
        check_rv(rv, context)?;
        list.truncate(usize::try_from(count)?);
        return Ok(list);
    }
    Err(PError::BufferTooSmall {
        context: format!("{context}: list kept growing"),
        required: None,
    })
}

impl Module {
    /// The slots of the driver, optionally only those with a token present.
    pub fn get_slot_list(&self, token_present: bool) -> PResult<Vec<SlotHandle>> {
        // checked first: the driver must not be called before initialize
        drop(self.initialized_state()?);
        let functions: &dyn FunctionList = &*self.functions;
        let present = if token_present { CK_TRUE } else { CK_FALSE };
        let ids: Vec<CK_SLOT_ID> = read_list("Failed listing slots", |list, count| unsafe {
            functions.C_GetSlotList(present, list, count)
        })?;
        let mut module = self.initialized_state_mut()?;
        let slots = ids
            .into_iter()
            .map(|id| module.registry.slots.issue(id, ()))
            .collect::<PResult<Vec<_>>>()?;
        debug!("Found {} slot(s)", slots.len());
        Ok(slots)
    }

    /// The handle of the slot the driver calls `slot_id`.
    pub fn find_slot(&self, slot_id: CK_SLOT_ID) -> PResult<SlotHandle> {
        let slots = self.get_slot_list(false)?;
        let module = self.initialized_state()?;
        slots
            .into_iter()
            .find(|slot| module.registry.slots.resolve(*slot).is_ok_and(|id| id == slot_id))
            .ok_or_else(|| PError::InvalidHandle {
                context: format!("no slot with id {slot_id}"),
                rv: Some(CKR_SLOT_ID_INVALID),
            })
    }

    /// The native id of `slot`
    pub fn slot_id(&self, slot: SlotHandle) -> PResult<CK_SLOT_ID> {
        self.resolve_slot(slot)
    }

    pub fn get_slot_info(&self, slot: SlotHandle) -> PResult<SlotInfo> {
        let slot_id = self.resolve_slot(slot)?;
        let mut info = CK_SLOT_INFO::default();
        p11_call!(
            self.functions,
            "Failed getting slot info",
            C_GetSlotInfo,
            slot_id,
            &raw mut info
        )?;
        Ok(info.into())
    }

    pub fn get_token_info(&self, slot: SlotHandle) -> PResult<TokenInfo> {
        let slot_id = self.resolve_slot(slot)?;
        let mut info = CK_TOKEN_INFO::default();
        p11_call!(
            self.functions,
            "Failed getting token info",
            C_GetTokenInfo,
            slot_id,
            &raw mut info
        )?;
        Ok(info.into())
    }

    pub fn get_mechanism_list(&self, slot: SlotHandle) -> PResult<Vec<CK_MECHANISM_TYPE>> {
        let slot_id = self.resolve_slot(slot)?;
        let functions: &dyn FunctionList = &*self.functions;
        read_list("Failed listing mechanisms", |list, count| unsafe {
            functions.C_GetMechanismList(slot_id, list, count)
        })
    }

    pub fn get_mechanism_info(
        &self,
        slot: SlotHandle,
        mechanism_type: CK_MECHANISM_TYPE,
    ) -> PResult<MechanismInfo> {
        let slot_id = self.resolve_slot(slot)?;
        let mut info = CK_MECHANISM_INFO::default();
        p11_call!(
            self.functions,
            "Failed getting mechanism info",
            C_GetMechanismInfo,
            slot_id,
            mechanism_type,
            &raw mut info
        )?;
        Ok(info.into())
    }
}
