//! Per-session bookkeeping of the streaming Init → Update* → Final protocol.

use std::fmt;

use pkcs11_sys::{CK_BYTE_PTR, CK_RV, CK_ULONG, CK_ULONG_PTR, CKR_BUFFER_TOO_SMALL, CKR_OK};
use tracing::warn;

use crate::{PError, PResult, error::rv_to_error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Digest,
    Encrypt,
    Decrypt,
    Sign,
    Verify,
}

impl OperationKind {
    const fn index(self) -> usize {
        match self {
            Self::Digest => 0,
            Self::Encrypt => 1,
            Self::Decrypt => 2,
            Self::Sign => 3,
            Self::Verify => 4,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Digest => "digest",
            Self::Encrypt => "encrypt",
            Self::Decrypt => "decrypt",
            Self::Sign => "sign",
            Self::Verify => "verify",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationState {
    #[default]
    Idle,
    Initialized,
    /// A final call is in flight
    Finalized,
}

#[derive(Debug, Default)]
pub(crate) struct OperationTable {
    states: [OperationState; 5],
}

impl OperationTable {
    pub(crate) const fn state(&self, kind: OperationKind) -> OperationState {
        self.states[kind.index()]
    }

    fn set(&mut self, kind: OperationKind, state: OperationState) {
        self.states[kind.index()] = state;
    }

    /// Fails when an operation of this kind is already running.
    pub(crate) fn ensure_idle(&self, kind: OperationKind) -> PResult<()> {
        match self.state(kind) {
            OperationState::Idle => Ok(()),
            _ => Err(PError::OperationAlreadyActive(kind.name().to_owned())),
        }
    }

    pub(crate) fn ensure_initialized(&self, kind: OperationKind) -> PResult<()> {
        match self.state(kind) {
            OperationState::Initialized => Ok(()),
            _ => Err(PError::OperationNotInitialized(kind.name().to_owned())),
        }
    }

    pub(crate) fn activate(&mut self, kind: OperationKind) {
        self.set(kind, OperationState::Initialized);
    }

    pub(crate) fn reset(&mut self, kind: OperationKind) {
        self.set(kind, OperationState::Idle);
    }

    /// Record the outcome of an update: an undersized output buffer leaves
    /// the operation running, any other failure has ended it driver side.
    pub(crate) fn settle_update<T>(&mut self, kind: OperationKind, result: &PResult<T>) {
        match result {
            Ok(_) | Err(PError::BufferTooSmall { .. }) => {}
            Err(e) => {
                warn!("{kind} update failed, operation terminated: {e}");
                self.reset(kind);
            }
        }
    }

    /// Record the outcome of a single-shot call, which ends the operation
    /// unless the output buffer was too small.
    pub(crate) fn settle_single<T>(&mut self, kind: OperationKind, result: &PResult<T>) {
        if !matches!(result, Err(PError::BufferTooSmall { .. })) {
            self.reset(kind);
        }
    }

    /// Mark the operation as finalizing; it returns to idle when the guard
    /// drops, whatever the outcome of the final call.
    pub(crate) fn finishing(&mut self, kind: OperationKind) -> FinalGuard<'_> {
        self.set(kind, OperationState::Finalized);
        FinalGuard { table: self, kind }
    }

    pub(crate) fn reset_all(&mut self) {
        self.states = [OperationState::Idle; 5];
    }
}

pub(crate) struct FinalGuard<'a> {
    table: &'a mut OperationTable,
    kind: OperationKind,
}

impl Drop for FinalGuard<'_> {
    fn drop(&mut self) {
        self.table.reset(self.kind);
    }
}

/// Run a native call producing variable length output into `output`.
///
/// The output pointer is never null, so the call is never mistaken for a
/// length query. On `CKR_BUFFER_TOO_SMALL` the length reported by the driver
/// is surfaced as the required size.
pub(crate) fn call_with_output(
    output: &mut [u8],
    context: &str,
    call: impl FnOnce(CK_BYTE_PTR, CK_ULONG_PTR) -> CK_RV,
) -> PResult<usize> {
    let capacity = output.len();
    let mut len = CK_ULONG::try_from(capacity)?;
    let rv = call(output.as_mut_ptr(), &raw mut len);
    let reported = usize::try_from(len)?;
    match rv {
        CKR_OK if reported <= capacity => Ok(reported),
        CKR_OK => Err(PError::Default(format!(
            "{context}: driver reported {reported} bytes written into a {capacity} bytes buffer"
        ))),
        CKR_BUFFER_TOO_SMALL => Err(PError::BufferTooSmall {
            context: context.to_owned(),
            required: (reported > capacity).then_some(reported),
        }),
        rv => Err(rv_to_error(rv, context)),
    }
}

#[cfg(test)]
mod tests {
    use pkcs11_sys::{CK_ULONG, CKR_BUFFER_TOO_SMALL, CKR_DATA_LEN_RANGE, CKR_OK};

    use super::{OperationKind, OperationState, OperationTable, call_with_output};
    use crate::PError;

    #[test]
    fn init_update_final_cycle() {
        let mut table = OperationTable::default();
        let kind = OperationKind::Encrypt;
        assert_eq!(table.state(kind), OperationState::Idle);
        assert!(matches!(
            table.ensure_initialized(kind),
            Err(PError::OperationNotInitialized(_))
        ));
        table.ensure_idle(kind).unwrap();
        table.activate(kind);
        assert!(matches!(
            table.ensure_idle(kind),
            Err(PError::OperationAlreadyActive(_))
        ));
        // kinds are independent
        table.ensure_idle(OperationKind::Digest).unwrap();

        let too_small: Result<(), PError> = Err(PError::BufferTooSmall {
            context: String::new(),
            required: Some(16),
        });
        table.settle_update(kind, &too_small);
        assert_eq!(table.state(kind), OperationState::Initialized);

        {
            let _guard = table.finishing(kind);
        }
        assert_eq!(table.state(kind), OperationState::Idle);
    }

    #[test]
    fn failed_update_ends_the_operation() {
        let mut table = OperationTable::default();
        table.activate(OperationKind::Decrypt);
        let failed: Result<(), PError> = Err(PError::Default("boom".to_owned()));
        table.settle_update(OperationKind::Decrypt, &failed);
        assert_eq!(table.state(OperationKind::Decrypt), OperationState::Idle);

        table.activate(OperationKind::Sign);
        table.settle_single(OperationKind::Sign, &Ok(()));
        assert_eq!(table.state(OperationKind::Sign), OperationState::Idle);

        table.activate(OperationKind::Verify);
        table.activate(OperationKind::Digest);
        table.reset_all();
        assert_eq!(table.state(OperationKind::Verify), OperationState::Idle);
        assert_eq!(table.state(OperationKind::Digest), OperationState::Idle);
    }

    #[test]
    fn output_contract() {
        let mut output = [0_u8; 4];
        let written = call_with_output(&mut output, "ok", |out, len| {
            assert!(!out.is_null());
            unsafe {
                *out = 9;
                *len = 1;
            }
            CKR_OK
        })
        .unwrap();
        assert_eq!(written, 1);
        assert_eq!(output[0], 9);

        let err = call_with_output(&mut output, "small", |_, len| {
            unsafe { *len = 12 as CK_ULONG };
            CKR_BUFFER_TOO_SMALL
        })
        .unwrap_err();
        assert!(matches!(
            err,
            PError::BufferTooSmall {
                required: Some(12),
                ..
            }
        ));

        let err = call_with_output(&mut [], "empty", |out, _| {
            assert!(!out.is_null());
            CKR_DATA_LEN_RANGE
        })
        .unwrap_err();
        assert!(matches!(err, PError::ArgumentsBad { .. }));
    }
}
