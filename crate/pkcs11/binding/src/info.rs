use std::{
    fmt,
    fmt::{Display, Formatter},
};

use pkcs11_sys::{
    CK_FLAGS, CK_INFO, CK_MECHANISM_INFO, CK_SESSION_INFO, CK_SLOT_ID, CK_SLOT_INFO, CK_STATE,
    CK_TOKEN_INFO, CK_ULONG, CK_VERSION, CKF_RW_SESSION, CKF_TOKEN_PRESENT,
};

use crate::SlotHandle;

/// Cryptoki strings are fixed width, blank padded and not NUL terminated.
fn padded_string(bytes: &[u8]) -> String {
    let end = bytes
        .iter()
        .rposition(|b| *b != b' ' && *b != 0)
        .map_or(0, |p| p + 1);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl From<CK_VERSION> for Version {
    fn from(version: CK_VERSION) -> Self {
        Self {
            major: version.major,
            minor: version.minor,
        }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub cryptokiVersion: Version,
    pub manufacturerID: String,
    pub flags: CK_FLAGS,
    pub libraryDescription: String,
    pub libraryVersion: Version,
}

impl From<CK_INFO> for Info {
    fn from(info: CK_INFO) -> Self {
        Self {
            cryptokiVersion: info.cryptokiVersion.into(),
            manufacturerID: padded_string(&info.manufacturerID),
            flags: info.flags,
            libraryDescription: padded_string(&info.libraryDescription),
            libraryVersion: info.libraryVersion.into(),
        }
    }
}

impl Display for Info {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cryptoki Version: {}\nManufacturer ID: {}\nFlags: {}\nLibrary Description: \
             {}\nLibrary Version: {}",
            self.cryptokiVersion,
            self.manufacturerID,
            self.flags,
            self.libraryDescription,
            self.libraryVersion
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub slotDescription: String,
    pub manufacturerID: String,
    pub flags: CK_FLAGS,
    pub hardwareVersion: Version,
    pub firmwareVersion: Version,
}

impl SlotInfo {
    #[must_use]
    pub const fn token_present(&self) -> bool {
        self.flags & CKF_TOKEN_PRESENT != 0
    }
}

impl From<CK_SLOT_INFO> for SlotInfo {
    fn from(info: CK_SLOT_INFO) -> Self {
        Self {
            slotDescription: padded_string(&info.slotDescription),
            manufacturerID: padded_string(&info.manufacturerID),
            flags: info.flags,
            hardwareVersion: info.hardwareVersion.into(),
            firmwareVersion: info.firmwareVersion.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub label: String,
    pub manufacturerID: String,
    pub model: String,
    pub serialNumber: String,
    pub flags: CK_FLAGS,
    pub ulMaxSessionCount: CK_ULONG,
    pub ulSessionCount: CK_ULONG,
    pub ulMaxRwSessionCount: CK_ULONG,
    pub ulRwSessionCount: CK_ULONG,
    pub ulMaxPinLen: CK_ULONG,
    pub ulMinPinLen: CK_ULONG,
    pub ulTotalPublicMemory: CK_ULONG,
    pub ulFreePublicMemory: CK_ULONG,
    pub ulTotalPrivateMemory: CK_ULONG,
    pub ulFreePrivateMemory: CK_ULONG,
    pub hardwareVersion: Version,
    pub firmwareVersion: Version,
    pub utcTime: String,
}

impl From<CK_TOKEN_INFO> for TokenInfo {
    fn from(info: CK_TOKEN_INFO) -> Self {
        Self {
            label: padded_string(&info.label),
            manufacturerID: padded_string(&info.manufacturerID),
            model: padded_string(&info.model),
            serialNumber: padded_string(&info.serialNumber),
            flags: info.flags,
            ulMaxSessionCount: info.ulMaxSessionCount,
            ulSessionCount: info.ulSessionCount,
            ulMaxRwSessionCount: info.ulMaxRwSessionCount,
            ulRwSessionCount: info.ulRwSessionCount,
            ulMaxPinLen: info.ulMaxPinLen,
            ulMinPinLen: info.ulMinPinLen,
            ulTotalPublicMemory: info.ulTotalPublicMemory,
            ulFreePublicMemory: info.ulFreePublicMemory,
            ulTotalPrivateMemory: info.ulTotalPrivateMemory,
            ulFreePrivateMemory: info.ulFreePrivateMemory,
            hardwareVersion: info.hardwareVersion.into(),
            firmwareVersion: info.firmwareVersion.into(),
            utcTime: padded_string(&info.utcTime),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MechanismInfo {
    pub ulMinKeySize: CK_ULONG,
    pub ulMaxKeySize: CK_ULONG,
    pub flags: CK_FLAGS,
}

impl MechanismInfo {
    /// Whether every bit of `flags` (e.g. `CKF_ENCRYPT | CKF_DECRYPT`) is set
    #[must_use]
    pub const fn supports(&self, flags: CK_FLAGS) -> bool {
        self.flags & flags == flags
    }
}

impl From<CK_MECHANISM_INFO> for MechanismInfo {
    fn from(info: CK_MECHANISM_INFO) -> Self {
        Self {
            ulMinKeySize: info.ulMinKeySize,
            ulMaxKeySize: info.ulMaxKeySize,
            flags: info.flags,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub slot: SlotHandle,
    pub slotID: CK_SLOT_ID,
    pub state: CK_STATE,
    pub flags: CK_FLAGS,
    pub ulDeviceError: CK_ULONG,
}

impl SessionInfo {
    pub(crate) const fn new(slot: SlotHandle, info: &CK_SESSION_INFO) -> Self {
        Self {
            slot,
            slotID: info.slotID,
            state: info.state,
            flags: info.flags,
            ulDeviceError: info.ulDeviceError,
        }
    }

    #[must_use]
    pub const fn is_read_write(&self) -> bool {
        self.flags & CKF_RW_SESSION != 0
    }
}
