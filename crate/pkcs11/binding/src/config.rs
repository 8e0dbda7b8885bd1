use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Deserializer};
use tracing::debug;
use zeroize::Zeroizing;

use crate::{InitializeOptions, PError, PResult};

/// Overrides `library_path`
pub const PKCS11_LIBRARY_PATH_ENV: &str = "PKCS11_LIBRARY_PATH";
/// Overrides `slot_id`
pub const HSM_SLOT_ID_ENV: &str = "HSM_SLOT_ID";
/// Overrides `user_pin`
pub const HSM_USER_PASSWORD_ENV: &str = "HSM_USER_PASSWORD";

fn deserialize_pin<'de, D>(deserializer: D) -> Result<Option<Zeroizing<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(Zeroizing::new))
}

/// Where to find a driver and how to use it.
///
/// ```toml
/// library_path = "/usr/lib/softhsm/libsofthsm2.so"
/// os_locking = true
/// slot_id = 0
/// user_pin = "12345"
/// ```
#[derive(Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Pkcs11Config {
    pub library_path: PathBuf,
    pub os_locking: bool,
    pub slot_id: Option<u64>,
    #[serde(deserialize_with = "deserialize_pin")]
    pub user_pin: Option<Zeroizing<String>>,
}

impl fmt::Debug for Pkcs11Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pkcs11Config")
            .field("library_path", &self.library_path)
            .field("os_locking", &self.os_locking)
            .field("slot_id", &self.slot_id)
            .field("user_pin", &self.user_pin.as_ref().map(|_| "****"))
            .finish()
    }
}

impl Default for Pkcs11Config {
    fn default() -> Self {
        Self::new(PathBuf::new())
    }
}

impl Pkcs11Config {
    /// A configuration for the driver at `library_path`, with defaults
    /// everywhere else.
    pub fn new<P: Into<PathBuf>>(library_path: P) -> Self {
        Self {
            library_path: library_path.into(),
            os_locking: true,
            slot_id: None,
            user_pin: None,
        }
    }

    pub fn from_toml_str(content: &str) -> PResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load the configuration from a toml file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> PResult<Self> {
        let path = path.as_ref();
        debug!("Loading PKCS#11 configuration from: {}", path.display());
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// Apply the `PKCS11_LIBRARY_PATH`, `HSM_SLOT_ID` and
    /// `HSM_USER_PASSWORD` environment variables, when set.
    pub fn apply_env_overrides(mut self) -> PResult<Self> {
        if let Ok(path) = env::var(PKCS11_LIBRARY_PATH_ENV) {
            self.library_path = PathBuf::from(path);
        }
        if let Ok(slot_id) = env::var(HSM_SLOT_ID_ENV) {
            self.slot_id = Some(slot_id.trim().parse().map_err(|e| {
                PError::Config(format!("{HSM_SLOT_ID_ENV}: invalid slot id {slot_id:?}: {e}"))
            })?);
        }
        if let Ok(pin) = env::var(HSM_USER_PASSWORD_ENV) {
            self.user_pin = Some(Zeroizing::new(pin));
        }
        if self.library_path.as_os_str().is_empty() {
            return Err(PError::Config("no PKCS#11 library path configured".to_owned()));
        }
        Ok(self)
    }

    pub const fn initialize_options(&self) -> InitializeOptions {
        InitializeOptions {
            os_locking: self.os_locking,
        }
    }
}
