//! Service identity and pre-shared secret.

#![allow(missing_docs)]

use std::fs;
use std::path::Path;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use smol_str::SmolStr;
use tracing::info;

use crate::blob::to_hex;
use crate::error::RuntimeError;

/// Default file name, relative to the working directory.
pub const SECRET_FILE_NAME: &str = "psk.secret";

const ID_BYTES: usize = 8;
const SECRET_BYTES: usize = 32;

/// `ID:secret` pair handed to clients by `GetPLCID`.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: SmolStr,
    pub secret: SmolStr,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl Identity {
    #[must_use]
    pub fn generate() -> Self {
        let mut id = [0u8; ID_BYTES];
        let mut secret = [0u8; SECRET_BYTES];
        OsRng.fill_bytes(&mut id);
        OsRng.fill_bytes(&mut secret);
        Self {
            id: SmolStr::new(to_hex(&id)),
            secret: SmolStr::new(URL_SAFE_NO_PAD.encode(secret)),
        }
    }

    pub fn parse(text: &str) -> Result<Self, RuntimeError> {
        let (id, secret) = text.trim().split_once(':').ok_or_else(|| {
            RuntimeError::InvalidConfig("identity must be formatted as ID:secret".into())
        })?;
        if id.is_empty() || secret.is_empty() {
            return Err(RuntimeError::InvalidConfig(
                "identity id and secret must not be empty".into(),
            ));
        }
        Ok(Self {
            id: SmolStr::new(id),
            secret: SmolStr::new(secret),
        })
    }

    /// Read a stored identity; `None` when the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>, RuntimeError> {
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Read the stored identity, creating one when allowed.
    pub fn load_or_generate(path: &Path, generate: bool) -> Result<Option<Self>, RuntimeError> {
        if let Some(identity) = Self::load(path)? {
            return Ok(Some(identity));
        }
        if !generate {
            return Ok(None);
        }
        let identity = Self::generate();
        identity.save(path)?;
        info!(id = %identity.id, "generated service identity");
        Ok(Some(identity))
    }

    pub fn save(&self, path: &Path) -> Result<(), RuntimeError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_line())?;
        restrict_permissions(path)
    }

    #[must_use]
    pub fn to_line(&self) -> String {
        format!("{}:{}", self.id, self.secret)
    }

    /// Compare credentials without short-circuiting on the first difference.
    #[must_use]
    pub fn matches(&self, id: &str, secret: &str) -> bool {
        let expected = self.secret.as_bytes();
        let given = secret.as_bytes();
        let mut diff = u8::from(expected.len() != given.len());
        for (index, byte) in expected.iter().enumerate() {
            diff |= byte ^ given.get(index).copied().unwrap_or(0);
        }
        diff == 0 && self.id == id
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), RuntimeError> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), RuntimeError> {
    Ok(())
}
