//! age encryption stage and identity files
//!
//! Recipients are X25519 public keys (`age1...`), given literally or by name
//! through the configuration's key store. Any one matching identity decrypts.

use age::secrecy::ExposeSecret;
use age::stream::{StreamReader, StreamWriter};
use age::x25519::{Identity, Recipient};
use std::io::{self, Read, Write};
use std::path::Path;
use tracing::debug;

use strongbox_core::types::KeyStore;
use strongbox_core::{Error, Result};

/// Resolve recipient identifiers to public keys.
///
/// Fails on unknown names and malformed keys so a run never produces bytes
/// for a recipient set it cannot honour.
pub fn resolve_recipients(identifiers: &[String], keys: &KeyStore) -> Result<Vec<Recipient>> {
    identifiers
        .iter()
        .map(|id| {
            let key = if id.starts_with("age1") {
                id.as_str()
            } else {
                keys.lookup(id)
                    .ok_or_else(|| Error::pipeline(format!("unknown encryption key '{}'", id)))?
            };
            key.trim().parse::<Recipient>().map_err(|e| {
                Error::pipeline(format!("invalid age recipient for '{}': {}", id, e))
            })
        })
        .collect()
}

/// Encrypting writer, or a pass-through when no recipients are configured
pub enum Encryptor<W: Write> {
    Plain(W),
    Age(StreamWriter<W>),
}

impl<W: Write> Encryptor<W> {
    pub fn new(out: W, recipients: &[Recipient]) -> Result<Self> {
        if recipients.is_empty() {
            return Ok(Self::Plain(out));
        }
        debug!("Encrypting to {} recipient(s)", recipients.len());
        let encryptor =
            age::Encryptor::with_recipients(recipients.iter().map(|r| r as &dyn age::Recipient))
                .map_err(|e| Error::pipeline(format!("failed to create encryptor: {}", e)))?;
        let writer = encryptor
            .wrap_output(out)
            .map_err(|e| Error::pipeline(format!("failed to start encryption: {}", e)))?;
        Ok(Self::Age(writer))
    }

    /// Flush the final STREAM block and return the inner writer
    pub fn finish(self) -> io::Result<W> {
        match self {
            Self::Plain(w) => Ok(w),
            Self::Age(w) => w.finish(),
        }
    }
}

impl<W: Write> Write for Encryptor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(buf),
            Self::Age(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Age(w) => w.flush(),
        }
    }
}

/// Open an age stream with any of `identities`
pub fn decryptor<R: Read>(input: R, identities: &[Identity]) -> Result<StreamReader<R>> {
    let decryptor = age::Decryptor::new(input)
        .map_err(|e| Error::corrupt(format!("not an age stream: {}", e)))?;
    decryptor
        .decrypt(identities.iter().map(|i| i as &dyn age::Identity))
        .map_err(|e| Error::pipeline(format!("failed to decrypt: {}", e)))
}

/// Generate a new identity
pub fn generate_identity() -> Identity {
    Identity::generate()
}

/// Write a fresh identity to `path` and return its public key
///
/// On unix the file is opened with mode 0600; it is never group or world readable.
pub fn write_identity_file(path: &Path, overwrite: bool) -> Result<String> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true);
    if overwrite {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(|e| match e.kind() {
        io::ErrorKind::AlreadyExists => Error::invalid_config(format!(
            "key file already exists: {}. Use --force to overwrite",
            path.display()
        )),
        _ => Error::Io(e),
    })?;

    // mode() only applies on create; tighten a file being overwritten too
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    let identity = generate_identity();
    let public_key = identity.to_public().to_string();
    let secret_key = identity.to_string();
    let contents = format!(
        "# created: {}\n# public key: {}\n{}\n",
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        public_key,
        secret_key.expose_secret()
    );
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;

    Ok(public_key)
}

/// Read identities from an age key file; `#` lines are comments
pub fn load_identities(path: &Path) -> Result<Vec<Identity>> {
    let contents = std::fs::read_to_string(path)?;
    let identities = contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            line.parse::<Identity>().map_err(|e| {
                Error::invalid_config(format!("bad identity in {}: {}", path.display(), e))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    if identities.is_empty() {
        return Err(Error::invalid_config(format!(
            "no identities in {}",
            path.display()
        )));
    }
    Ok(identities)
}
