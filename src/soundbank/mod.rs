//! Process-wide sound bank.
//!
//! The synthesizer needs a SoundFont before any session can be opened. One
//! bank is loaded per process and shared read-only by every session, so the
//! registry hands out `Arc<SoundFont>` clones and never unloads.

mod builtin;

pub use builtin::builtin_sound_bank_bytes;

use rustysynth::SoundFont;
use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

/// Errors that can occur while loading a sound bank.
#[derive(Debug, thiserror::Error)]
pub enum SoundBankError {
    #[error("failed to open sound bank {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load sound bank: {0}")]
    Invalid(String),
}

/// Holds the one sound bank of the process.
///
/// Loading is serialized by a mutex so concurrent first callers load the file
/// once; after that, reads go through the `OnceLock` without locking.
pub struct SoundBankRegistry {
    bank: OnceLock<Arc<SoundFont>>,
    init_lock: Mutex<()>,
}

static GLOBAL_REGISTRY: SoundBankRegistry = SoundBankRegistry::new();

impl SoundBankRegistry {
    /// Creates an empty registry.
    pub const fn new() -> Self {
        Self {
            bank: OnceLock::new(),
            init_lock: Mutex::new(()),
        }
    }

    /// Returns the registry shared by the whole process.
    pub fn global() -> &'static SoundBankRegistry {
        &GLOBAL_REGISTRY
    }

    /// Loads the sound bank unless one is already loaded.
    ///
    /// # Arguments
    ///
    /// * `path` - SoundFont file to load; `None` or an empty path selects the
    ///   built-in bank
    ///
    /// # Returns
    ///
    /// The loaded bank. If a bank was loaded earlier it is returned as is,
    /// whatever `path` says.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is not a valid SoundFont.
    /// The registry stays empty, so the call can be retried.
    pub fn init(&self, path: Option<&Path>) -> Result<Arc<SoundFont>, SoundBankError> {
        if let Some(bank) = self.bank.get() {
            return Ok(Arc::clone(bank));
        }

        let _guard = self.init_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bank) = self.bank.get() {
            return Ok(Arc::clone(bank));
        }

        let bank = Arc::new(load_sound_bank(path)?);
        let bank = self.bank.get_or_init(|| bank);
        Ok(Arc::clone(bank))
    }

    /// Returns the loaded bank, if any.
    pub fn get(&self) -> Option<Arc<SoundFont>> {
        self.bank.get().cloned()
    }
}

impl Default for SoundBankRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads a SoundFont from disk, or builds the built-in bank.
fn load_sound_bank(path: Option<&Path>) -> Result<SoundFont, SoundBankError> {
    match path.filter(|p| !p.as_os_str().is_empty()) {
        Some(path) => {
            let mut file = BufReader::new(File::open(path).map_err(|source| {
                SoundBankError::Open {
                    path: path.to_path_buf(),
                    source,
                }
            })?);
            let bank = SoundFont::new(&mut file)
                .map_err(|e| SoundBankError::Invalid(format!("{:?}", e)))?;
            tracing::info!(path = %path.display(), "Loaded sound bank");
            Ok(bank)
        }
        None => {
            let mut reader = Cursor::new(builtin_sound_bank_bytes());
            let bank = SoundFont::new(&mut reader)
                .map_err(|e| SoundBankError::Invalid(format!("{:?}", e)))?;
            tracing::info!("Loaded built-in sound bank");
            Ok(bank)
        }
    }
}
