//! cloakfs-core: shared pieces of the CloakFS stack
//!
//! Everything the other crates agree on lives here: the error taxonomy
//! (numeric errno at the filesystem boundary, typed errors inside), the
//! mount options that shape the encryption stack, and the length-prefixed
//! variable-int frame used for persisted configuration.

pub mod configvar;
pub mod error;
pub mod options;

pub use configvar::{ConfigMap, ConfigVar};
pub use error::{CryptoError, FsError, FsResult, NameError};
pub use options::FsOptions;

/// Name of the persisted configuration file at the ciphertext root.
/// Forward-mode root listings skip it; decoders treat it as invalid.
pub const CONFIG_FILE_NAME: &str = ".cloakfs.cfg";
