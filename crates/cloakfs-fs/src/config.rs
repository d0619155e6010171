use std::sync::Arc;

use cloakfs_core::{FsOptions, FsResult};
use cloakfs_crypto::{Cipher, CipherKey};
use cloakfs_names::PathCodec;

/// Everything a mount's nodes share: the options, the primitive cipher,
/// the mount key and the path codec. One per mount, assembled at setup.
pub struct FsConfig {
    pub options: FsOptions,
    pub cipher: Arc<dyn Cipher>,
    pub key: CipherKey,
    pub naming: Arc<PathCodec>,
}

impl FsConfig {
    pub fn new(
        options: FsOptions,
        cipher: Arc<dyn Cipher>,
        key: CipherKey,
        naming: Arc<PathCodec>,
    ) -> FsResult<Arc<Self>> {
        options.validate()?;
        Ok(Arc::new(FsConfig {
            options,
            cipher,
            key,
            naming,
        }))
    }
}
