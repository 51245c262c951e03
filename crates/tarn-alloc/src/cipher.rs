//! The encryption seam.
//!
//! Every page-sized block passes through a [`PageCipher`] on its way to and
//! from the file. The crate ships only the identity cipher; an AES-CTR +
//! HMAC implementation keyed by a caller-supplied 32-byte key plugs in from
//! outside. The on-disk layout is unchanged by the seam: block boundaries
//! and sizes are identical with and without a cipher.

use tarn_error::Result;

/// Block size the cipher operates on.
pub const CIPHER_BLOCK: usize = 4096;

/// Transforms page-sized blocks between memory and disk form.
///
/// `block_index` is the block's position in the file, available to tweak
/// the keystream per block.
pub trait PageCipher: Send + Sync {
    /// Transform a block into its on-disk form in place.
    fn encrypt_block(&self, block_index: u64, buf: &mut [u8]);

    /// Transform a block into its in-memory form in place.
    ///
    /// Fails when authentication fails (wrong key, tampered block).
    fn decrypt_block(&self, block_index: u64, buf: &mut [u8]) -> Result<()>;
}

/// The identity cipher used when no key is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainCipher;

impl PageCipher for PlainCipher {
    fn encrypt_block(&self, _block_index: u64, _buf: &mut [u8]) {}

    fn decrypt_block(&self, _block_index: u64, _buf: &mut [u8]) -> Result<()> {
        Ok(())
    }
}
