//! Cryptographically random filler

use rand::rngs::OsRng;
use rand::RngCore;

/// Largest slice handed to the random source in one call.
///
/// Some sources reject bigger requests, so this is a hard limit.
pub const MAX_FILL: usize = 64 * 1024;

/// Fill `buf` from the operating system's secure random source
pub fn random_fill(buf: &mut [u8]) -> Result<(), rand::Error> {
    random_fill_with(&mut OsRng, buf)
}

/// Fill `buf` from `rng` in slices of at most [`MAX_FILL`] bytes
pub fn random_fill_with<R: RngCore + ?Sized>(rng: &mut R, buf: &mut [u8]) -> Result<(), rand::Error> {
    for slice in buf.chunks_mut(MAX_FILL) {
        rng.try_fill_bytes(slice)?;
    }
    Ok(())
}
