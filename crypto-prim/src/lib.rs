//! Blake2s PRF/MAC and ChaCha20-Poly1305 primitives.
//!
//! `pbuf` builds its SIV construction on top of the two Blake2s entry points
//! here: [`hash`] for unkeyed, variable-length output (short-ID and
//! channel-ID derivation) and [`mac8`]/[`mac32`] for keyed output (the SIV
//! tag and the Blake2s-based keystream). Blake2s is parameterized at the IV
//! level for the requested digest length, not truncated after the fact, so
//! output for a given `(key, message, length)` is stable regardless of what
//! other lengths are ever requested elsewhere.
#![cfg_attr(not(test), no_std)]

use blake2::Blake2sMac;
use blake2::Blake2sVar;
use digest::consts::{U16, U32, U8};
use digest::{KeyInit, Mac, Update, VariableOutput};

/// Upper bound on the output length accepted by [`hash`]. Blake2s itself
/// tops out at 32 bytes; nothing in NBUS or rMAC asks for more.
pub const MAX_HASH_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// `out` was empty or longer than [`MAX_HASH_LEN`].
    BadOutputLen,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::BadOutputLen => write!(f, "blake2s output length out of range"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Unkeyed Blake2s over the concatenation of `parts`, with digest length
/// `out.len()`.
///
/// Used for short-ID derivation (`Blake2s(parent.short_id ‖ name, 4)`),
/// channel-ID derivation (`Blake2s(short_id ‖ channel_id, 2)`) and the
/// universe-key split (`Blake2s(K, 32)`, see [`mac32`]'s sibling use in
/// `pbuf::derive_keys`).
pub fn hash(parts: &[&[u8]], out: &mut [u8]) -> Result<(), Error> {
    if out.is_empty() || out.len() > MAX_HASH_LEN {
        return Err(Error::BadOutputLen);
    }
    let mut hasher = Blake2sVar::new(out.len()).map_err(|_| Error::BadOutputLen)?;
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize_variable(out).map_err(|_| Error::BadOutputLen)
}

/// Keyed Blake2s-MAC over the concatenation of `parts`, 8-byte output.
///
/// This is the SIV tag (`Blake2s_keyed(Km, P, 8)`) used by both NBUS's
/// trailing frame and rMAC's sealed record.
pub fn mac8(key: &[u8], parts: &[&[u8]]) -> [u8; 8] {
    let mut mac = Blake2sMac::<U8>::new_from_slice(key).expect("key within block size");
    for part in parts {
        Mac::update(&mut mac, part);
    }
    mac.finalize().into_bytes().into()
}

/// Keyed Blake2s-MAC over the concatenation of `parts`, 16-byte output.
///
/// This is rMAC's SIV tag size (`Blake2s_keyed(Km, P, 16)`), wider than
/// NBUS's 8-byte tag since radio frames have more room and a longer
/// over-the-air lifetime to defend.
pub fn mac16(key: &[u8], parts: &[&[u8]]) -> [u8; 16] {
    let mut mac = Blake2sMac::<U16>::new_from_slice(key).expect("key within block size");
    for part in parts {
        Mac::update(&mut mac, part);
    }
    mac.finalize().into_bytes().into()
}

/// Keyed Blake2s-MAC over the concatenation of `parts`, 32-byte output.
///
/// Used as the keystream generator block: `Blake2s_keyed(Ke, SIV ‖ be_u32(i), 32)`.
pub fn mac32(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac = Blake2sMac::<U32>::new_from_slice(key).expect("key within block size");
    for part in parts {
        Mac::update(&mut mac, part);
    }
    mac.finalize().into_bytes().into()
}

/// ChaCha20-Poly1305 AEAD, carried over from `lib/crypto/chacha20.c` and
/// `lib/plumcore-cryptolib/src/poly1305.c` in the original firmware. Neither
/// NBUS nor rMAC call into this today; it is kept available for a future
/// secure-channel layer the same way the original crypto library did.
pub mod aead {
    use chacha20poly1305::aead::{AeadInPlace, KeyInit};
    use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};

    /// Size in bytes of the Poly1305 tag appended by [`seal`].
    pub const TAG_LEN: usize = 16;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[non_exhaustive]
    pub enum Error {
        Seal,
        Open,
    }

    impl core::fmt::Display for Error {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            match self {
                Error::Seal => write!(f, "chacha20-poly1305 seal failed"),
                Error::Open => write!(f, "chacha20-poly1305 open failed (bad tag or length)"),
            }
        }
    }

    /// Seal `plaintext` into `out` (`plaintext.len() + TAG_LEN` bytes: ciphertext
    /// followed by the detached tag), in place, without an allocator.
    pub fn seal(key: &[u8; 32], nonce: &[u8; 12], aad: &[u8], plaintext: &[u8], out: &mut [u8]) -> Result<usize, Error> {
        if out.len() < plaintext.len() + TAG_LEN {
            return Err(Error::Seal);
        }
        let (body, tag_out) = out[..plaintext.len() + TAG_LEN].split_at_mut(plaintext.len());
        body.copy_from_slice(plaintext);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(nonce), aad, body)
            .map_err(|_| Error::Seal)?;
        tag_out.copy_from_slice(&tag);
        Ok(plaintext.len() + TAG_LEN)
    }

    /// Open a buffer produced by [`seal`] (ciphertext ‖ detached tag), writing
    /// the plaintext into `out` and returning its length.
    pub fn open(key: &[u8; 32], nonce: &[u8; 12], aad: &[u8], sealed: &[u8], out: &mut [u8]) -> Result<usize, Error> {
        if sealed.len() < TAG_LEN || out.len() < sealed.len() - TAG_LEN {
            return Err(Error::Open);
        }
        let plaintext_len = sealed.len() - TAG_LEN;
        let body = &mut out[..plaintext_len];
        body.copy_from_slice(&sealed[..plaintext_len]);
        let tag = Tag::from_slice(&sealed[plaintext_len..]);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        cipher
            .decrypt_in_place_detached(Nonce::from_slice(nonce), aad, body, tag)
            .map_err(|_| Error::Open)?;
        Ok(plaintext_len)
    }
}
