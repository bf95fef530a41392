//! Synthetic-IV (SIV) authenticated encryption over a keyed Blake2s PRF.
//!
//! This is a from-scratch reimplementation of `blake2s-siv.c` /
//! `pbuf.c`'s construction: a MAC-then-stream-cipher scheme built entirely
//! out of [`crypto_prim`]'s keyed Blake2s. No block cipher, no separate MAC
//! primitive — the same PRF plays both roles:
//!
//! 1. `Km` (the "MAC key" half of the derived key pair) MACs the plaintext
//!    to produce the SIV tag.
//! 2. `Ke` (the "encryption key" half) seeded with that SIV drives a
//!    Blake2s-keystream stream cipher (successive `Blake2s_keyed(Ke, SIV ‖
//!    be32(block_index), 32)` blocks, XORed against the plaintext).
//!
//! Opening reverses step 2 first (decrypt using the SIV carried alongside
//! the ciphertext), then recomputes the tag over the **recovered
//! plaintext** and compares it to the carried SIV — so a forged ciphertext
//! decrypts to garbage whose recomputed tag will not match what an attacker
//! sent, without ever decrypting under an unauthenticated key.
//!
//! [`seal`]/[`open`] produce and consume a single `ciphertext ‖ SIV` buffer.
//! [`seal_split`]/[`open_split`] produce and consume the ciphertext and SIV
//! as two independent buffers, matching NBUS's wire layout where the SIV
//! travels in its own trailing frame rather than appended to the data
//! fragments.
#![cfg_attr(not(test), no_std)]

/// Blake2s keystream block size in bytes.
const BLOCK_LEN: usize = 32;

/// Length in bytes of each half of a derived key pair (`Ke`, `Km`).
pub const KEY_HALF_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// A provided buffer was too small, or `siv_len` was zero or too large.
    BadLength,
    /// The SIV recomputed over the decrypted plaintext did not match the
    /// one carried with the ciphertext.
    AuthenticationFailed,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::BadLength => write!(f, "pbuf: buffer or SIV length out of range"),
            Error::AuthenticationFailed => write!(f, "pbuf: SIV authentication failed"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// A derived key pair: `Ke` drives the keystream, `Km` MACs the plaintext.
///
/// Derived from a single universe/channel key `K` as
/// `Ke ‖ Km = Blake2s(K, 32)` — an unkeyed hash of `K` treated as the
/// message, split into two 16-byte halves.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Keys {
    pub ke: [u8; KEY_HALF_LEN],
    pub km: [u8; KEY_HALF_LEN],
}

impl core::fmt::Debug for Keys {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Keys").finish_non_exhaustive()
    }
}

/// Derive `(Ke, Km)` from a universe or channel key `k`.
pub fn derive_keys(k: &[u8]) -> Keys {
    let mut both = [0u8; 2 * KEY_HALF_LEN];
    crypto_prim::hash(&[k], &mut both).expect("32 is a valid blake2s output length");
    let mut ke = [0u8; KEY_HALF_LEN];
    let mut km = [0u8; KEY_HALF_LEN];
    ke.copy_from_slice(&both[..KEY_HALF_LEN]);
    km.copy_from_slice(&both[KEY_HALF_LEN..]);
    Keys { ke, km }
}

/// NBUS uses an 8-byte SIV, rMAC a 16-byte one; both are exact Blake2s
/// parameterizations rather than truncations of some longer tag.
fn siv_tag(km: &[u8; KEY_HALF_LEN], plaintext: &[u8], siv: &mut [u8]) -> Result<(), Error> {
    match siv.len() {
        8 => siv.copy_from_slice(&crypto_prim::mac8(km, &[plaintext])),
        16 => siv.copy_from_slice(&crypto_prim::mac16(km, &[plaintext])),
        _ => return Err(Error::BadLength),
    }
    Ok(())
}

/// XOR a Blake2s keystream seeded by `(ke, siv)` into `buf` in place.
fn apply_keystream(ke: &[u8; KEY_HALF_LEN], siv: &[u8], buf: &mut [u8]) {
    let mut offset = 0usize;
    let mut counter: u32 = 0;
    while offset < buf.len() {
        let block = crypto_prim::mac32(ke, &[siv, &counter.to_be_bytes()]);
        let take = core::cmp::min(BLOCK_LEN, buf.len() - offset);
        for i in 0..take {
            buf[offset + i] ^= block[i];
        }
        offset += take;
        counter = counter.wrapping_add(1);
    }
}

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Seal `plaintext` into `out` as `ciphertext ‖ SIV`, `siv_len` bytes of tag.
///
/// `out` must be at least `plaintext.len() + siv_len` bytes; returns the
/// number of bytes written.
pub fn seal(keys: &Keys, siv_len: usize, plaintext: &[u8], out: &mut [u8]) -> Result<usize, Error> {
    if siv_len == 0 || siv_len > BLOCK_LEN || out.len() < plaintext.len() + siv_len {
        return Err(Error::BadLength);
    }
    let (ct, siv_out) = out[..plaintext.len() + siv_len].split_at_mut(plaintext.len());
    siv_tag(&keys.km, plaintext, siv_out)?;
    ct.copy_from_slice(plaintext);
    apply_keystream(&keys.ke, siv_out, ct);
    Ok(plaintext.len() + siv_len)
}

/// Open a `ciphertext ‖ SIV` buffer produced by [`seal`], writing the
/// recovered plaintext into `out` and returning its length.
pub fn open(keys: &Keys, siv_len: usize, sealed: &[u8], out: &mut [u8]) -> Result<usize, Error> {
    if siv_len == 0 || siv_len > BLOCK_LEN || sealed.len() <= siv_len {
        return Err(Error::BadLength);
    }
    let plaintext_len = sealed.len() - siv_len;
    if out.len() < plaintext_len {
        return Err(Error::BadLength);
    }
    let (ct, received_siv) = sealed.split_at(plaintext_len);
    let plaintext = &mut out[..plaintext_len];
    plaintext.copy_from_slice(ct);
    apply_keystream(&keys.ke, received_siv, plaintext);

    let mut expected = [0u8; BLOCK_LEN];
    siv_tag(&keys.km, plaintext, &mut expected[..siv_len])?;
    if !ct_eq(&expected[..siv_len], received_siv) {
        plaintext.fill(0);
        return Err(Error::AuthenticationFailed);
    }
    Ok(plaintext_len)
}

/// Seal `plaintext` into `ct_out` (ciphertext only) and `siv_out` (the SIV
/// tag, exactly `siv_out.len()` bytes) as two independent buffers.
///
/// This is NBUS's wire layout: the ciphertext rides in `DATA` fragments and
/// the SIV rides alone in the `TRAILING` fragment.
pub fn seal_split(keys: &Keys, plaintext: &[u8], ct_out: &mut [u8], siv_out: &mut [u8]) -> Result<(), Error> {
    if siv_out.is_empty() || siv_out.len() > BLOCK_LEN || ct_out.len() < plaintext.len() {
        return Err(Error::BadLength);
    }
    siv_tag(&keys.km, plaintext, siv_out)?;
    let ct = &mut ct_out[..plaintext.len()];
    ct.copy_from_slice(plaintext);
    apply_keystream(&keys.ke, siv_out, ct);
    Ok(())
}

/// Open a ciphertext and its independently-carried SIV, writing the
/// recovered plaintext into `out`.
pub fn open_split(keys: &Keys, ciphertext: &[u8], siv: &[u8], out: &mut [u8]) -> Result<usize, Error> {
    if siv.is_empty() || siv.len() > BLOCK_LEN || ciphertext.is_empty() || out.len() < ciphertext.len() {
        return Err(Error::BadLength);
    }
    let plaintext = &mut out[..ciphertext.len()];
    plaintext.copy_from_slice(ciphertext);
    apply_keystream(&keys.ke, siv, plaintext);

    let mut expected = [0u8; BLOCK_LEN];
    siv_tag(&keys.km, plaintext, &mut expected[..siv.len()])?;
    if !ct_eq(&expected[..siv.len()], siv) {
        plaintext.fill(0);
        return Err(Error::AuthenticationFailed);
    }
    Ok(ciphertext.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let keys = derive_keys(b"0123456789abcdef");
        let plaintext = b"nbus data fragment payload";
        let mut sealed = [0u8; 64];
        let n = seal(&keys, 8, plaintext, &mut sealed).unwrap();
        let mut opened = [0u8; 64];
        let m = open(&keys, 8, &sealed[..n], &mut opened).unwrap();
        assert_eq!(&opened[..m], plaintext);
    }

    #[test]
    fn bit_flip_in_ciphertext_fails_auth() {
        let keys = derive_keys(b"0123456789abcdef");
        let plaintext = b"authenticate me";
        let mut sealed = [0u8; 64];
        let n = seal(&keys, 8, plaintext, &mut sealed).unwrap();
        sealed[0] ^= 0x01;
        let mut opened = [0u8; 64];
        assert_eq!(open(&keys, 8, &sealed[..n], &mut opened), Err(Error::AuthenticationFailed));
    }

    #[test]
    fn bit_flip_in_siv_fails_auth() {
        let keys = derive_keys(b"0123456789abcdef");
        let plaintext = b"authenticate me";
        let mut sealed = [0u8; 64];
        let n = seal(&keys, 8, plaintext, &mut sealed).unwrap();
        let last = n - 1;
        sealed[last] ^= 0x01;
        let mut opened = [0u8; 64];
        assert_eq!(open(&keys, 8, &sealed[..n], &mut opened), Err(Error::AuthenticationFailed));
    }

    #[test]
    fn split_matches_single_buffer_layout() {
        let keys = derive_keys(b"universe-key-16b");
        let plaintext = b"fragmented payload data";
        let mut ct = [0u8; 32];
        let mut siv = [0u8; 8];
        seal_split(&keys, plaintext, &mut ct, &mut siv).unwrap();

        let mut sealed = [0u8; 64];
        let n = seal(&keys, 8, plaintext, &mut sealed).unwrap();
        assert_eq!(&ct[..plaintext.len()], &sealed[..plaintext.len()]);
        assert_eq!(&siv, &sealed[plaintext.len()..n]);

        let mut opened = [0u8; 64];
        let m = open_split(&keys, &ct[..plaintext.len()], &siv, &mut opened).unwrap();
        assert_eq!(&opened[..m], plaintext);
    }

    #[test]
    fn rmac_16_byte_siv_is_supported() {
        let keys = derive_keys(b"radio-mac-universe-key");
        let plaintext = b"slot-sealed record payload bytes";
        let mut sealed = [0u8; 64];
        let n = seal(&keys, 16, plaintext, &mut sealed).unwrap();
        let mut opened = [0u8; 64];
        let m = open(&keys, 16, &sealed[..n], &mut opened).unwrap();
        assert_eq!(&opened[..m], plaintext);
    }

    #[test]
    fn open_rejects_a_sealed_buffer_no_longer_than_the_siv() {
        let keys = derive_keys(b"0123456789abcdef");
        let mut opened = [0u8; 64];
        let siv = [0u8; 8];
        assert_eq!(open(&keys, 8, &siv, &mut opened), Err(Error::BadLength));
    }

    #[test]
    fn open_split_rejects_empty_ciphertext() {
        let keys = derive_keys(b"0123456789abcdef");
        let mut opened = [0u8; 64];
        let siv = [0u8; 8];
        assert_eq!(open_split(&keys, &[], &siv, &mut opened), Err(Error::BadLength));
    }

    #[test]
    fn derive_keys_is_deterministic_and_halves_differ() {
        let a = derive_keys(b"same-key-bytes!!");
        let b = derive_keys(b"same-key-bytes!!");
        assert_eq!(a, b);
        assert_ne!(a.ke, a.km);
    }
}
