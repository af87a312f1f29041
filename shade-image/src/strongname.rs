//! Strong-name key blobs, hashing and signing.
//!
//! Key material arrives as CAPI RSA blobs: a public blob (type `0x06`,
//! magic `RSA1`) or a public-plus-private blob (type `0x07`, magic `RSA2`),
//! with all multi-byte integers little-endian. The signature written into
//! the image is the PKCS#1 v1.5 signature of the SHA-1 digest of every file
//! byte outside the signature window and the optional-header checksum,
//! stored little-endian as CAPI does.

use num_bigint::BigUint;
use sha1::{Digest, Sha1};

use crate::error::{Error, ErrorKind, Result};

const BLOB_TYPE_PUBLIC: u8 = 0x06;
const BLOB_TYPE_PRIVATE: u8 = 0x07;
const MAGIC_RSA1: u32 = 0x3141_5352;
const MAGIC_RSA2: u32 = 0x3241_5352;
const CALG_RSA_SIGN: u32 = 0x0000_2400;
const CALG_SHA1: u32 = 0x0000_8004;

/// The ASN.1 DigestInfo prefix for a SHA-1 hash in PKCS#1 v1.5 padding.
const SHA1_DIGEST_INFO: [u8; 15] = [
    0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2B, 0x0E, 0x03, 0x02, 0x1A, 0x05, 0x00, 0x04, 0x14,
];

/// An RSA strong-name key parsed from a CAPI blob.
#[derive(Clone)]
pub struct StrongNameKey {
    modulus: BigUint,
    public_exponent: BigUint,
    private_exponent: Option<BigUint>,
    modulus_len: usize,
    public_blob: Vec<u8>,
}

impl std::fmt::Debug for StrongNameKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrongNameKey")
            .field("bits", &(self.modulus_len * 8))
            .field("has_private", &self.private_exponent.is_some())
            .finish()
    }
}

fn read_u32(blob: &[u8], offset: usize) -> Result<u32> {
    blob.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
        .ok_or_else(|| ErrorKind::Key("key blob truncated").into())
}

impl StrongNameKey {
    /// Parses a CAPI RSA key blob.
    ///
    /// Accepts both bare CAPI blobs (the layout of `.snk` files) and blobs
    /// carrying the 12-byte signature/hash-algorithm prefix used when a
    /// public key is embedded into metadata.
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        let body = Self::strip_metadata_header(blob);

        let blob_type = *body.first().ok_or(ErrorKind::Key("empty key blob"))?;
        let magic = read_u32(body, 8)?;
        match (blob_type, magic) {
            (BLOB_TYPE_PUBLIC, MAGIC_RSA1) | (BLOB_TYPE_PRIVATE, MAGIC_RSA2) => {}
            _ => return Err(ErrorKind::Key("unrecognized key blob type or magic").into()),
        }

        let bit_len = read_u32(body, 12)? as usize;
        if bit_len == 0 || bit_len % 8 != 0 {
            return Err(ErrorKind::Key("invalid key length").into());
        }
        let modulus_len = bit_len / 8;
        let public_exponent = read_u32(body, 16)?;

        let modulus_bytes = body
            .get(20..20 + modulus_len)
            .ok_or(ErrorKind::Key("key blob truncated"))?;
        let modulus = BigUint::from_bytes_le(modulus_bytes);

        let private_exponent = if blob_type == BLOB_TYPE_PRIVATE {
            // modulus, then p, q, dp, dq, iq at half length, then d.
            let d_offset = 20 + modulus_len + 5 * (modulus_len / 2);
            let d_bytes = body
                .get(d_offset..d_offset + modulus_len)
                .ok_or(ErrorKind::Key("key blob truncated"))?;
            Some(BigUint::from_bytes_le(d_bytes))
        } else {
            None
        };

        let public_blob = Self::build_public_blob(bit_len as u32, public_exponent, modulus_bytes);

        Ok(Self {
            modulus,
            // The stored exponent is a fixed 4-byte field; BigUint trims it
            // to its significant form.
            public_exponent: BigUint::from(public_exponent),
            private_exponent,
            modulus_len,
            public_blob,
        })
    }

    /// Reads a key blob from a `.snk` file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let blob = std::fs::read(path)?;
        Self::from_blob(&blob)
    }

    fn strip_metadata_header(blob: &[u8]) -> &[u8] {
        // An embedded public key is prefixed with SigAlgId, HashAlgId and a
        // length field; the CAPI header then starts at offset 12.
        if blob.len() > 12
            && (blob[0] != BLOB_TYPE_PUBLIC && blob[0] != BLOB_TYPE_PRIVATE)
            && (blob[12] == BLOB_TYPE_PUBLIC || blob[12] == BLOB_TYPE_PRIVATE)
        {
            &blob[12..]
        } else {
            blob
        }
    }

    fn build_public_blob(bit_len: u32, public_exponent: u32, modulus_le: &[u8]) -> Vec<u8> {
        let body_len = 20 + modulus_le.len();
        let mut blob = Vec::with_capacity(12 + body_len);
        blob.extend_from_slice(&CALG_RSA_SIGN.to_le_bytes());
        blob.extend_from_slice(&CALG_SHA1.to_le_bytes());
        blob.extend_from_slice(&(body_len as u32).to_le_bytes());
        blob.push(BLOB_TYPE_PUBLIC);
        blob.push(0x02);
        blob.extend_from_slice(&[0, 0]);
        blob.extend_from_slice(&CALG_RSA_SIGN.to_le_bytes());
        blob.extend_from_slice(&MAGIC_RSA1.to_le_bytes());
        blob.extend_from_slice(&bit_len.to_le_bytes());
        blob.extend_from_slice(&public_exponent.to_le_bytes());
        blob.extend_from_slice(modulus_le);
        blob
    }

    /// The embeddable public key blob, including the 12-byte metadata
    /// prefix. This is what `InternalsVisibleTo` and assembly manifests
    /// carry.
    pub fn public_key_blob(&self) -> &[u8] {
        &self.public_blob
    }

    /// The 8-byte public key token derived from the public key blob.
    pub fn token(&self) -> [u8; 8] {
        public_key_token(&self.public_blob)
    }

    /// The modulus length in bytes, which is also the signature length.
    pub fn signature_len(&self) -> usize {
        self.modulus_len
    }

    /// Whether the blob carried a private exponent and can sign.
    pub fn can_sign(&self) -> bool {
        self.private_exponent.is_some()
    }

    /// Computes the raw PKCS#1 v1.5 signature of a SHA-1 digest, returned
    /// little-endian as stored in the image.
    fn sign_digest(&self, digest: &[u8; 20]) -> Result<Vec<u8>> {
        let private_exponent = self
            .private_exponent
            .as_ref()
            .ok_or(ErrorKind::Key("key blob has no private exponent"))?;

        let k = self.modulus_len;
        let payload_len = SHA1_DIGEST_INFO.len() + digest.len();
        if k < payload_len + 11 {
            return Err(ErrorKind::Key("key too small for a SHA-1 signature").into());
        }

        let mut em = Vec::with_capacity(k);
        em.push(0x00);
        em.push(0x01);
        em.resize(k - payload_len - 1, 0xFF);
        em.push(0x00);
        em.extend_from_slice(&SHA1_DIGEST_INFO);
        em.extend_from_slice(digest);

        let message = BigUint::from_bytes_be(&em);
        let signature = message.modpow(private_exponent, &self.modulus);

        let mut le = signature.to_bytes_le();
        le.resize(k, 0);
        Ok(le)
    }

    /// Verifies a little-endian signature against a SHA-1 digest.
    ///
    /// Used by tests and diagnostics; the editor itself only signs.
    pub fn verify_digest(&self, digest: &[u8; 20], signature_le: &[u8]) -> bool {
        let signature = BigUint::from_bytes_le(signature_le);
        let recovered = signature.modpow(&self.public_exponent, &self.modulus);
        let mut em = recovered.to_bytes_be();
        // Restore the leading zero byte dropped by the integer conversion.
        while em.len() < self.modulus_len {
            em.insert(0, 0);
        }
        let payload_len = SHA1_DIGEST_INFO.len() + digest.len();
        if em.len() != self.modulus_len || self.modulus_len < payload_len + 11 {
            return false;
        }
        let (padding, payload) = em.split_at(self.modulus_len - payload_len);
        padding[0] == 0x00
            && padding[1] == 0x01
            && padding[2..padding.len() - 1].iter().all(|b| *b == 0xFF)
            && padding[padding.len() - 1] == 0x00
            && payload[..SHA1_DIGEST_INFO.len()] == SHA1_DIGEST_INFO
            && payload[SHA1_DIGEST_INFO.len()..] == digest[..]
    }
}

/// The last 8 bytes of the SHA-1 hash of a public key blob, reversed.
pub fn public_key_token(public_key_blob: &[u8]) -> [u8; 8] {
    let digest = Sha1::digest(public_key_blob);
    let mut token = [0u8; 8];
    for (i, byte) in digest[12..20].iter().rev().enumerate() {
        token[i] = *byte;
    }
    token
}

/// Computes the strong-name digest of an image: every byte except the
/// signature window and the 4-byte optional-header checksum.
pub(crate) fn image_digest(
    data: &[u8],
    checksum_offset: usize,
    window: std::ops::Range<usize>,
) -> Result<[u8; 20]> {
    if checksum_offset + 4 > window.start || window.end > data.len() {
        return Err(ErrorKind::BadImage("signature window overlaps the headers").into());
    }
    let mut hasher = Sha1::new();
    hasher.update(&data[..checksum_offset]);
    hasher.update(&data[checksum_offset + 4..window.start]);
    hasher.update(&data[window.end..]);
    Ok(hasher.finalize().into())
}

/// Verifies a saved image's strong-name signature against a key's public
/// half.
///
/// Returns `false` when the signature window is missing, zeroed or does not
/// match the digest.
pub fn verify_image(data: &[u8], key: &StrongNameKey) -> Result<bool> {
    let pe = crate::pe::PeImage::parse(data)?;
    let Some(window) = pe.strong_name_range()? else {
        return Ok(false);
    };
    if data[window.clone()].iter().all(|b| *b == 0) {
        return Ok(false);
    }

    let digest = image_digest(data, pe.checksum_offset(), window.clone())?;
    Ok(key.verify_digest(&digest, &data[window]))
}

/// Signs the image in place, writing the signature into its reserved window.
#[tracing::instrument(level = "debug", skip_all)]
pub(crate) fn sign_image(
    data: &mut [u8],
    checksum_offset: usize,
    window: std::ops::Range<usize>,
    key: &StrongNameKey,
) -> Result<()> {
    if window.len() != key.signature_len() {
        return Err(Error::from(ErrorKind::Key(
            "signature window size does not match the key length",
        )));
    }
    data[window.clone()].fill(0);
    let digest = image_digest(data, checksum_offset, window.clone())?;
    let signature = key.sign_digest(&digest)?;
    data[window].copy_from_slice(&signature);
    Ok(())
}
