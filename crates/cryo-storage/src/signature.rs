use tracing::warn;

use crate::{Result, StorageBackend, StorageError, PAGE_SIZE};

/// Bytes of sector 0 the signature occupies.
pub const SIGNATURE_LEN: usize = 10;

/// Low-version image magic.
const SIG_V0: u8 = b'z';
/// High-version (v1-capable swap reuse) image magic.
const SIG_V1: u8 = b'Z';

/// Platform swap-space magic written when the device is handed back.
const SWAP_MAGIC: &[u8; 10] = b"SWAPSPACE2";
const SWAP_MAGIC_OLD: &[u8; 10] = b"SWAP-SPACE";

/// Signatures of other hibernation implementations we recognize but never
/// claim.
const FOREIGN_SIGNATURES: &[(&[u8], &str)] = &[
    (b"S1SUSPEND", "swsusp"),
    (b"S2SUSPEND", "swsusp"),
    (b"ULSUSPEND", "uswsusp"),
    (b"\xed\xc3\x02\xe9", "swsusp (binary signature)"),
];

/// Resume-previously-attempted flag, bit 7 of the flags byte.
const FLAG_RESUME_ATTEMPTED: u8 = 0x80;

/// A parsed image signature of ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSignature {
    /// 0 for the `z` magic, 1 for `Z`.
    pub version: u8,
    /// Device id of the device holding the main header.
    pub header_dev: u32,
    /// Sector of the first page of the main header.
    pub header_sector: u32,
    pub resume_attempted: bool,
}

/// What the first sector of a resume device holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureKind {
    /// An image of ours.
    Image(ImageSignature),
    /// Plain swap, no image.
    PlainSwap,
    /// Another hibernator's image; named so the caller can log it.
    Foreign(&'static str),
    /// Nothing recognizable.
    None,
}

/// Classify the first [`SIGNATURE_LEN`] bytes of sector 0.
///
/// Precedence is fixed: our magic, then the foreign table, then the
/// platform swap magics.
pub fn parse_signature(sig: &[u8; SIGNATURE_LEN]) -> SignatureKind {
    match sig[0] {
        SIG_V0 | SIG_V1 => {
            return SignatureKind::Image(ImageSignature {
                version: u8::from(sig[0] == SIG_V1),
                header_dev: u32::from_le_bytes(sig[1..5].try_into().unwrap()),
                resume_attempted: sig[5] & FLAG_RESUME_ATTEMPTED != 0,
                header_sector: u32::from_le_bytes(sig[6..10].try_into().unwrap()),
            });
        }
        _ => {}
    }
    for (magic, name) in FOREIGN_SIGNATURES {
        if sig.starts_with(magic) {
            return SignatureKind::Foreign(name);
        }
    }
    if sig == SWAP_MAGIC || sig == SWAP_MAGIC_OLD {
        return SignatureKind::PlainSwap;
    }
    SignatureKind::None
}

fn read_first_page(dev: &mut dyn StorageBackend) -> Result<[u8; PAGE_SIZE]> {
    let mut page = [0u8; PAGE_SIZE];
    dev.read_at(0, &mut page)?;
    Ok(page)
}

/// Read and classify the signature on `dev`. A foreign signature is logged
/// here so every caller gets the identification line.
pub fn read_signature(dev: &mut dyn StorageBackend) -> Result<SignatureKind> {
    let page = read_first_page(dev)?;
    let mut sig = [0u8; SIGNATURE_LEN];
    sig.copy_from_slice(&page[..SIGNATURE_LEN]);
    let kind = parse_signature(&sig);
    if let SignatureKind::Foreign(name) = kind {
        warn!(hibernator = name, "foreign hibernation signature found, not claiming it");
    }
    Ok(kind)
}

fn patch_signature(dev: &mut dyn StorageBackend, sig: &[u8; SIGNATURE_LEN]) -> Result<()> {
    // Whole-page read-modify-write; everything past the signature bytes is
    // preserved.
    let mut page = read_first_page(dev)?;
    page[..SIGNATURE_LEN].copy_from_slice(sig);
    dev.write_at(0, &page)?;
    dev.flush()
}

/// Stamp `dev` with an image signature.
pub fn write_image_signature(dev: &mut dyn StorageBackend, image: &ImageSignature) -> Result<()> {
    if image.header_sector >= 1 << 31 {
        return Err(StorageError::Unsupported(
            "header sector does not fit the signature encoding",
        ));
    }
    let mut sig = [0u8; SIGNATURE_LEN];
    sig[0] = if image.version == 0 { SIG_V0 } else { SIG_V1 };
    sig[1..5].copy_from_slice(&image.header_dev.to_le_bytes());
    sig[5] = if image.resume_attempted {
        FLAG_RESUME_ATTEMPTED
    } else {
        0
    };
    sig[6..10].copy_from_slice(&image.header_sector.to_le_bytes());
    patch_signature(dev, &sig)
}

/// Set or clear the resume-attempted flag of an existing image signature.
pub fn set_resume_attempted(dev: &mut dyn StorageBackend, flag: bool) -> Result<()> {
    let page = read_first_page(dev)?;
    let mut sig = [0u8; SIGNATURE_LEN];
    sig.copy_from_slice(&page[..SIGNATURE_LEN]);
    match parse_signature(&sig) {
        SignatureKind::Image(mut image) => {
            image.resume_attempted = flag;
            write_image_signature(dev, &image)
        }
        _ => Err(StorageError::Corrupt("no image signature to flag")),
    }
}

/// Hand the device back to the platform: rewrite the plain swap magic.
pub fn restore_swap_signature(dev: &mut dyn StorageBackend) -> Result<()> {
    patch_signature(dev, SWAP_MAGIC)
}
