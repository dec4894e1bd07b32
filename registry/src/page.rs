//! On-disk layout of slot-file pages.
//!
//! Each page is [PAGE_SIZE] bytes: a SHA-256 checksum over the remainder of the page,
//! followed by the entry body. All integers are little-endian.
//!
//! ```text
//! +----------+------+------------+------+-------+----------+--------+---------+------+-----------+---------+
//! | 0 ..  32 |  32  |  33 .. 65  |  65  | 66 .. |  98..106 | 106..  |   114   | 115..|  228..292 |  ...    |
//! +----------+------+------------+------+-------+----------+--------+---------+------+-----------+---------+
//! | Checksum | Used | Public Key | Algo | Tweak | Revision | Expiry | Datalen | Data | Signature | Padding |
//! +----------+------+------------+------+-------+----------+--------+---------+------+-----------+---------+
//!
//! Checksum = SHA-256(bytes 32..PAGE_SIZE)
//! ```
//!
//! A page that is entirely zero has never been written and is free. A page whose checksum
//! verifies but whose `used` byte is zero has been durably freed and is also free,
//! regardless of what the rest of the body decodes to. Anything else that fails to verify
//! or decode is corrupt; the caller logs it and treats the slot as free.

use crate::{Entry, Tweak, MAX_DATA_SIZE, PAGE_SIZE};
use commonware_codec::{DecodeExt, FixedSize};
use commonware_cryptography::{ed25519, sha256, Hasher as _, Sha256};

/// Version identifier persisted at the start of the header page.
pub(crate) const VERSION: [u8; 10] = *b"registry/1";

/// Algorithm tag for ed25519 public keys. The only algorithm currently supported.
const KEY_ALGO_ED25519: u8 = 1;

const CHECKSUM_SIZE: usize = sha256::Digest::SIZE;
const BODY_SIZE: usize = PAGE_SIZE - CHECKSUM_SIZE;

// Field offsets within the body.
const USED_OFFSET: usize = 0;
const KEY_OFFSET: usize = USED_OFFSET + 1;
const ALGO_OFFSET: usize = KEY_OFFSET + ed25519::PublicKey::SIZE;
const TWEAK_OFFSET: usize = ALGO_OFFSET + 1;
const REVISION_OFFSET: usize = TWEAK_OFFSET + Tweak::SIZE;
const EXPIRY_OFFSET: usize = REVISION_OFFSET + u64::SIZE;
const DATA_LEN_OFFSET: usize = EXPIRY_OFFSET + u64::SIZE;
const DATA_OFFSET: usize = DATA_LEN_OFFSET + 1;
const SIG_OFFSET: usize = DATA_OFFSET + MAX_DATA_SIZE;

// The fields (with maximum-length data) must fit in the body.
const _: () = assert!(SIG_OFFSET + ed25519::Signature::SIZE <= BODY_SIZE);

/// Result of parsing an entry page.
pub(crate) enum Page {
    /// The slot holds no entry (never written, or durably freed).
    Free,
    /// The page failed checksum or field validation.
    Corrupt,
    /// The slot holds a live entry.
    Live(Entry),
}

/// Build the header page.
pub(crate) fn header() -> Vec<u8> {
    let mut page = vec![0u8; PAGE_SIZE];
    page[..VERSION.len()].copy_from_slice(&VERSION);
    page
}

/// Whether a header page carries the expected version identifier.
pub(crate) fn check_header(page: &[u8]) -> bool {
    page.len() >= VERSION.len() && page[..VERSION.len()] == VERSION
}

/// Encode a live entry as a full page (checksum included).
pub(crate) fn encode(entry: &Entry) -> Vec<u8> {
    debug_assert!(entry.data.len() <= MAX_DATA_SIZE);
    let mut page = vec![0u8; PAGE_SIZE];
    {
        let body = &mut page[CHECKSUM_SIZE..];
        body[USED_OFFSET] = 1;
        body[KEY_OFFSET..ALGO_OFFSET].copy_from_slice(entry.public_key.as_ref());
        body[ALGO_OFFSET] = KEY_ALGO_ED25519;
        body[TWEAK_OFFSET..REVISION_OFFSET].copy_from_slice(entry.tweak.as_ref());
        body[REVISION_OFFSET..EXPIRY_OFFSET].copy_from_slice(&entry.revision.to_le_bytes());
        body[EXPIRY_OFFSET..DATA_LEN_OFFSET].copy_from_slice(&entry.expiry.to_le_bytes());
        body[DATA_LEN_OFFSET] = entry.data.len() as u8;
        body[DATA_OFFSET..DATA_OFFSET + entry.data.len()].copy_from_slice(&entry.data);
        body[SIG_OFFSET..SIG_OFFSET + ed25519::Signature::SIZE]
            .copy_from_slice(entry.signature.as_ref());
    }
    let checksum = Sha256::hash(&page[CHECKSUM_SIZE..]);
    page[..CHECKSUM_SIZE].copy_from_slice(checksum.as_ref());
    page
}

/// Encode a durably-freed page (checksummed, `used = 0`, zero body).
pub(crate) fn unused() -> Vec<u8> {
    let mut page = vec![0u8; PAGE_SIZE];
    let checksum = Sha256::hash(&page[CHECKSUM_SIZE..]);
    page[..CHECKSUM_SIZE].copy_from_slice(checksum.as_ref());
    page
}

/// Parse an entry page.
pub(crate) fn parse(page: &[u8]) -> Page {
    debug_assert_eq!(page.len(), PAGE_SIZE);

    // A never-written slot is all zeros (a real checksum is never zero).
    if page.iter().all(|&b| b == 0) {
        return Page::Free;
    }

    let (checksum, body) = page.split_at(CHECKSUM_SIZE);
    if Sha256::hash(body).as_ref() != checksum {
        return Page::Corrupt;
    }
    match body[USED_OFFSET] {
        0 => return Page::Free,
        1 => {}
        _ => return Page::Corrupt,
    }
    if body[ALGO_OFFSET] != KEY_ALGO_ED25519 {
        return Page::Corrupt;
    }
    let data_len = body[DATA_LEN_OFFSET] as usize;
    if data_len > MAX_DATA_SIZE {
        return Page::Corrupt;
    }
    let public_key = match ed25519::PublicKey::decode(&body[KEY_OFFSET..ALGO_OFFSET]) {
        Ok(key) => key,
        Err(_) => return Page::Corrupt,
    };
    let tweak = match Tweak::decode(&body[TWEAK_OFFSET..REVISION_OFFSET]) {
        Ok(tweak) => tweak,
        Err(_) => return Page::Corrupt,
    };
    let signature = match ed25519::Signature::decode(
        &body[SIG_OFFSET..SIG_OFFSET + ed25519::Signature::SIZE],
    ) {
        Ok(signature) => signature,
        Err(_) => return Page::Corrupt,
    };
    let revision = u64::from_le_bytes(body[REVISION_OFFSET..EXPIRY_OFFSET].try_into().unwrap());
    let expiry = u64::from_le_bytes(body[EXPIRY_OFFSET..DATA_LEN_OFFSET].try_into().unwrap());
    let data = body[DATA_OFFSET..DATA_OFFSET + data_len].to_vec();

    Page::Live(Entry {
        public_key,
        tweak,
        revision,
        expiry,
        data,
        signature,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SignedValue;
    use commonware_cryptography::{PrivateKeyExt as _, Signer as _};

    fn test_entry(data: Vec<u8>) -> Entry {
        let signer = ed25519::PrivateKey::from_seed(42);
        let tweak = Tweak::new([3u8; 32]);
        let value = SignedValue::sign(&signer, tweak.clone(), data.clone(), 7);
        Entry {
            public_key: signer.public_key(),
            tweak,
            revision: 7,
            expiry: 1000,
            data,
            signature: value.signature,
        }
    }

    #[test]
    fn test_encode_parse() {
        let entry = test_entry(b"some data".to_vec());
        let page = encode(&entry);
        assert_eq!(page.len(), PAGE_SIZE);
        match parse(&page) {
            Page::Live(parsed) => assert_eq!(parsed, entry),
            _ => panic!("expected live entry"),
        }

        // Maximum-length data still fits.
        let entry = test_entry(vec![0xAB; MAX_DATA_SIZE]);
        match parse(&encode(&entry)) {
            Page::Live(parsed) => assert_eq!(parsed, entry),
            _ => panic!("expected live entry"),
        }
    }

    #[test]
    fn test_free_pages() {
        // Never-written slot.
        assert!(matches!(parse(&vec![0u8; PAGE_SIZE]), Page::Free));

        // Durably-freed slot.
        assert!(matches!(parse(&unused()), Page::Free));
    }

    #[test]
    fn test_corruption() {
        let entry = test_entry(b"payload".to_vec());
        let mut page = encode(&entry);

        // Flip a body byte: checksum fails.
        page[CHECKSUM_SIZE + 5] ^= 0xFF;
        assert!(matches!(parse(&page), Page::Corrupt));

        // Flip a checksum byte instead.
        let mut page = encode(&entry);
        page[0] ^= 0xFF;
        assert!(matches!(parse(&page), Page::Corrupt));

        // A valid checksum over a nonsense used flag is still corrupt.
        let mut page = encode(&entry);
        page[CHECKSUM_SIZE + USED_OFFSET] = 2;
        let checksum = Sha256::hash(&page[CHECKSUM_SIZE..]);
        page[..CHECKSUM_SIZE].copy_from_slice(checksum.as_ref());
        assert!(matches!(parse(&page), Page::Corrupt));

        // Same for an oversized data length.
        let mut page = encode(&entry);
        page[CHECKSUM_SIZE + DATA_LEN_OFFSET] = (MAX_DATA_SIZE + 1) as u8;
        let checksum = Sha256::hash(&page[CHECKSUM_SIZE..]);
        page[..CHECKSUM_SIZE].copy_from_slice(checksum.as_ref());
        assert!(matches!(parse(&page), Page::Corrupt));
    }

    #[test]
    fn test_header() {
        let page = header();
        assert_eq!(page.len(), PAGE_SIZE);
        assert!(check_header(&page));
        assert!(page[VERSION.len()..].iter().all(|&b| b == 0));

        let mut page = header();
        page[0] = b'X';
        assert!(!check_header(&page));
    }
}
