//! Fixed-capacity, crash-consistent storage for signed, revision-numbered records.
//!
//! A [Registry] holds small values written by remote, untrusted writers. Each value is
//! authenticated by the writer's public key, carries a monotonically increasing revision
//! number, and occupies exactly one slot in a pre-sized file. Writers refresh their values
//! with strictly newer revisions; the host reclaims slots once a value's expiry height has
//! passed. All mutations are staged through a [wal::Wal] so that a crash at any point leaves
//! the registry in a state it can reload exactly.
//!
//! # Format
//!
//! The slot file is an array of [PAGE_SIZE]-byte pages. Page 0 holds a version identifier;
//! pages `1..=max_entries` each hold one entry protected by a SHA-256 checksum:
//!
//! ```text
//! +----------+-----------+----------+-----------+--------+----------+-----------+
//! |  Header  | Checksum0 |  Entry0  | Checksum1 | Entry1 |   ...    |  EntryN-1 |
//! +----------+-----------+----------+-----------+--------+----------+-----------+
//! |  1 page  |        1 page        |        1 page       |   ...   checksum = SHA-256(entry)
//! ```
//!
//! A page whose checksum does not verify is logged and treated as free on load, so bit-rot
//! or a torn write costs a single slot rather than the file. A page whose `used` flag is
//! zero (or that has never been written) is free.
//!
//! # Durability
//!
//! An update is made durable before it becomes visible: the new page is committed to the
//! write-ahead log, applied to the slot file, and synced, all before the in-memory index is
//! touched. On startup, committed-but-unapplied log transactions are replayed and the log is
//! truncated, so an update that returned success is observed after any restart.
//!
//! # Concurrency
//!
//! [Registry] is cheaply cloneable and safe to share across tasks. A single reader-writer
//! lock serializes `update` and `prune` (held across the durability wait) while `get` takes
//! it in shared mode. Records are individually lockable, so a caller holding a record handle
//! across a prune observes the record's `invalid` flag rather than a stale value.
//!
//! # Example
//!
//! ```rust
//! use commonware_cryptography::{ed25519, PrivateKeyExt as _, Signer as _};
//! use commonware_registry::{wal, Config, Registry, SignedValue, Tweak};
//! use commonware_runtime::{deterministic, Runner};
//! use commonware_utils::NZUsize;
//!
//! let executor = deterministic::Runner::default();
//! executor.start(|context| async move {
//!     // Open a write-ahead log and a registry with room for 128 entries.
//!     let wal = wal::Wal::init(
//!         context.clone(),
//!         wal::Config {
//!             partition: "registry_wal".into(),
//!         },
//!     )
//!     .await
//!     .unwrap();
//!     let registry = Registry::init(
//!         context,
//!         wal,
//!         Config {
//!             partition: "registry".into(),
//!             max_entries: 128,
//!             replay_buffer: NZUsize!(1 << 16),
//!         },
//!     )
//!     .await
//!     .unwrap();
//!
//!     // Insert a signed value.
//!     let signer = ed25519::PrivateKey::from_seed(0);
//!     let tweak = Tweak::new([7u8; 32]);
//!     let value = SignedValue::sign(&signer, tweak.clone(), b"hello".to_vec(), 1);
//!     let existed = registry.update(value, signer.public_key(), 100).await.unwrap();
//!     assert!(!existed);
//!
//!     // Read it back.
//!     let entry = registry.get(&signer.public_key(), &tweak).await.unwrap();
//!     assert_eq!(entry.data, b"hello".to_vec());
//!     registry.close().await.unwrap();
//! });
//! ```

pub mod bitfield;
mod page;
mod storage;
pub mod wal;

pub use storage::Registry;

use commonware_cryptography::{ed25519, Signer as _, Verifier as _};
use commonware_utils::sequence::FixedBytes;
use std::num::NonZeroUsize;
use thiserror::Error;

/// Size of each page in the slot file.
///
/// Page 0 is the header; page `i` (1-based) backs slot `i` at byte offset `i * PAGE_SIZE`.
pub const PAGE_SIZE: usize = 512;

/// Maximum length of a value's data. Writers assume this bound; it is part of the wire
/// contract and must not change without a version bump.
pub const MAX_DATA_SIZE: usize = 113;

/// Domain separator for entry signatures.
const NAMESPACE: &[u8] = b"commonware-registry";

/// Writer-chosen discriminator. A logical record is identified by the pair
/// (public key, tweak).
pub type Tweak = FixedBytes<32>;

/// Errors that can occur when interacting with the [Registry].
#[derive(Debug, Error)]
pub enum Error {
    #[error("runtime error: {0}")]
    Runtime(#[from] commonware_runtime::Error),
    #[error("wal error: {0}")]
    Wal(#[from] wal::Error),
    #[error("too much data: {0} > {MAX_DATA_SIZE}")]
    TooMuchData(usize),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid revision number: {1} <= {0}")]
    InvalidRevisionNumber(u64, u64),
    #[error("entry invalidated")]
    InvalidEntry,
    #[error("no free bit")]
    NoFreeBit,
    #[error("unsupported version")]
    UnsupportedVersion,
    #[error("capacity mismatch: file holds {0} entries, requested {1}")]
    CapacityMismatch(u64, u64),
}

/// Configuration for [Registry] storage.
#[derive(Clone)]
pub struct Config {
    /// The `commonware-runtime::Storage` partition to use for the slot file.
    pub partition: String,

    /// Number of entry slots. Fixed at creation; opening an existing file with a
    /// different value fails.
    pub max_entries: u64,

    /// The size of the read buffer used to scan the slot file on startup.
    pub replay_buffer: NonZeroUsize,
}

/// A signed, revision-numbered value presented by a writer.
///
/// The signature covers the tweak, the data, and the revision, bound to this crate's
/// namespace. It does not cover the expiry: the expiry is chosen by the paying party and
/// may be extended without the writer re-signing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedValue {
    pub tweak: Tweak,
    pub data: Vec<u8>,
    pub revision: u64,
    pub signature: ed25519::Signature,
}

impl SignedValue {
    /// Construct a value and sign it with `signer`.
    pub fn sign(signer: &ed25519::PrivateKey, tweak: Tweak, data: Vec<u8>, revision: u64) -> Self {
        let signature = signer.sign(NAMESPACE, &message(&tweak, &data, revision));
        Self {
            tweak,
            data,
            revision,
            signature,
        }
    }

    /// Verify the value's signature against `public_key`.
    pub fn verify(&self, public_key: &ed25519::PublicKey) -> bool {
        public_key.verify(
            NAMESPACE,
            &message(&self.tweak, &self.data, self.revision),
            &self.signature,
        )
    }
}

/// Canonical signing payload. The tweak and revision are fixed-size, so the encoding is
/// unambiguous for any data length.
fn message(tweak: &Tweak, data: &[u8], revision: u64) -> Vec<u8> {
    let mut msg = Vec::with_capacity(tweak.len() + data.len() + u64::BITS as usize / 8);
    msg.extend_from_slice(tweak.as_ref());
    msg.extend_from_slice(data);
    msg.extend_from_slice(&revision.to_le_bytes());
    msg
}

/// An owned copy of a live registry entry, as returned by [Registry::get].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub public_key: ed25519::PublicKey,
    pub tweak: Tweak,
    pub revision: u64,
    pub expiry: u64,
    pub data: Vec<u8>,
    pub signature: ed25519::Signature,
}
