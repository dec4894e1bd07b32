//! A write-ahead log that makes batches of page writes atomic.
//!
//! [Wal] persists transactions of `(offset, bytes)` writes destined for some other blob.
//! A transaction is durable once [Wal::commit] returns; after a crash, [Wal::init] recovers
//! every committed transaction so the caller can re-issue the writes before trusting the
//! destination. Once the destination has been synced, the caller resets the log with
//! [Wal::truncate].
//!
//! # Format
//!
//! Transactions are appended to a single blob, each framed with a length prefix and a
//! trailing CRC32:
//!
//! ```text
//! +---+---+---+---+---------------+---+---+---+---+
//! | 0 | 1 | 2 | 3 |      ...      |  N+4 ..  N+8  |
//! +---+---+---+---+---------------+---+---+---+---+
//! |   Size (u32)  |    Payload    |    C (u32)    |
//! +---+---+---+---+---------------+---+---+---+---+
//!
//! Payload = Count (u32), then per write: Offset (u64) | Len (u32) | Data
//! C = CRC32(Size | Payload)
//! ```
//!
//! A transaction is committed iff its full frame is present with a valid checksum. On
//! recovery, the first torn or checksum-failing frame is treated as the end of the log and
//! the blob is truncated there, so a crash mid-append simply discards the unfinished
//! transaction.
//!
//! # Example
//!
//! ```rust
//! use commonware_registry::wal::{Config, Op, Wal};
//! use commonware_runtime::{deterministic, Runner};
//!
//! let executor = deterministic::Runner::default();
//! executor.start(|context| async move {
//!     let mut wal = Wal::init(
//!         context.clone(),
//!         Config {
//!             partition: "wal".into(),
//!         },
//!     )
//!     .await
//!     .unwrap();
//!     wal.commit(&[Op {
//!         offset: 512,
//!         data: vec![1, 2, 3],
//!     }])
//!     .await
//!     .unwrap();
//!
//!     // A restart recovers the committed transaction...
//!     drop(wal);
//!     let mut wal = Wal::init(
//!         context,
//!         Config {
//!             partition: "wal".into(),
//!         },
//!     )
//!     .await
//!     .unwrap();
//!     assert_eq!(wal.pending().len(), 1);
//!
//!     // ...until the caller applies it and resets the log.
//!     wal.truncate().await.unwrap();
//!     assert!(wal.pending().is_empty());
//!     wal.close().await.unwrap();
//! });
//! ```

mod storage;

pub use storage::Wal;
use thiserror::Error;

/// Errors that can occur when interacting with the [Wal].
#[derive(Debug, Error)]
pub enum Error {
    #[error("runtime error: {0}")]
    Runtime(#[from] commonware_runtime::Error),
    #[error("record too large: {0}")]
    RecordTooLarge(usize),
    #[error("invalid record at offset {0}")]
    InvalidRecord(u64),
}

/// Configuration for [Wal] storage.
#[derive(Clone)]
pub struct Config {
    /// The `commonware-runtime::Storage` partition to use for the log blob.
    pub partition: String,
}

/// A single write destined for the caller's blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Op {
    /// Byte offset in the destination blob.
    pub offset: u64,
    /// Bytes to write at `offset`.
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Blob as _, Runner, Storage as _};

    fn test_config() -> Config {
        Config {
            partition: "test_wal".into(),
        }
    }

    #[test_traced]
    fn test_empty() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut wal = Wal::init(context.clone(), test_config()).await.unwrap();
            assert!(wal.pending().is_empty());

            // Truncating an empty log is a no-op.
            wal.truncate().await.unwrap();
            assert!(wal.pending().is_empty());
            wal.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_commit_recover() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let txn1 = vec![
                Op {
                    offset: 512,
                    data: vec![1; 16],
                },
                Op {
                    offset: 1024,
                    data: vec![2; 16],
                },
            ];
            let txn2 = vec![Op {
                offset: 2048,
                data: Vec::new(),
            }];
            {
                let mut wal = Wal::init(context.clone(), test_config()).await.unwrap();
                wal.commit(&txn1).await.unwrap();
                wal.commit(&txn2).await.unwrap();

                // Drop without truncating to simulate a crash before apply.
            }

            let mut wal = Wal::init(context.clone(), test_config()).await.unwrap();
            assert_eq!(wal.pending(), &[txn1, txn2]);

            // Applying and truncating clears the log durably.
            wal.truncate().await.unwrap();
            assert!(wal.pending().is_empty());
            wal.close().await.unwrap();

            let wal = Wal::init(context.clone(), test_config()).await.unwrap();
            assert!(wal.pending().is_empty());
            wal.destroy().await.unwrap();
        });
    }

    #[test_traced]
    fn test_commit_after_truncate() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut wal = Wal::init(context.clone(), test_config()).await.unwrap();
            wal.commit(&[Op {
                offset: 512,
                data: vec![7; 8],
            }])
            .await
            .unwrap();
            wal.truncate().await.unwrap();

            let txn = vec![Op {
                offset: 1536,
                data: vec![9; 8],
            }];
            wal.commit(&txn).await.unwrap();
            drop(wal);

            // Only the post-truncate transaction survives.
            let wal = Wal::init(context.clone(), test_config()).await.unwrap();
            assert_eq!(wal.pending(), &[txn]);
            wal.destroy().await.unwrap();
        });
    }

    #[test_traced]
    fn test_torn_tail() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let txn = vec![Op {
                offset: 512,
                data: vec![5; 32],
            }];
            {
                let mut wal = Wal::init(context.clone(), test_config()).await.unwrap();
                wal.commit(&txn).await.unwrap();
            }

            // Append half a frame, as if we crashed mid-commit.
            let (blob, valid) = context.open("test_wal", b"log").await.unwrap();
            blob.write_at(vec![0x55; 7], valid).await.unwrap();
            blob.close().await.unwrap();

            // The committed transaction survives; the torn tail is discarded.
            let wal = Wal::init(context.clone(), test_config()).await.unwrap();
            assert_eq!(wal.pending(), &[txn.clone()]);
            drop(wal);
            let (blob, size) = context.open("test_wal", b"log").await.unwrap();
            assert_eq!(size, valid);
            blob.close().await.unwrap();

            // A corrupted checksum discards the record as well.
            let (blob, size) = context.open("test_wal", b"log").await.unwrap();
            let last = blob.read_at(vec![0u8; 1], size - 1).await.unwrap();
            blob.write_at(vec![last.as_ref()[0] ^ 0xFF], size - 1)
                .await
                .unwrap();
            blob.close().await.unwrap();
            let wal = Wal::init(context.clone(), test_config()).await.unwrap();
            assert!(wal.pending().is_empty());
            wal.destroy().await.unwrap();
        });
    }
}
