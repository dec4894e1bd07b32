use crate::{
    bitfield::Bitfield,
    page::{self, Page},
    wal::{Op, Wal},
    Config, Entry, Error, SignedValue, Tweak, MAX_DATA_SIZE, PAGE_SIZE,
};
use commonware_cryptography::{ed25519, sha256::Digest, Hasher as _, Sha256};
use commonware_runtime::{Blob, Metrics, RwLock, Storage};
use parking_lot::Mutex;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, trace, warn};

/// Name of the slot-file blob within the configured partition.
const BLOB_NAME: &[u8] = b"slots";

/// A live entry and the slot that backs it.
///
/// Records are shared: a caller that obtained a handle before a prune can still observe the
/// `invalid` flag afterwards, rather than reading a value the registry no longer vouches
/// for. Only the mutator (holding the registry's write lock) mutates a record.
pub(crate) struct Record {
    pub(crate) entry: Entry,
    /// 1-based position in the slot file; stable across updates, released on prune.
    pub(crate) slot: u64,
    /// Set when the record has been logically removed. An invalid record is never returned
    /// by `get` and never accepts updates.
    pub(crate) invalid: bool,
}

pub(crate) type Shared = Arc<Mutex<Record>>;

struct Inner<E: Storage + Metrics> {
    blob: E::Blob,
    wal: Wal<E>,
    index: HashMap<Digest, Shared>,
    usage: Bitfield,
}

/// Implementation of [Registry] storage.
///
/// Cheaply cloneable; all clones share the same state.
pub struct Registry<E: Storage + Metrics> {
    context: E,
    cfg: Config,

    inner: Arc<RwLock<Inner<E>>>,

    updates: Counter,
    prunes: Counter,
    gets: Counter,
    entries: Gauge,
}

impl<E: Storage + Metrics> Clone for Registry<E> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            cfg: self.cfg.clone(),
            inner: self.inner.clone(),
            updates: self.updates.clone(),
            prunes: self.prunes.clone(),
            gets: self.gets.clone(),
            entries: self.entries.clone(),
        }
    }
}

/// Fingerprint of a logical key: SHA-256 over the public key and tweak.
fn fingerprint(public_key: &ed25519::PublicKey, tweak: &Tweak) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(public_key.as_ref());
    hasher.update(tweak.as_ref());
    hasher.finalize()
}

/// Insert an entry recovered from disk, resolving duplicate fingerprints in favor of the
/// higher revision (the loser's slot is left clear and will be overwritten).
fn insert_loaded(
    index: &mut HashMap<Digest, Shared>,
    usage: &mut Bitfield,
    entry: Entry,
    slot: u64,
) {
    let fp = fingerprint(&entry.public_key, &entry.tweak);
    if let Some(existing) = index.get(&fp) {
        let mut existing = existing.lock();
        if existing.entry.revision >= entry.revision {
            warn!(slot, kept = existing.slot, "skipping stale duplicate entry");
            return;
        }
        warn!(slot, replaced = existing.slot, "replacing stale duplicate entry");
        usage.clear(existing.slot - 1);
        usage.set(slot - 1);
        existing.entry = entry;
        existing.slot = slot;
        return;
    }
    usage.set(slot - 1);
    index.insert(
        fp,
        Arc::new(Mutex::new(Record {
            entry,
            slot,
            invalid: false,
        })),
    );
}

impl<E: Storage + Metrics> Registry<E> {
    /// Open a registry, creating the slot file if it does not exist.
    ///
    /// The registry takes exclusive ownership of `wal`. For an existing file, the header is
    /// validated, committed-but-unapplied log transactions are replayed (and the log
    /// truncated), and the index and bitfield are rebuilt from the entry pages. Pages that
    /// fail checksum or field validation are logged and treated as free.
    pub async fn init(context: E, mut wal: Wal<E>, cfg: Config) -> Result<Self, Error> {
        let (blob, size) = context.open(&cfg.partition, BLOB_NAME).await?;
        let expected = (cfg.max_entries + 1) * PAGE_SIZE as u64;

        let mut index: HashMap<Digest, Shared> = HashMap::new();
        let mut usage = Bitfield::new(cfg.max_entries);
        if size == 0 {
            // Fresh file: size it out and stamp the header.
            blob.resize(expected).await?;
            blob.write_at(page::header(), 0).await?;
            blob.sync().await?;
            if !wal.pending().is_empty() {
                warn!("discarding write-ahead state without a slot file");
            }
            wal.truncate().await?;
            debug!(max_entries = cfg.max_entries, "created registry");
        } else {
            if size != expected {
                let disk = (size / PAGE_SIZE as u64).saturating_sub(1);
                return Err(Error::CapacityMismatch(disk, cfg.max_entries));
            }
            let header = blob.read_at(vec![0u8; PAGE_SIZE], 0).await?;
            if !page::check_header(header.as_ref()) {
                return Err(Error::UnsupportedVersion);
            }

            // Re-issue any committed writes that may not have landed, then reset the log.
            let mut replayed = 0;
            for ops in wal.pending() {
                for op in ops {
                    let end = op.offset.saturating_add(op.data.len() as u64);
                    if op.offset < PAGE_SIZE as u64 || end > size {
                        warn!(offset = op.offset, "skipping out-of-bounds log write");
                        continue;
                    }
                    blob.write_at(op.data.clone(), op.offset).await?;
                    replayed += 1;
                }
            }
            if replayed > 0 {
                blob.sync().await?;
                debug!(replayed, "replayed write-ahead log");
            }
            wal.truncate().await?;

            // Rebuild the index and bitfield from the entry pages.
            let pages_per_read = (cfg.replay_buffer.get() / PAGE_SIZE).max(1) as u64;
            let mut slot = 1u64;
            while slot <= cfg.max_entries {
                let count = pages_per_read.min(cfg.max_entries - slot + 1);
                let buf = blob
                    .read_at(
                        vec![0u8; count as usize * PAGE_SIZE],
                        slot * PAGE_SIZE as u64,
                    )
                    .await?;
                let buf = buf.as_ref();
                for i in 0..count as usize {
                    let current = slot + i as u64;
                    match page::parse(&buf[i * PAGE_SIZE..(i + 1) * PAGE_SIZE]) {
                        Page::Free => {}
                        Page::Corrupt => warn!(slot = current, "skipping corrupt page"),
                        Page::Live(entry) => insert_loaded(&mut index, &mut usage, entry, current),
                    }
                }
                slot += count;
            }
            debug!(entries = index.len(), "loaded registry");
        }

        // Initialize metrics
        let updates = Counter::default();
        let prunes = Counter::default();
        let gets = Counter::default();
        let entries = Gauge::default();
        context.register("updates", "Number of successful updates", updates.clone());
        context.register("prunes", "Number of prune passes", prunes.clone());
        context.register("gets", "Number of gets performed", gets.clone());
        context.register("entries", "Number of live entries", entries.clone());
        entries.set(index.len() as i64);

        Ok(Self {
            context,
            cfg,
            inner: Arc::new(RwLock::new(Inner {
                blob,
                wal,
                index,
                usage,
            })),
            updates,
            prunes,
            gets,
            entries,
        })
    }

    /// Insert or refresh the entry identified by (`public_key`, `value.tweak`).
    ///
    /// Admission rules are checked in order and the first failure is returned with no state
    /// change: data at most [MAX_DATA_SIZE] bytes, a valid signature, a revision strictly
    /// greater than the stored one, a record not undergoing teardown, and (for a new key) a
    /// free slot. On success the entry is durable before it becomes visible. Returns whether
    /// the key existed before the call.
    pub async fn update(
        &self,
        value: SignedValue,
        public_key: ed25519::PublicKey,
        expiry: u64,
    ) -> Result<bool, Error> {
        if value.data.len() > MAX_DATA_SIZE {
            return Err(Error::TooMuchData(value.data.len()));
        }
        if !value.verify(&public_key) {
            return Err(Error::InvalidSignature);
        }

        let fp = fingerprint(&public_key, &value.tweak);
        let mut inner = self.inner.write().await;

        // Admission against the current record (or a free slot for a new key).
        let existing = inner.index.get(&fp).cloned();
        let slot = match &existing {
            Some(record) => {
                let record = record.lock();
                if value.revision <= record.entry.revision {
                    return Err(Error::InvalidRevisionNumber(
                        record.entry.revision,
                        value.revision,
                    ));
                }
                if record.invalid {
                    return Err(Error::InvalidEntry);
                }
                record.slot
            }
            None => match inner.usage.first_unset() {
                Some(bit) => bit + 1,
                None => return Err(Error::NoFreeBit),
            },
        };

        // Stage the page and make it durable before touching the index.
        let revision = value.revision;
        let entry = Entry {
            public_key,
            tweak: value.tweak,
            revision,
            expiry,
            data: value.data,
            signature: value.signature,
        };
        let encoded = page::encode(&entry);
        let offset = slot * PAGE_SIZE as u64;
        inner
            .wal
            .commit(&[Op {
                offset,
                data: encoded.clone(),
            }])
            .await?;
        inner.blob.write_at(encoded, offset).await?;
        inner.blob.sync().await?;

        // Commit the in-memory mutation.
        let existed = match existing {
            Some(record) => {
                record.lock().entry = entry;
                true
            }
            None => {
                inner.usage.set(slot - 1);
                inner.index.insert(
                    fp,
                    Arc::new(Mutex::new(Record {
                        entry,
                        slot,
                        invalid: false,
                    })),
                );
                self.entries.inc();
                false
            }
        };

        // The page is durable; a leftover log entry only replays the same bytes on
        // restart.
        if let Err(err) = inner.wal.truncate().await {
            warn!(?err, "failed to reset write-ahead log");
        }
        self.updates.inc();
        trace!(slot, revision, existed, "updated entry");
        Ok(existed)
    }

    /// Remove every entry whose expiry is at or below `horizon`, returning the number
    /// removed.
    ///
    /// All freed pages are committed in a single log transaction. Removed records are
    /// marked invalid so outstanding handles observe the teardown. Idempotent.
    pub async fn prune(&self, horizon: u64) -> Result<u64, Error> {
        let mut inner = self.inner.write().await;

        // Collect expired records.
        let mut victims = Vec::new();
        for (fp, record) in &inner.index {
            let record = record.lock();
            if record.entry.expiry <= horizon {
                victims.push((*fp, record.slot));
            }
        }
        if victims.is_empty() {
            return Ok(0);
        }

        // Free all pages in one atomic batch.
        let ops: Vec<Op> = victims
            .iter()
            .map(|(_, slot)| Op {
                offset: slot * PAGE_SIZE as u64,
                data: page::unused(),
            })
            .collect();
        inner.wal.commit(&ops).await?;
        for op in &ops {
            inner.blob.write_at(op.data.clone(), op.offset).await?;
        }
        inner.blob.sync().await?;

        // Drop the records from memory, notifying handle holders.
        for (fp, slot) in &victims {
            if let Some(record) = inner.index.remove(fp) {
                record.lock().invalid = true;
            }
            inner.usage.clear(slot - 1);
            self.entries.dec();
        }

        // The freed pages are durable; a leftover log entry only replays the same bytes
        // on restart.
        if let Err(err) = inner.wal.truncate().await {
            warn!(?err, "failed to reset write-ahead log");
        }
        let pruned = victims.len() as u64;
        self.prunes.inc();
        debug!(pruned, horizon, "pruned expired entries");
        Ok(pruned)
    }

    /// Look up the entry identified by (`public_key`, `tweak`), returning an owned copy.
    ///
    /// Returns `None` for an absent or invalidated entry.
    pub async fn get(&self, public_key: &ed25519::PublicKey, tweak: &Tweak) -> Option<Entry> {
        self.gets.inc();
        let fp = fingerprint(public_key, tweak);
        let inner = self.inner.read().await;
        let record = inner.index.get(&fp)?;
        let record = record.lock();
        if record.invalid {
            return None;
        }
        Some(record.entry.clone())
    }

    /// The number of live entries.
    pub async fn len(&self) -> usize {
        self.inner.read().await.index.len()
    }

    /// Whether the registry holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn into_inner(self) -> Inner<E> {
        match Arc::try_unwrap(self.inner) {
            Ok(lock) => lock.into_inner(),
            Err(_) => panic!("registry still has references"),
        }
    }

    /// Close the registry, releasing its file handles.
    ///
    /// # Panics
    ///
    /// Panics if any other clone of the registry is still alive.
    pub async fn close(self) -> Result<(), Error> {
        let inner = self.into_inner();
        inner.blob.close().await?;
        inner.wal.close().await?;
        Ok(())
    }

    /// Remove all on-disk state created by this registry (and its log).
    ///
    /// # Panics
    ///
    /// Panics if any other clone of the registry is still alive.
    pub async fn destroy(self) -> Result<(), Error> {
        let context = self.context.clone();
        let cfg = self.cfg.clone();
        let inner = self.into_inner();
        inner.blob.close().await?;
        inner.wal.destroy().await?;
        context.remove(&cfg.partition, None).await?;
        Ok(())
    }
}

#[cfg(test)]
impl<E: Storage + Metrics> Registry<E> {
    /// Shared handle to a backing record, as a long-running observer would hold one.
    pub(crate) async fn record(
        &self,
        public_key: &ed25519::PublicKey,
        tweak: &Tweak,
    ) -> Option<Shared> {
        let fp = fingerprint(public_key, tweak);
        self.inner.read().await.index.get(&fp).cloned()
    }

    /// Check the cardinality, uniqueness, and range invariants.
    pub(crate) async fn audit(&self) {
        use std::collections::HashSet;
        let inner = self.inner.read().await;
        assert_eq!(inner.usage.count_ones(), inner.index.len() as u64);
        let mut slots = HashSet::new();
        for record in inner.index.values() {
            let record = record.lock();
            assert!(!record.invalid);
            assert!(record.slot >= 1 && record.slot <= inner.usage.len());
            assert!(inner.usage.is_set(record.slot - 1));
            assert!(slots.insert(record.slot));
        }
    }
}
