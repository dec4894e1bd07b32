use super::{Config, Error, Op};
use bytes::BufMut;
use commonware_runtime::{Blob, Metrics, Storage};
use prometheus_client::metrics::counter::Counter;
use tracing::{debug, warn};

/// Name of the log blob within the configured partition.
const BLOB_NAME: &[u8] = b"log";

/// Implementation of [Wal] storage.
pub struct Wal<E: Storage + Metrics> {
    context: E,
    cfg: Config,

    blob: E::Blob,
    /// End of the last committed transaction; the next frame is appended here.
    size: u64,
    pending: Vec<Vec<Op>>,

    commits: Counter,
    truncates: Counter,
}

impl<E: Storage + Metrics> Wal<E> {
    /// Open the log, recovering any committed transactions.
    ///
    /// The first torn or checksum-failing frame is treated as the end of the log and the
    /// blob is truncated there.
    pub async fn init(context: E, cfg: Config) -> Result<Self, Error> {
        let (blob, size) = context.open(&cfg.partition, BLOB_NAME).await?;

        let mut pending = Vec::new();
        let mut valid = 0u64;
        if size > 0 {
            let buf = blob.read_at(vec![0u8; size as usize], 0).await?;
            let buf = buf.as_ref();
            let mut offset = 0usize;
            while let Some((ops, next)) = read_record(buf, offset)? {
                pending.push(ops);
                offset = next;
            }
            valid = offset as u64;
            if valid < size {
                warn!(size, valid, "truncating torn write-ahead log");
                blob.resize(valid).await?;
                blob.sync().await?;
            }
        }
        debug!(transactions = pending.len(), "loaded write-ahead log");

        // Initialize metrics
        let commits = Counter::default();
        let truncates = Counter::default();
        context.register("commits", "Number of transactions committed", commits.clone());
        context.register("truncates", "Number of times the log was reset", truncates.clone());

        Ok(Self {
            context,
            cfg,
            blob,
            size: valid,
            pending,
            commits,
            truncates,
        })
    }

    /// Recovered transactions that were committed but may not yet have been applied, in
    /// commit order.
    pub fn pending(&self) -> &[Vec<Op>] {
        &self.pending
    }

    /// Append one transaction containing `ops` and wait for it to become durable.
    ///
    /// When this returns, a restart will surface the transaction via [Self::pending] until
    /// the log is truncated.
    pub async fn commit(&mut self, ops: &[Op]) -> Result<(), Error> {
        let mut payload_len = 4usize;
        for op in ops {
            payload_len += 8 + 4 + op.data.len();
        }
        if payload_len > u32::MAX as usize {
            return Err(Error::RecordTooLarge(payload_len));
        }

        let mut buf = Vec::with_capacity(4 + payload_len + 4);
        buf.put_u32(payload_len as u32);
        buf.put_u32(ops.len() as u32);
        for op in ops {
            buf.put_u64(op.offset);
            buf.put_u32(op.data.len() as u32);
            buf.put_slice(&op.data);
        }
        let checksum = crc32fast::hash(&buf);
        buf.put_u32(checksum);

        let len = buf.len() as u64;
        self.blob.write_at(buf, self.size).await?;
        self.blob.sync().await?;
        self.size += len;
        self.commits.inc();
        Ok(())
    }

    /// Reset the log once every recovered or committed transaction has been applied (and
    /// the destination synced). Idempotent.
    ///
    /// On failure the log is unchanged: recovered transactions stay visible via
    /// [Self::pending] and the append offset still tracks the on-disk frames.
    pub async fn truncate(&mut self) -> Result<(), Error> {
        if self.size == 0 {
            self.pending.clear();
            return Ok(());
        }
        self.blob.resize(0).await?;
        self.blob.sync().await?;
        self.pending.clear();
        self.size = 0;
        self.truncates.inc();
        Ok(())
    }

    /// Close the log.
    pub async fn close(self) -> Result<(), Error> {
        self.blob.sync().await?;
        self.blob.close().await?;
        Ok(())
    }

    /// Remove all on-disk state created by this log.
    pub async fn destroy(self) -> Result<(), Error> {
        self.blob.close().await?;
        self.context.remove(&self.cfg.partition, None).await?;
        Ok(())
    }
}

/// Read the frame starting at `offset`, returning its ops and the offset of the next
/// frame. Returns `None` for a torn or checksum-failing frame (the end of the log).
fn read_record(buf: &[u8], offset: usize) -> Result<Option<(Vec<Op>, usize)>, Error> {
    let len = buf.len();
    if offset + 4 > len {
        return Ok(None);
    }
    let payload_len = u32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
    let total = match payload_len.checked_add(8) {
        Some(total) => total,
        None => return Ok(None),
    };
    if offset + total > len {
        return Ok(None);
    }
    let payload_end = offset + 4 + payload_len;
    let expected = crc32fast::hash(&buf[offset..payload_end]);
    let stored = u32::from_be_bytes(buf[payload_end..payload_end + 4].try_into().unwrap());
    if expected != stored {
        return Ok(None);
    }
    let ops = parse_ops(&buf[offset + 4..payload_end], offset as u64)?;
    Ok(Some((ops, offset + total)))
}

/// Parse a checksum-verified payload. Any inconsistency past this point indicates an
/// incompatible log, not a torn write, and is surfaced as an error.
fn parse_ops(payload: &[u8], at: u64) -> Result<Vec<Op>, Error> {
    if payload.len() < 4 {
        return Err(Error::InvalidRecord(at));
    }
    let count = u32::from_be_bytes(payload[..4].try_into().unwrap()) as usize;
    let mut ops = Vec::with_capacity(count.min(payload.len() / 12));
    let mut cursor = 4usize;
    for _ in 0..count {
        if cursor + 12 > payload.len() {
            return Err(Error::InvalidRecord(at));
        }
        let offset = u64::from_be_bytes(payload[cursor..cursor + 8].try_into().unwrap());
        let data_len =
            u32::from_be_bytes(payload[cursor + 8..cursor + 12].try_into().unwrap()) as usize;
        cursor += 12;
        if cursor + data_len > payload.len() {
            return Err(Error::InvalidRecord(at));
        }
        ops.push(Op {
            offset,
            data: payload[cursor..cursor + data_len].to_vec(),
        });
        cursor += data_len;
    }
    if cursor != payload.len() {
        return Err(Error::InvalidRecord(at));
    }
    Ok(ops)
}
