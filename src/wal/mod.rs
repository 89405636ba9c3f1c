//! Write-Ahead Log (WAL) with nested batch semantics.
//!
//! Every mutation is appended here **before** it touches any in-memory or
//! paged state, so a crash at any point is recoverable by replay.  The log
//! is reset to its header after each successful flush.
//!
//! # On-disk layout
//!
//! ```text
//! [6-byte magic "SYNWAL"][u32 LE version = 2][2 bytes padding]     (12 bytes)
//! [type:1][len:4 LE][checksum:4 LE][payload:len]
//! [type:1][len:4 LE][checksum:4 LE][payload:len]
//! ...
//! ```
//!
//! The per-record checksum is the **byte-sum** of the payload mod 2^32
//! ([`encoding::sum32`]); the replayer stops at the first frame whose
//! length overruns the file or whose checksum mismatches, and the writer
//! truncates the tail there.
//!
//! # Record types
//!
//! | type | record            | payload                                      |
//! |------|-------------------|----------------------------------------------|
//! | 0x10 | add-triple        | three length-prefixed UTF-8 terms            |
//! | 0x20 | delete-triple     | three length-prefixed UTF-8 terms            |
//! | 0x30 | set-node-props    | `[id:4][u32 len][json]`                      |
//! | 0x31 | set-edge-props    | three terms + `[u32 len][json]`              |
//! | 0x40 | begin             | empty, or `[mask:1]` (bit0 txId, bit1        |
//! |      |                   | sessionId) + length-prefixed strings         |
//! | 0x41 | commit            | empty                                        |
//! | 0x42 | abort             | empty                                        |
//!
//! Triple records carry **terms, not ids**: the dictionary is only made
//! durable by a flush, so replay must be able to rebuild id assignments
//! from the log alone.  The replayer interns terms in log order — exactly
//! when the live write path interned them, including inside batches that
//! later abort — which reproduces the identical dense id sequence.
//!
//! # Durability
//!
//! Appends are synchronous OS writes **without** fsync — they survive a
//! process crash (another in-process reader observes them immediately) but
//! not OS or power failure until the next flush.  Only a durable commit
//! ([`WalWriter::sync`]) pays for an fsync.
//!
//! # Nested batches
//!
//! BEGIN pushes a staged layer; COMMIT pops it and **merges it into the
//! parent layer** (or into the globals when outermost); ABORT pops and
//! discards only the top layer.  An inner commit therefore does not
//! survive an outer abort.  Outermost commits carrying a `txId` already in
//! the applied set are skipped wholesale — that is what makes replay
//! idempotent across crash-restart cycles.

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::dictionary::Dictionary;
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::model::Triple;

/// 6-byte magic identifying a SynapseDB WAL.
pub const WAL_MAGIC: &[u8; 6] = b"SYNWAL";

/// Current WAL format version.
pub const WAL_VERSION: u32 = 2;

/// Header size; records start here.
pub const WAL_HEADER_SIZE: u64 = 12;

/// Frame prefix: `[type:1][len:4][checksum:4]`.
const FRAME_PREFIX_SIZE: usize = 9;

const REC_ADD_TRIPLE: u8 = 0x10;
const REC_DELETE_TRIPLE: u8 = 0x20;
const REC_SET_NODE_PROPS: u8 = 0x30;
const REC_SET_EDGE_PROPS: u8 = 0x31;
const REC_BEGIN: u8 = 0x40;
const REC_COMMIT: u8 = 0x41;
const REC_ABORT: u8 = 0x42;

const BEGIN_MASK_TX_ID: u8 = 0b0000_0001;
const BEGIN_MASK_SESSION_ID: u8 = 0b0000_0010;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// WAL header version is not the current one. Fatal; no auto-migration.
    #[error("unsupported WAL version {found} (expected {WAL_VERSION})")]
    UnsupportedVersion {
        /// Version found in the header.
        found: u32,
    },

    /// WAL header failed validation (bad magic, short file).
    #[error("invalid WAL header: {0}")]
    InvalidHeader(String),
}

// ------------------------------------------------------------------------------------------------
// Records
// ------------------------------------------------------------------------------------------------

/// Optional metadata attached to a BEGIN record.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchMeta {
    /// Opaque transaction id used for cross-restart idempotence.
    pub tx_id: Option<String>,

    /// Opaque session id carried alongside the transaction id.
    pub session_id: Option<String>,
}

impl BatchMeta {
    pub fn is_empty(&self) -> bool {
        self.tx_id.is_none() && self.session_id.is_none()
    }
}

/// A logical WAL record.
#[derive(Debug, Clone, PartialEq)]
pub enum WalRecord {
    AddFact {
        s: String,
        p: String,
        o: String,
    },
    DeleteFact {
        s: String,
        p: String,
        o: String,
    },
    SetNodeProps {
        id: u32,
        data: Value,
    },
    SetEdgeProps {
        s: String,
        p: String,
        o: String,
        data: Value,
    },
    Begin(BatchMeta),
    Commit,
    Abort,
}

impl WalRecord {
    /// Convenience constructor for an add record.
    pub fn add(s: &str, p: &str, o: &str) -> Self {
        WalRecord::AddFact {
            s: s.to_string(),
            p: p.to_string(),
            o: o.to_string(),
        }
    }

    /// Convenience constructor for a delete record.
    pub fn delete(s: &str, p: &str, o: &str) -> Self {
        WalRecord::DeleteFact {
            s: s.to_string(),
            p: p.to_string(),
            o: o.to_string(),
        }
    }

    fn type_byte(&self) -> u8 {
        match self {
            WalRecord::AddFact { .. } => REC_ADD_TRIPLE,
            WalRecord::DeleteFact { .. } => REC_DELETE_TRIPLE,
            WalRecord::SetNodeProps { .. } => REC_SET_NODE_PROPS,
            WalRecord::SetEdgeProps { .. } => REC_SET_EDGE_PROPS,
            WalRecord::Begin(_) => REC_BEGIN,
            WalRecord::Commit => REC_COMMIT,
            WalRecord::Abort => REC_ABORT,
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>, WalError> {
        let mut buf = Vec::new();
        match self {
            WalRecord::AddFact { s, p, o } | WalRecord::DeleteFact { s, p, o } => {
                s.as_str().encode_to(&mut buf)?;
                p.as_str().encode_to(&mut buf)?;
                o.as_str().encode_to(&mut buf)?;
            }
            WalRecord::SetNodeProps { id, data } => {
                id.encode_to(&mut buf)?;
                encoding::encode_json(data, &mut buf)?;
            }
            WalRecord::SetEdgeProps { s, p, o, data } => {
                s.as_str().encode_to(&mut buf)?;
                p.as_str().encode_to(&mut buf)?;
                o.as_str().encode_to(&mut buf)?;
                encoding::encode_json(data, &mut buf)?;
            }
            WalRecord::Begin(meta) => {
                if !meta.is_empty() {
                    let mut mask = 0u8;
                    if meta.tx_id.is_some() {
                        mask |= BEGIN_MASK_TX_ID;
                    }
                    if meta.session_id.is_some() {
                        mask |= BEGIN_MASK_SESSION_ID;
                    }
                    mask.encode_to(&mut buf)?;
                    if let Some(tx_id) = &meta.tx_id {
                        tx_id.as_str().encode_to(&mut buf)?;
                    }
                    if let Some(session_id) = &meta.session_id {
                        session_id.as_str().encode_to(&mut buf)?;
                    }
                }
            }
            WalRecord::Commit | WalRecord::Abort => {}
        }
        Ok(buf)
    }

    fn decode(type_byte: u8, payload: &[u8]) -> Result<Self, WalError> {
        match type_byte {
            REC_ADD_TRIPLE | REC_DELETE_TRIPLE => {
                let mut offset = 0;
                let (s, n) = String::decode_from(&payload[offset..])?;
                offset += n;
                let (p, n) = String::decode_from(&payload[offset..])?;
                offset += n;
                let (o, _) = String::decode_from(&payload[offset..])?;
                if type_byte == REC_ADD_TRIPLE {
                    Ok(WalRecord::AddFact { s, p, o })
                } else {
                    Ok(WalRecord::DeleteFact { s, p, o })
                }
            }
            REC_SET_NODE_PROPS => {
                let (id, n) = u32::decode_from(payload)?;
                let (data, _) = encoding::decode_json(&payload[n..])?;
                Ok(WalRecord::SetNodeProps { id, data })
            }
            REC_SET_EDGE_PROPS => {
                let mut offset = 0;
                let (s, n) = String::decode_from(&payload[offset..])?;
                offset += n;
                let (p, n) = String::decode_from(&payload[offset..])?;
                offset += n;
                let (o, n) = String::decode_from(&payload[offset..])?;
                offset += n;
                let (data, _) = encoding::decode_json(&payload[offset..])?;
                Ok(WalRecord::SetEdgeProps { s, p, o, data })
            }
            REC_BEGIN => {
                if payload.is_empty() {
                    return Ok(WalRecord::Begin(BatchMeta::default()));
                }
                let (mask, mut offset) = u8::decode_from(payload)?;
                let mut meta = BatchMeta::default();
                if mask & BEGIN_MASK_TX_ID != 0 {
                    let (tx_id, n) = String::decode_from(&payload[offset..])?;
                    offset += n;
                    meta.tx_id = Some(tx_id);
                }
                if mask & BEGIN_MASK_SESSION_ID != 0 {
                    let (session_id, _) = String::decode_from(&payload[offset..])?;
                    meta.session_id = Some(session_id);
                }
                Ok(WalRecord::Begin(meta))
            }
            REC_COMMIT => Ok(WalRecord::Commit),
            REC_ABORT => Ok(WalRecord::Abort),
            other => Err(WalError::Encoding(EncodingError::InvalidTag {
                tag: u32::from(other),
                type_name: "WalRecord",
            })),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Writer
// ------------------------------------------------------------------------------------------------

/// Append-side handle to the WAL file.
///
/// Held open by the writer for its lifetime; appends are synchronous OS
/// writes so a concurrent in-process replayer observes records
/// immediately.
#[derive(Debug)]
pub struct WalWriter {
    file: File,
    path: PathBuf,
}

impl WalWriter {
    /// Create or reopen `<path>`.
    ///
    /// A file with a valid header is kept and the cursor seeks to its end;
    /// an empty or missing file gets a fresh header.  A version mismatch
    /// is fatal.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len == 0 {
            write_header(&mut file)?;
            file.sync_all()?;
            info!(path = %path.display(), "WAL created with new header");
        } else {
            file.seek(SeekFrom::Start(0))?;
            validate_header(&mut file)?;
            file.seek(SeekFrom::End(0))?;
            debug!(path = %path.display(), len, "WAL header validated");
        }

        Ok(Self { file, path })
    }

    /// Append one record.  Synchronous OS write, no fsync.
    pub fn append(&mut self, record: &WalRecord) -> Result<(), WalError> {
        let payload = record.encode_payload()?;
        let len = u32::try_from(payload.len()).map_err(|_| {
            WalError::Encoding(EncodingError::LengthOverflow(format!(
                "WAL payload length {} exceeds u32::MAX",
                payload.len()
            )))
        })?;
        let checksum = encoding::sum32(&payload);

        let mut frame = [0u8; FRAME_PREFIX_SIZE];
        frame[0] = record.type_byte();
        frame[1..5].copy_from_slice(&len.to_le_bytes());
        frame[5..9].copy_from_slice(&checksum.to_le_bytes());

        self.file.write_all(&frame)?;
        self.file.write_all(&payload)?;

        trace!(
            record_type = format_args!("0x{:02x}", frame[0]),
            len,
            crc = format_args!("{checksum:08x}"),
            "WAL record appended"
        );
        Ok(())
    }

    /// Fsync the log. Used by `commit_batch(durable = true)`.
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Truncate to the header after a successful flush.
    pub fn reset(&mut self) -> Result<(), WalError> {
        self.file.set_len(WAL_HEADER_SIZE)?;
        self.file.seek(SeekFrom::Start(WAL_HEADER_SIZE))?;
        self.file.sync_all()?;
        info!(path = %self.path.display(), "WAL reset to header");
        Ok(())
    }

    /// Truncate to `offset` (never below the header) and seek to end.
    ///
    /// Used after replay to drop a torn tail so re-opens are idempotent.
    pub fn truncate_to(&mut self, offset: u64) -> Result<(), WalError> {
        let offset = offset.max(WAL_HEADER_SIZE);
        self.file.set_len(offset)?;
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    /// Bytes past the header currently in the log.
    pub fn payload_len(&self) -> Result<u64, WalError> {
        Ok(self
            .file
            .metadata()?
            .len()
            .saturating_sub(WAL_HEADER_SIZE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Bytes past the header of the WAL at `path`, without opening a writer.
///
/// Used by the unsafe-unlocked-open check before any handle is taken.
/// Missing file counts as zero.
pub fn payload_bytes(path: &Path) -> u64 {
    std::fs::metadata(path)
        .map(|m| m.len().saturating_sub(WAL_HEADER_SIZE))
        .unwrap_or(0)
}

fn write_header<W: Write>(writer: &mut W) -> Result<(), WalError> {
    let mut header = [0u8; WAL_HEADER_SIZE as usize];
    header[..WAL_MAGIC.len()].copy_from_slice(WAL_MAGIC);
    header[6..10].copy_from_slice(&WAL_VERSION.to_le_bytes());
    writer.write_all(&header)?;
    Ok(())
}

fn validate_header<R: Read>(reader: &mut R) -> Result<(), WalError> {
    let mut header = [0u8; WAL_HEADER_SIZE as usize];
    reader
        .read_exact(&mut header)
        .map_err(|_| WalError::InvalidHeader("file shorter than header".into()))?;
    if &header[..WAL_MAGIC.len()] != WAL_MAGIC {
        return Err(WalError::InvalidHeader("bad magic".into()));
    }
    let version = u32::from_le_bytes([header[6], header[7], header[8], header[9]]);
    if version != WAL_VERSION {
        return Err(WalError::UnsupportedVersion { found: version });
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Replay
// ------------------------------------------------------------------------------------------------

/// One recovered mutation, in log order.
#[derive(Debug, Clone, PartialEq)]
pub enum WalEffect {
    Add(Triple),
    Delete(Triple),
    NodeProps { id: u32, data: Value },
    EdgeProps { triple: Triple, data: Value },
}

/// Outcome of a WAL replay.
#[derive(Debug, Default)]
pub struct WalReplay {
    /// Committed (or unbatched) mutations, in the order they apply.
    pub effects: Vec<WalEffect>,

    /// End of the last successfully parsed record; the writer truncates
    /// here.
    pub safe_offset: u64,

    /// Transaction ids of outermost commits applied by this replay,
    /// `(tx_id, session_id)` — to be merged into the persistent registry.
    pub newly_committed: Vec<(String, Option<String>)>,

    /// BEGIN frames still open at end of log.  The caller balances them
    /// with ABORT records after truncation so later batches nest
    /// correctly.
    pub open_layers: usize,
}

struct Layer {
    effects: Vec<WalEffect>,
    meta: BatchMeta,
}

/// Replay the WAL at `path`, seeded with the persistent applied-txid set.
///
/// Terms are interned into `dictionary` **at parse time**, in log order,
/// whether or not the surrounding batch commits — mirroring the live
/// write path, which interns before appending.  This reproduces the
/// exact id assignments of the crashed session.
///
/// Permissive by design: an incomplete tail, a checksum mismatch, or an
/// undecodable record stops the walk at `safe_offset` without surfacing an
/// error.  Only a bad header (wrong magic / version) is fatal.
pub fn replay(
    path: &Path,
    applied_tx_ids: &HashSet<String>,
    dictionary: &mut Dictionary,
) -> Result<WalReplay, WalError> {
    if !path.exists() {
        return Ok(WalReplay::default());
    }

    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;

    if bytes.is_empty() {
        return Ok(WalReplay::default());
    }
    validate_header(&mut &bytes[..])?;

    let mut replay = WalReplay {
        safe_offset: WAL_HEADER_SIZE,
        ..WalReplay::default()
    };
    let mut stack: Vec<Layer> = Vec::new();
    let mut seen_tx_ids: HashSet<String> = HashSet::new();

    let mut offset = WAL_HEADER_SIZE as usize;
    loop {
        let Some(frame) = bytes.get(offset..offset + FRAME_PREFIX_SIZE) else {
            break;
        };
        let record_type = frame[0];
        let len = u32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
        let stored_checksum = u32::from_le_bytes([frame[5], frame[6], frame[7], frame[8]]);

        let payload_start = offset + FRAME_PREFIX_SIZE;
        let Some(payload) = bytes.get(payload_start..payload_start + len) else {
            warn!(offset, len, "WAL record overruns file; truncating tail");
            break;
        };

        if encoding::sum32(payload) != stored_checksum {
            warn!(offset, len, "WAL record checksum mismatch; truncating tail");
            break;
        }

        let record = match WalRecord::decode(record_type, payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(offset, error = %e, "undecodable WAL record; truncating tail");
                break;
            }
        };

        apply_record(
            record,
            dictionary,
            &mut stack,
            &mut replay,
            applied_tx_ids,
            &mut seen_tx_ids,
        );

        offset = payload_start + len;
        replay.safe_offset = offset as u64;
    }

    replay.open_layers = stack.len();
    if replay.open_layers > 0 {
        debug!(
            open_layers = replay.open_layers,
            "WAL ended inside a batch; uncommitted layers discarded"
        );
    }

    info!(
        path = %path.display(),
        effects = replay.effects.len(),
        safe_offset = replay.safe_offset,
        newly_committed = replay.newly_committed.len(),
        "WAL replay complete"
    );
    Ok(replay)
}

fn apply_record(
    record: WalRecord,
    dictionary: &mut Dictionary,
    stack: &mut Vec<Layer>,
    replay: &mut WalReplay,
    applied_tx_ids: &HashSet<String>,
    seen_tx_ids: &mut HashSet<String>,
) {
    let effect = match record {
        WalRecord::Begin(meta) => {
            stack.push(Layer {
                effects: Vec::new(),
                meta,
            });
            return;
        }
        WalRecord::Commit => {
            let Some(layer) = stack.pop() else {
                warn!("WAL COMMIT without matching BEGIN; ignored");
                return;
            };
            match stack.last_mut() {
                // Inner commit merges upward: a later outer ABORT must be
                // able to discard it.
                Some(parent) => parent.effects.extend(layer.effects),
                None => {
                    let duplicate = layer.meta.tx_id.as_ref().is_some_and(|id| {
                        applied_tx_ids.contains(id) || !seen_tx_ids.insert(id.clone())
                    });
                    if duplicate {
                        debug!(tx_id = ?layer.meta.tx_id, "skipping already-applied transaction");
                        return;
                    }
                    replay.effects.extend(layer.effects);
                    if let Some(tx_id) = layer.meta.tx_id {
                        replay
                            .newly_committed
                            .push((tx_id, layer.meta.session_id));
                    }
                }
            }
            return;
        }
        WalRecord::Abort => {
            if stack.pop().is_none() {
                warn!("WAL ABORT without matching BEGIN; ignored");
            }
            return;
        }
        // Interning happens here, before commit/abort is known, because
        // the live path interned at the same point.
        WalRecord::AddFact { s, p, o } => WalEffect::Add(Triple::new(
            dictionary.get_or_create_id(&s),
            dictionary.get_or_create_id(&p),
            dictionary.get_or_create_id(&o),
        )),
        WalRecord::DeleteFact { s, p, o } => {
            // The live path only logs deletes for interned terms, so a
            // miss here means the log predates this dictionary; skip.
            let (Some(s), Some(p), Some(o)) = (
                dictionary.get_id(&s),
                dictionary.get_id(&p),
                dictionary.get_id(&o),
            ) else {
                warn!("WAL delete references unknown terms; skipped");
                return;
            };
            WalEffect::Delete(Triple::new(s, p, o))
        }
        WalRecord::SetNodeProps { id, data } => WalEffect::NodeProps { id, data },
        WalRecord::SetEdgeProps { s, p, o, data } => WalEffect::EdgeProps {
            triple: Triple::new(
                dictionary.get_or_create_id(&s),
                dictionary.get_or_create_id(&p),
                dictionary.get_or_create_id(&o),
            ),
            data,
        },
    };

    match stack.last_mut() {
        Some(top) => top.effects.push(effect),
        None => replay.effects.push(effect),
    }
}
