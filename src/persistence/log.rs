//! # File Log Persistence
//!
//! An append-only log of committed transactions. Each transaction is written
//! as a run of frames and becomes durable when its commit frame is synced:
//!
//! ```text
//! +-------+-------+-------+--------+-------+-------+--------+----
//! | BEGIN | PUT   | PUT   | COMMIT | BEGIN | REMOVE| COMMIT | ...
//! | txn 4 | id 1  | id 9  | txn 4  | txn 7 | id 1  | txn 7  |
//! +-------+-------+-------+--------+-------+-------+--------+----
//! ```
//!
//! ## Frame Format (32-byte header + value)
//!
//! ```text
//! +------+----------+-----------+--------+--------+----------+-------+
//! | kind | reserved | value_len | txn_id | key    | checksum | value |
//! | u8   | [u8; 3]  | u32 LE    | u64 LE | [u8;8] | u64 LE   | bytes |
//! +------+----------+-----------+--------+--------+----------+-------+
//! ```
//!
//! `checksum` is CRC64 (ECMA-182) over the first 24 header bytes and the value.
//!
//! ## Recovery
//!
//! Replay stops at the first frame that is truncated, fails its checksum, or
//! has an unknown kind. Operations are applied only when their transaction's
//! commit frame is reached, so a crash in the middle of a write leaves the
//! previous state intact. Anything after the last valid commit frame is a
//! torn tail and is cut off so later appends start from a clean boundary.
//!
//! ## Checkpoint
//!
//! `checkpoint` rewrites the log as a single transaction holding the current
//! live state and atomically renames it over the old file.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{Result, WrapErr};
use parking_lot::Mutex;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::codec::KEY_SIZE;
use super::{apply_ops, LogOp, PersistenceAdapter, RecoveredRecord, TxnHandle};

pub const FRAME_HEADER_SIZE: usize = 32;

const CHECKSUMMED_HEADER_BYTES: usize = 24;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

const CHECKPOINT_TXN_ID: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FrameKind {
    Begin = 1,
    Put = 2,
    Remove = 3,
    Commit = 4,
}

impl FrameKind {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Begin),
            2 => Some(Self::Put),
            3 => Some(Self::Remove),
            4 => Some(Self::Commit),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct FrameHeader {
    kind: u8,
    _reserved: [u8; 3],
    value_len: U32,
    txn_id: U64,
    key: [u8; KEY_SIZE],
    checksum: U64,
}

const _: () = assert!(std::mem::size_of::<FrameHeader>() == FRAME_HEADER_SIZE);

fn compute_checksum(header: &FrameHeader, value: &[u8]) -> u64 {
    let mut digest = CRC64.digest();
    digest.update(&header.as_bytes()[..CHECKSUMMED_HEADER_BYTES]);
    digest.update(value);
    digest.finalize()
}

fn encode_frame(out: &mut Vec<u8>, kind: FrameKind, txn_id: u64, key: [u8; KEY_SIZE], value: &[u8]) {
    let mut header = FrameHeader {
        kind: kind as u8,
        _reserved: [0; 3],
        value_len: U32::new(value.len() as u32),
        txn_id: U64::new(txn_id),
        key,
        checksum: U64::new(0),
    };
    header.checksum = U64::new(compute_checksum(&header, value));
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(value);
}

fn encode_transaction(txn_id: u64, ops: &[LogOp]) -> Vec<u8> {
    let mut out = Vec::new();
    encode_frame(&mut out, FrameKind::Begin, txn_id, [0; KEY_SIZE], &[]);
    for op in ops {
        match op {
            LogOp::Put { key, value } => encode_frame(&mut out, FrameKind::Put, txn_id, *key, value),
            LogOp::Remove { key } => encode_frame(&mut out, FrameKind::Remove, txn_id, *key, &[]),
        }
    }
    encode_frame(&mut out, FrameKind::Commit, txn_id, [0; KEY_SIZE], &[]);
    out
}

#[derive(Debug, Default)]
struct Replay {
    store: BTreeMap<Vec<u8>, Vec<u8>>,
    committed_len: usize,
    transactions: usize,
}

fn replay(bytes: &[u8]) -> Replay {
    let mut replay = Replay::default();
    let mut pending: Vec<LogOp> = Vec::new();
    let mut open_txn: Option<u64> = None;
    let mut pos = 0;

    while pos + FRAME_HEADER_SIZE <= bytes.len() {
        let Ok(header) = FrameHeader::read_from_bytes(&bytes[pos..pos + FRAME_HEADER_SIZE]) else {
            break;
        };
        let value_start = pos + FRAME_HEADER_SIZE;
        let value_end = value_start + header.value_len.get() as usize;
        if value_end > bytes.len() {
            break;
        }
        let value = &bytes[value_start..value_end];
        if compute_checksum(&header, value) != header.checksum.get() {
            break;
        }
        let txn_id = header.txn_id.get();

        match FrameKind::from_u8(header.kind) {
            Some(FrameKind::Begin) => {
                pending.clear();
                open_txn = Some(txn_id);
            }
            Some(FrameKind::Put) if open_txn == Some(txn_id) => pending.push(LogOp::Put {
                key: header.key,
                value: value.to_vec(),
            }),
            Some(FrameKind::Remove) if open_txn == Some(txn_id) => {
                pending.push(LogOp::Remove { key: header.key })
            }
            Some(FrameKind::Commit) if open_txn == Some(txn_id) => {
                apply_ops(&mut replay.store, pending.drain(..));
                open_txn = None;
                replay.committed_len = value_end;
                replay.transactions += 1;
            }
            _ => break,
        }
        pos = value_end;
    }

    replay
}

#[derive(Debug)]
pub struct LogPersistence {
    path: PathBuf,
    file: Mutex<File>,
}

impl LogPersistence {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .wrap_err_with(|| format!("failed to create log directory at {:?}", parent))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open log at {:?}", path))?;
        file.seek(SeekFrom::End(0))
            .wrap_err("failed to seek to end of log")?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len_bytes(&self) -> Result<u64> {
        let file = self.file.lock();
        Ok(file.metadata().wrap_err("failed to stat log")?.len())
    }

    fn read_and_repair(&self, file: &mut File) -> Result<Replay> {
        let mut bytes = Vec::new();
        file.seek(SeekFrom::Start(0))
            .wrap_err("failed to seek to start of log")?;
        file.read_to_end(&mut bytes)
            .wrap_err_with(|| format!("failed to read log at {:?}", self.path))?;

        let replay = replay(&bytes);
        if replay.committed_len < bytes.len() {
            tracing::warn!(
                path = %self.path.display(),
                discarded = bytes.len() - replay.committed_len,
                "discarding torn log tail"
            );
            file.set_len(replay.committed_len as u64)
                .wrap_err("failed to truncate torn log tail")?;
        }
        file.seek(SeekFrom::End(0))
            .wrap_err("failed to seek to end of log")?;
        Ok(replay)
    }

    /// Rewrites the log as one transaction holding the current live state.
    pub fn checkpoint(&self) -> Result<usize> {
        let mut file = self.file.lock();
        let replay = self.read_and_repair(&mut file)?;

        let ops: Vec<LogOp> = replay
            .store
            .into_iter()
            .map(|(key, value)| {
                let mut raw = [0u8; KEY_SIZE];
                raw.copy_from_slice(&key);
                LogOp::Put { key: raw, value }
            })
            .collect();
        let records = ops.len();

        let tmp_path = self.path.with_extension("checkpoint");
        {
            let mut tmp = File::create(&tmp_path)
                .wrap_err_with(|| format!("failed to create checkpoint at {:?}", tmp_path))?;
            tmp.write_all(&encode_transaction(CHECKPOINT_TXN_ID, &ops))
                .wrap_err("failed to write checkpoint")?;
            tmp.sync_all().wrap_err("failed to sync checkpoint")?;
        }
        fs::rename(&tmp_path, &self.path)
            .wrap_err_with(|| format!("failed to replace log at {:?}", self.path))?;

        let mut reopened = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .wrap_err_with(|| format!("failed to reopen log at {:?}", self.path))?;
        reopened
            .seek(SeekFrom::End(0))
            .wrap_err("failed to seek to end of log")?;
        *file = reopened;

        tracing::debug!(path = %self.path.display(), records, "log checkpoint complete");
        Ok(records)
    }
}

impl PersistenceAdapter for LogPersistence {
    fn commit(&self, handle: TxnHandle) -> Result<()> {
        let bytes = encode_transaction(handle.txn_id(), handle.ops());
        let mut file = self.file.lock();
        file.write_all(&bytes)
            .wrap_err("failed to append transaction to log")?;
        file.sync_data().wrap_err("failed to sync log")?;
        Ok(())
    }

    fn recover(&self) -> Result<Vec<RecoveredRecord>> {
        let mut file = self.file.lock();
        let replay = self.read_and_repair(&mut file)?;
        tracing::debug!(
            path = %self.path.display(),
            transactions = replay.transactions,
            records = replay.store.len(),
            "log replay complete"
        );
        Ok(replay.store.into_iter().collect())
    }
}
