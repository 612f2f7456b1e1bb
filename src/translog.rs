//! The append-only transaction log.
//!
//! Every change to an index travels through a log record first; the index
//! file itself is only a checkpoint. The log rotates through two files,
//! `<prefix>.log` and `<prefix>.log.2`; the active file's header carries a
//! back-pointer (`prev_file_seq`/`prev_file_offset`) so a reader anchored
//! in the rotated file can follow the chain without reopening the world.
//!
//! Only the holder of the index's exclusive lock appends. Readers replay
//! records through [`LogView`], which yields them in append order across
//! the file pair.

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use log::debug;
use log::warn;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

use crate::error::Error;
use crate::error::Result;
use crate::ondisk::COMPAT_SIZEOF_FILE_OFFSET;
use crate::ondisk::LOG_FILE_HEADER_SIZE;
use crate::ondisk::LOG_MAJOR_VERSION;
use crate::ondisk::LOG_MINOR_VERSION;
use crate::ondisk::LOG_RECORD_HEADER_SIZE;
use crate::ondisk::LOG_ROTATED_SUFFIX;
use crate::ondisk::LOG_SUFFIX;
use crate::ondisk::LogFileHeader;
use crate::ondisk::LogRecordHeader;
use crate::ondisk::LogRecordType;
use crate::ondisk::align8;
use crate::ondisk::host_compat_flags;

/// Soft size past which the active log file is rotated at the next commit.
pub(crate) const LOG_ROTATE_SIZE: u64 = 16 * 1024;

/// A position in the log file chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogPosition {
    /// Sequence number of the log file the offset points into.
    pub file_seq: u32,
    /// Byte offset inside that file.
    pub offset: u64,
}

fn suffixed(index_path: &Path, suffix: &str) -> PathBuf {
    let mut os = index_path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

fn now_stamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn check_log_header(hdr: &LogFileHeader, path: &Path) -> Result<()> {
    if hdr.major_version != LOG_MAJOR_VERSION {
        return Err(Error::corrupted(
            path,
            format!("log major version {} != {}", hdr.major_version, LOG_MAJOR_VERSION),
        ));
    }
    if hdr.compat_flags != host_compat_flags()
        || hdr.compat_sizeof_file_offset != COMPAT_SIZEOF_FILE_OFFSET
    {
        return Err(Error::corrupted(path, "log compat flags mismatch"));
    }
    if hdr.file_seq == 0 {
        return Err(Error::corrupted(path, "log file_seq is 0"));
    }
    Ok(())
}

fn read_log_header(file: &mut File, path: &Path) -> Result<LogFileHeader> {
    let mut buf = [0u8; LOG_FILE_HEADER_SIZE];
    file.seek(SeekFrom::Start(0))
        .map_err(|err| Error::io("lseek", path, err))?;
    file.read_exact(&mut buf)
        .map_err(|err| Error::io("read", path, err))?;
    let hdr = LogFileHeader::read_from_bytes(&buf)
        .map_err(|_| Error::corrupted(path, "log header unreadable"))?;
    check_log_header(&hdr, path)?;
    Ok(hdr)
}

#[derive(Debug)]
enum Storage {
    File { file: File, size: u64 },
    Memory(Vec<u8>),
}

/// The transaction log of one index.
#[derive(Debug)]
pub(crate) struct TransactionLog {
    path: PathBuf,
    rotated_path: PathBuf,
    hdr: LogFileHeader,
    storage: Storage,
}

impl TransactionLog {
    /// Opens an existing `<prefix>.log`. `Ok(None)` when it doesn't exist.
    pub(crate) fn open(index_path: &Path) -> Result<Option<TransactionLog>> {
        let path = suffixed(index_path, LOG_SUFFIX);
        let mut file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::io("open", &path, err)),
        };
        let hdr = read_log_header(&mut file, &path)?;
        let size = file
            .metadata()
            .map_err(|err| Error::io("fstat", &path, err))?
            .len();
        Ok(Some(TransactionLog {
            rotated_path: suffixed(index_path, LOG_ROTATED_SUFFIX),
            path,
            hdr,
            storage: Storage::File { file, size },
        }))
    }

    /// Creates a fresh `<prefix>.log`, replacing whatever was there.
    pub(crate) fn create(index_path: &Path, indexid: u32, file_seq: u32) -> Result<TransactionLog> {
        let path = suffixed(index_path, LOG_SUFFIX);
        let hdr = LogFileHeader {
            major_version: LOG_MAJOR_VERSION,
            minor_version: LOG_MINOR_VERSION,
            compat_flags: host_compat_flags(),
            compat_sizeof_file_offset: COMPAT_SIZEOF_FILE_OFFSET,
            indexid,
            file_seq,
            prev_file_seq: 0,
            prev_file_offset: 0,
            create_stamp: now_stamp(),
        };
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|err| Error::io("open", &path, err))?;
        file.write_all(hdr.as_bytes())
            .map_err(|err| Error::io("write", &path, err))?;
        Ok(TransactionLog {
            rotated_path: suffixed(index_path, LOG_ROTATED_SUFFIX),
            path,
            hdr,
            storage: Storage::File {
                file,
                size: LOG_FILE_HEADER_SIZE as u64,
            },
        })
    }

    /// A log living purely in memory (in-memory index mode).
    pub(crate) fn in_memory(indexid: u32, file_seq: u32) -> TransactionLog {
        let hdr = LogFileHeader {
            major_version: LOG_MAJOR_VERSION,
            minor_version: LOG_MINOR_VERSION,
            compat_flags: host_compat_flags(),
            compat_sizeof_file_offset: COMPAT_SIZEOF_FILE_OFFSET,
            indexid,
            file_seq,
            prev_file_seq: 0,
            prev_file_offset: 0,
            create_stamp: now_stamp(),
        };
        TransactionLog {
            path: PathBuf::from("(in-memory log)"),
            rotated_path: PathBuf::from("(in-memory log).2"),
            hdr,
            storage: Storage::Memory(hdr.as_bytes().to_vec()),
        }
    }

    pub(crate) fn indexid(&self) -> u32 {
        self.hdr.indexid
    }

    pub(crate) fn is_in_memory(&self) -> bool {
        matches!(self.storage, Storage::Memory(_))
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Earliest position the log chain can still replay from: the start
    /// of the rotated file when it is intact, else the start of the head.
    pub(crate) fn earliest_position(&self) -> LogPosition {
        if let Storage::File { .. } = &self.storage {
            if let Ok(Some(rotated)) = Self::read_whole(&self.rotated_path) {
                if let Ok((hdr, _)) = LogFileHeader::read_from_prefix(&rotated) {
                    if hdr.file_seq == self.hdr.prev_file_seq && hdr.file_seq != 0 {
                        return LogPosition {
                            file_seq: hdr.file_seq,
                            offset: LOG_FILE_HEADER_SIZE as u64,
                        };
                    }
                }
            }
        }
        LogPosition {
            file_seq: self.hdr.file_seq,
            offset: LOG_FILE_HEADER_SIZE as u64,
        }
    }

    /// Raw descriptor of the head file, used for the index write lock.
    /// `None` for in-memory logs.
    pub(crate) fn raw_fd(&self) -> Option<std::os::unix::io::RawFd> {
        use std::os::unix::io::AsRawFd;
        match &self.storage {
            Storage::File { file, .. } => Some(file.as_raw_fd()),
            Storage::Memory(_) => None,
        }
    }

    /// Whether our open head file has been rotated away (the path now
    /// names a different inode).
    pub(crate) fn head_changed(&self) -> Result<bool> {
        let Storage::File { file, .. } = &self.storage else {
            return Ok(false);
        };
        use std::os::unix::fs::MetadataExt;
        let ours = file
            .metadata()
            .map_err(|err| Error::io("fstat", &self.path, err))?;
        match fs::metadata(&self.path) {
            Ok(st) => Ok(st.ino() != ours.ino() || st.dev() != ours.dev()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(err) => Err(Error::io("stat", &self.path, err)),
        }
    }

    pub(crate) fn head_position(&self) -> LogPosition {
        LogPosition {
            file_seq: self.hdr.file_seq,
            offset: match &self.storage {
                Storage::File { size, .. } => *size,
                Storage::Memory(buf) => buf.len() as u64,
            },
        }
    }

    /// Re-reads the header and size; another process may have rotated or
    /// grown the file since we last looked.
    pub(crate) fn refresh(&mut self) -> Result<()> {
        let Storage::File { file, size } = &mut self.storage else {
            return Ok(());
        };
        let meta = file
            .metadata()
            .map_err(|err| Error::io("fstat", &self.path, err))?;
        *size = meta.len();

        // If the inode at our path changed, the file was rotated away.
        let on_disk = fs::metadata(&self.path);
        let stale = match on_disk {
            Ok(st) => {
                use std::os::unix::fs::MetadataExt;
                st.ino() != meta.ino() || st.dev() != meta.dev()
            }
            Err(ref err) if err.kind() == io::ErrorKind::NotFound => true,
            Err(err) => return Err(Error::io("stat", &self.path, err)),
        };
        if stale {
            debug!("{}: reopening rotated log", self.path.display());
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&self.path)
                .map_err(|err| Error::io("open", &self.path, err))?;
            self.hdr = read_log_header(&mut file, &self.path)?;
            let size = file
                .metadata()
                .map_err(|err| Error::io("fstat", &self.path, err))?
                .len();
            self.storage = Storage::File { file, size };
        }
        Ok(())
    }

    /// Appends one framed record, returning its start offset. Caller holds
    /// the index exclusive lock.
    pub(crate) fn append(&mut self, typ: LogRecordType, payload: &[u8]) -> Result<u64> {
        let rec_hdr = LogRecordHeader {
            typ: typ.into(),
            reserved: 0,
            unused: 0,
            size: payload.len() as u32,
        };
        let total = align8(LOG_RECORD_HEADER_SIZE + payload.len());
        let mut frame = Vec::with_capacity(total);
        frame.extend_from_slice(rec_hdr.as_bytes());
        frame.extend_from_slice(payload);
        frame.resize(total, 0);

        match &mut self.storage {
            Storage::File { file, size } => {
                let start = *size;
                file.seek(SeekFrom::Start(start))
                    .map_err(|err| Error::io("lseek", &self.path, err))?;
                file.write_all(&frame)
                    .map_err(|err| Error::io("write", &self.path, err))?;
                *size = start + total as u64;
                Ok(start)
            }
            Storage::Memory(buf) => {
                let start = buf.len() as u64;
                buf.extend_from_slice(&frame);
                Ok(start)
            }
        }
    }

    /// Rolls back a failed commit by truncating to the pre-append size.
    pub(crate) fn truncate_to(&mut self, offset: u64) -> Result<()> {
        match &mut self.storage {
            Storage::File { file, size } => {
                file.set_len(offset)
                    .map_err(|err| Error::io("ftruncate", &self.path, err))?;
                *size = offset;
            }
            Storage::Memory(buf) => buf.truncate(offset as usize),
        }
        Ok(())
    }

    pub(crate) fn fsync(&self) -> Result<()> {
        if let Storage::File { file, .. } = &self.storage {
            file.sync_data()
                .map_err(|err| Error::io("fdatasync", &self.path, err))?;
        }
        Ok(())
    }

    /// Rotates when the active file has outgrown the soft limit. The old
    /// `.log.2` is discarded; the new head's header points back at the
    /// rotated file.
    pub(crate) fn rotate_if_needed(&mut self) -> Result<()> {
        let Storage::File { size, .. } = &self.storage else {
            return Ok(());
        };
        if *size < LOG_ROTATE_SIZE {
            return Ok(());
        }
        let prev_seq = self.hdr.file_seq;
        let prev_offset = *size;

        if let Err(err) = fs::remove_file(&self.rotated_path) {
            if err.kind() != io::ErrorKind::NotFound {
                return Err(Error::io("unlink", &self.rotated_path, err));
            }
        }
        fs::rename(&self.path, &self.rotated_path)
            .map_err(|err| Error::io("rename", &self.path, err))?;
        debug!(
            "{}: rotated at {} bytes (file_seq {})",
            self.path.display(),
            prev_offset,
            prev_seq
        );

        let hdr = LogFileHeader {
            major_version: LOG_MAJOR_VERSION,
            minor_version: LOG_MINOR_VERSION,
            compat_flags: host_compat_flags(),
            compat_sizeof_file_offset: COMPAT_SIZEOF_FILE_OFFSET,
            indexid: self.hdr.indexid,
            file_seq: prev_seq + 1,
            prev_file_seq: prev_seq,
            prev_file_offset: prev_offset,
            create_stamp: now_stamp(),
        };
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&self.path)
            .map_err(|err| Error::io("open", &self.path, err))?;
        file.write_all(hdr.as_bytes())
            .map_err(|err| Error::io("write", &self.path, err))?;
        self.hdr = hdr;
        self.storage = Storage::File {
            file,
            size: LOG_FILE_HEADER_SIZE as u64,
        };
        Ok(())
    }

    /// Pulls the on-disk log into memory, for the disk-failure fallback.
    pub(crate) fn move_to_memory(&mut self) -> Result<()> {
        if let Storage::File { file, .. } = &mut self.storage {
            let mut buf = Vec::new();
            file.seek(SeekFrom::Start(0))
                .map_err(|err| Error::io("lseek", &self.path, err))?;
            file.read_to_end(&mut buf)
                .map_err(|err| Error::io("read", &self.path, err))?;
            self.storage = Storage::Memory(buf);
            self.path = PathBuf::from("(in-memory log)");
        }
        Ok(())
    }

    fn read_whole(path: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::io("read", path, err)),
        }
    }

    /// Builds a [`LogView`] over `[start, end)`. `Ok(None)` means the
    /// start position is no longer reachable (rotated away or truncated):
    /// the sync-lost condition.
    pub(crate) fn view(&self, start: LogPosition, end: LogPosition) -> Result<Option<LogView>> {
        let mut segments = Vec::new();

        let head_bytes = match &self.storage {
            Storage::Memory(buf) => buf.clone(),
            Storage::File { .. } => match Self::read_whole(&self.path)? {
                Some(data) => data,
                None => return Ok(None),
            },
        };
        let head_hdr = match LogFileHeader::read_from_prefix(&head_bytes) {
            Ok((hdr, _)) => hdr,
            Err(_) => return Err(Error::corrupted(&self.path, "log header unreadable")),
        };

        if start.file_seq == head_hdr.file_seq {
            if start.offset > head_bytes.len() as u64
                || start.offset < LOG_FILE_HEADER_SIZE as u64
            {
                return Ok(None);
            }
        } else if start.file_seq == head_hdr.prev_file_seq {
            // Anchored in the rotated file; read it first.
            let rotated = match Self::read_whole(&self.rotated_path)? {
                Some(data) => data,
                None => return Ok(None),
            };
            let rot_hdr = match LogFileHeader::read_from_prefix(&rotated) {
                Ok((hdr, _)) => hdr,
                Err(_) => return Err(Error::corrupted(&self.rotated_path, "log header unreadable")),
            };
            if rot_hdr.file_seq != start.file_seq
                || start.offset > rotated.len() as u64
                || start.offset < LOG_FILE_HEADER_SIZE as u64
            {
                warn!(
                    "{}: rotated log no longer matches position {:?}",
                    self.rotated_path.display(),
                    start
                );
                return Ok(None);
            }
            let mut rot_end = (head_hdr.prev_file_offset as usize).min(rotated.len());
            if end.file_seq == rot_hdr.file_seq {
                // The caller's end position lies in the rotated file too.
                rot_end = rot_end.min(end.offset as usize);
            }
            segments.push(LogSegment {
                file_seq: rot_hdr.file_seq,
                start: start.offset as usize,
                end: rot_end,
                bytes: rotated,
            });
        } else {
            return Ok(None);
        }

        if end.file_seq == head_hdr.file_seq || end.file_seq > head_hdr.prev_file_seq {
            let head_start = if start.file_seq == head_hdr.file_seq {
                start.offset as usize
            } else {
                LOG_FILE_HEADER_SIZE
            };
            let head_end = if end.file_seq == head_hdr.file_seq {
                (end.offset as usize).min(head_bytes.len())
            } else {
                head_bytes.len()
            };
            segments.push(LogSegment {
                file_seq: head_hdr.file_seq,
                start: head_start,
                end: head_end.max(head_start),
                bytes: head_bytes,
            });
        }

        Ok(Some(LogView {
            path: self.path.clone(),
            segments,
            segment_idx: 0,
            pos: 0,
        }))
    }
}

#[derive(Debug)]
struct LogSegment {
    file_seq: u32,
    start: usize,
    end: usize,
    bytes: Vec<u8>,
}

/// One decoded log record.
#[derive(Debug, Clone)]
pub(crate) struct LogEntry {
    pub typ: LogRecordType,
    /// Position of the record header in its file.
    pub position: LogPosition,
    pub data: Vec<u8>,
}

/// Iterates log records in append order over `[start, end)`.
#[derive(Debug)]
pub(crate) struct LogView {
    path: PathBuf,
    segments: Vec<LogSegment>,
    segment_idx: usize,
    pos: usize,
}

impl LogView {
    /// The next record, `Ok(None)` at the end position.
    pub(crate) fn next(&mut self) -> Result<Option<LogEntry>> {
        loop {
            let Some(segment) = self.segments.get(self.segment_idx) else {
                return Ok(None);
            };
            let pos = if self.pos == 0 { segment.start } else { self.pos };
            if pos + LOG_RECORD_HEADER_SIZE > segment.end {
                self.segment_idx += 1;
                self.pos = 0;
                continue;
            }
            let (rec_hdr, _) = LogRecordHeader::read_from_prefix(&segment.bytes[pos..])
                .expect("bounds checked above");
            let typ = LogRecordType::try_from(rec_hdr.typ).map_err(|_| {
                Error::corrupted(&self.path, format!("unknown log record type {}", rec_hdr.typ))
            })?;
            let data_start = pos + LOG_RECORD_HEADER_SIZE;
            let data_end = data_start + rec_hdr.size as usize;
            if data_end > segment.end {
                // A torn append at the tail: readable up to here only.
                self.segment_idx = self.segments.len();
                return Ok(None);
            }
            let entry = LogEntry {
                typ,
                position: LogPosition {
                    file_seq: segment.file_seq,
                    offset: pos as u64,
                },
                data: segment.bytes[data_start..data_end].to_vec(),
            };
            self.pos = pos + align8(LOG_RECORD_HEADER_SIZE + rec_hdr.size as usize);
            return Ok(Some(entry));
        }
    }

    /// Position just past the last returned record in its file.
    pub(crate) fn tell(&self) -> Option<LogPosition> {
        let segment = self.segments.get(self.segment_idx)?;
        Some(LogPosition {
            file_seq: segment.file_seq,
            offset: if self.pos == 0 {
                segment.start as u64
            } else {
                self.pos as u64
            },
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn temp_log() -> (tempfile::TempDir, TransactionLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = TransactionLog::create(&dir.path().join("box.index"), 42, 1).unwrap();
        (dir, log)
    }

    #[test]
    fn append_and_replay() {
        let (_dir, mut log) = temp_log();
        let start = log.head_position();
        log.append(LogRecordType::Append, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        log.append(LogRecordType::Expunge, &[9, 9, 9, 9, 9, 9, 9, 9]).unwrap();
        let end = log.head_position();

        let mut view = log.view(start, end).unwrap().unwrap();
        let first = view.next().unwrap().unwrap();
        assert_eq!(first.typ, LogRecordType::Append);
        assert_eq!(first.data, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let second = view.next().unwrap().unwrap();
        assert_eq!(second.typ, LogRecordType::Expunge);
        assert!(view.next().unwrap().is_none());
    }

    #[test]
    fn records_are_8_byte_aligned() {
        let (_dir, mut log) = temp_log();
        let first = log.append(LogRecordType::Append, &[0; 5]).unwrap();
        let second = log.append(LogRecordType::Append, &[0; 3]).unwrap();
        assert_eq!(first % 8, 0);
        assert_eq!(second % 8, 0);
        assert_eq!(second - first, align8(LOG_RECORD_HEADER_SIZE + 5) as u64);
    }

    #[test]
    fn rollback_truncates() {
        let (_dir, mut log) = temp_log();
        let before = log.head_position();
        log.append(LogRecordType::FlagUpdate, &[0; 12]).unwrap();
        log.truncate_to(before.offset).unwrap();
        assert_eq!(log.head_position(), before);
        let mut view = log.view(before, log.head_position()).unwrap().unwrap();
        assert!(view.next().unwrap().is_none());
    }

    #[test]
    fn replay_follows_rotation_back_pointer() {
        let (_dir, mut log) = temp_log();
        let start = log.head_position();
        log.append(LogRecordType::Append, &[1; 8]).unwrap();

        // Force a rotation by appending past the soft limit.
        while log.head_position().offset < LOG_ROTATE_SIZE {
            log.append(LogRecordType::FlagUpdate, &[0; 48]).unwrap();
        }
        log.rotate_if_needed().unwrap();
        assert_eq!(log.head_position().file_seq, 2);
        log.append(LogRecordType::Expunge, &[2; 8]).unwrap();
        let end = log.head_position();

        let mut view = log.view(start, end).unwrap().unwrap();
        let mut count = 0usize;
        let mut last = None;
        while let Some(entry) = view.next().unwrap() {
            count += 1;
            last = Some(entry);
        }
        let last = last.unwrap();
        assert_eq!(last.typ, LogRecordType::Expunge);
        assert_eq!(last.position.file_seq, 2);
        assert!(count > 2);
    }

    #[test]
    fn lost_position_reports_none() {
        let (_dir, log) = temp_log();
        let bogus = LogPosition {
            file_seq: 99,
            offset: 64,
        };
        assert!(log.view(bogus, log.head_position()).unwrap().is_none());
    }
}
