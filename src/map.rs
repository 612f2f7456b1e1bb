//! Index maps: immutable snapshots of one index file.
//!
//! A map is either file-backed (the mmap'ed `<prefix>.index`) or
//! heap-backed (a private clone that view sync replays log records into, or
//! an in-memory index after a disk-failure fallback). Published maps are
//! immutable and shared through `Arc`; every "mutation" happens on a heap
//! clone that is swapped in afterwards.

use std::path::Path;

use ref_cast::RefCast;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

use crate::error::Error;
use crate::error::Result;
use crate::mmap::FileMap;
use crate::ondisk::COMPAT_SIZEOF_FILE_OFFSET;
use crate::ondisk::EXT_HEADER_SIZE;
use crate::ondisk::ExtHeader;
use crate::ondisk::INDEX_BASE_HEADER_SIZE;
use crate::ondisk::INDEX_MAJOR_VERSION;
use crate::ondisk::IndexHeader;
use crate::ondisk::KEYWORDS_BYTE_COUNT;
use crate::ondisk::MailFlags;
use crate::ondisk::Record;
use crate::ondisk::align4;
use crate::ondisk::host_compat_flags;

/// One mail record viewed in place: the fixed prefix plus the extension
/// suffix of the map it came from.
#[derive(Debug, RefCast)]
#[repr(transparent)]
pub struct RecordView {
    raw: [u8],
}

impl RecordView {
    /// The fixed record prefix, copied out (the backing bytes may not be
    /// aligned).
    pub fn base(&self) -> Record {
        Record::read_from_prefix(&self.raw)
            .expect("record region shorter than a record")
            .0
    }

    /// The mail's UID.
    pub fn uid(&self) -> u32 {
        self.base().uid
    }

    /// The mail's flags byte, decoded.
    pub fn flags(&self) -> MailFlags {
        MailFlags::from_bits_truncate(self.base().flags)
    }

    /// The inline keyword bitmap.
    pub fn keywords(&self) -> [u8; KEYWORDS_BYTE_COUNT] {
        self.base().keywords
    }

    /// Raw extension slot bytes, given the slot geometry from the owning
    /// map's extension table.
    pub(crate) fn ext_bytes(&self, record_offset: u16, record_size: u16) -> &[u8] {
        &self.raw[record_offset as usize..record_offset as usize + record_size as usize]
    }
}

/// Extension metadata resolved for one particular map.
#[derive(Debug, Clone)]
pub struct MapExt {
    /// The extension's registered name.
    pub name: String,
    /// Offset of the extension's header data inside the header block.
    pub hdr_offset: u32,
    /// Size of the extension's header data.
    pub hdr_size: u32,
    /// Generation counter; bumped whenever the extension's derived state
    /// is reset.
    pub reset_id: u32,
    /// Offset of the extension's slot inside each record.
    pub record_offset: u16,
    /// Width of the extension's record slot, 0 for header-only extensions.
    pub record_size: u16,
    /// Alignment requirement of the record slot.
    pub record_align: u16,
}

#[derive(Debug)]
enum Records {
    File(FileMap),
    Heap(Vec<u8>),
}

/// Name of the extension whose header data lists keyword names in bit
/// order. The list is what makes keyword bit indices deterministic across
/// processes.
pub(crate) const KEYWORDS_EXT_NAME: &str = "keywords";

/// One immutable snapshot of an index.
#[derive(Debug)]
pub struct Map {
    pub(crate) hdr: IndexHeader,
    /// The full header block (base header image plus extension block),
    /// `hdr.header_size` bytes, always heap-resident.
    pub(crate) hdr_block: Vec<u8>,
    records: Records,
    pub(crate) extensions: Vec<MapExt>,
    /// Keyword names in bit order, parsed from the keywords extension.
    pub(crate) keywords: Vec<String>,
}

fn check_header(hdr: &IndexHeader, path: &Path, file_len: usize) -> Result<()> {
    if hdr.major_version != INDEX_MAJOR_VERSION {
        // An older major is unusable, a newer one unreadable. Both rebuild.
        return Err(Error::corrupted(
            path,
            format!("major version {} != {}", hdr.major_version, INDEX_MAJOR_VERSION),
        ));
    }
    if hdr.compat_flags != host_compat_flags() {
        return Err(Error::corrupted(path, "endianness mismatch"));
    }
    if hdr.compat_sizeof_file_offset != COMPAT_SIZEOF_FILE_OFFSET {
        return Err(Error::corrupted(path, "file offset width mismatch"));
    }
    if (hdr.base_header_size as usize) < INDEX_BASE_HEADER_SIZE
        || hdr.header_size < hdr.base_header_size as u32
    {
        return Err(Error::corrupted(path, "header sizes broken"));
    }
    if hdr.record_size < crate::ondisk::RECORD_BASE_SIZE as u32 {
        return Err(Error::corrupted(path, "record_size too small"));
    }
    if hdr.indexid == 0 {
        return Err(Error::corrupted(path, "indexid is 0"));
    }
    let used_file_size =
        hdr.header_size as u64 + hdr.messages_count as u64 * hdr.record_size as u64;
    if used_file_size > file_len as u64 {
        return Err(Error::corrupted(
            path,
            format!("used file size {used_file_size} > file size {file_len}"),
        ));
    }
    Ok(())
}

fn parse_extensions(hdr: &IndexHeader, hdr_block: &[u8], path: &Path) -> Result<Vec<MapExt>> {
    let mut extensions = Vec::new();
    let mut pos = hdr.base_header_size as usize;
    let end = hdr.header_size as usize;
    while pos + EXT_HEADER_SIZE <= end {
        let (ext_hdr, _) = ExtHeader::read_from_prefix(&hdr_block[pos..])
            .map_err(|_| Error::corrupted(path, "extension header truncated"))?;
        let name_start = pos + EXT_HEADER_SIZE;
        let name_end = name_start + ext_hdr.name_size as usize;
        if name_end > end {
            return Err(Error::corrupted(path, "extension name out of bounds"));
        }
        let name_bytes = &hdr_block[name_start..name_end];
        if memchr::memchr(0, name_bytes).is_some() {
            return Err(Error::corrupted(path, "NUL in extension name"));
        }
        let name = String::from_utf8(name_bytes.to_vec())
            .map_err(|_| Error::corrupted(path, "extension name not UTF-8"))?;

        let hdr_offset = align4(name_end);
        let data_end = hdr_offset + ext_hdr.hdr_size as usize;
        if data_end > end {
            return Err(Error::corrupted(path, "extension header data out of bounds"));
        }
        if ext_hdr.record_size != 0
            && (ext_hdr.record_offset as u32 + ext_hdr.record_size as u32) > hdr.record_size
        {
            return Err(Error::corrupted(path, "extension record slot out of record"));
        }
        extensions.push(MapExt {
            name,
            hdr_offset: hdr_offset as u32,
            hdr_size: ext_hdr.hdr_size,
            reset_id: ext_hdr.reset_id,
            record_offset: ext_hdr.record_offset,
            record_size: ext_hdr.record_size,
            record_align: ext_hdr.record_align,
        });
        pos = align4(data_end);
    }
    Ok(extensions)
}

/// Parses the NUL-separated keyword name list out of the keywords
/// extension's header data.
fn parse_keyword_names(hdr_block: &[u8], extensions: &[MapExt]) -> Vec<String> {
    let Some(ext) = extensions.iter().find(|ext| ext.name == KEYWORDS_EXT_NAME) else {
        return Vec::new();
    };
    let data = &hdr_block[ext.hdr_offset as usize..(ext.hdr_offset + ext.hdr_size) as usize];
    let mut names = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        match memchr::memchr(0, &data[pos..]) {
            Some(0) => break, // trailing padding
            Some(len) => {
                if let Ok(name) = std::str::from_utf8(&data[pos..pos + len]) {
                    names.push(name.to_string());
                }
                pos += len + 1;
            }
            None => break,
        }
    }
    names
}

impl Map {
    /// An empty map for a freshly created index.
    pub(crate) fn empty(indexid: u32, uid_validity: u32) -> Map {
        let hdr = IndexHeader::new(indexid, uid_validity);
        let hdr_block = hdr.as_bytes().to_vec();
        Map {
            hdr,
            hdr_block,
            records: Records::Heap(Vec::new()),
            extensions: Vec::new(),
            keywords: Vec::new(),
        }
    }

    /// Parses and verifies a file image into a map.
    pub(crate) fn from_buffer(buf: FileMap, path: &Path) -> Result<Map> {
        let bytes = buf.as_slice();
        let (hdr, _) = IndexHeader::read_from_prefix(bytes)
            .map_err(|_| Error::corrupted(path, "file too small for header"))?;
        check_header(&hdr, path, bytes.len())?;
        if hdr.header_size as usize > bytes.len() {
            return Err(Error::corrupted(path, "header_size larger than file"));
        }
        let hdr_block = bytes[..hdr.header_size as usize].to_vec();
        let extensions = parse_extensions(&hdr, &hdr_block, path)?;
        let keywords = parse_keyword_names(&hdr_block, &extensions);
        Ok(Map {
            hdr,
            hdr_block,
            records: Records::File(buf),
            extensions,
            keywords,
        })
    }

    pub(crate) fn messages_count(&self) -> u32 {
        self.hdr.messages_count
    }

    pub(crate) fn record_size(&self) -> usize {
        self.hdr.record_size as usize
    }

    fn record_region(&self) -> &[u8] {
        match &self.records {
            Records::File(map) => &map.as_slice()[self.hdr.header_size as usize..],
            Records::Heap(data) => data,
        }
    }

    /// The record at 1-based sequence `seq`.
    pub fn record(&self, seq: u32) -> &RecordView {
        assert!(seq > 0 && seq <= self.hdr.messages_count, "seq {seq} out of range");
        let size = self.record_size();
        let start = (seq as usize - 1) * size;
        RecordView::ref_cast(&self.record_region()[start..start + size])
    }

    /// Binary search for `uid`. `left_idx` is a caller-maintained hint that
    /// makes ascending scans amortized linear. `nearest_side > 0` returns
    /// the sequence holding `uid` or the next larger one, `< 0` the next
    /// smaller one; 0 means no match.
    pub(crate) fn bsearch_uid(&self, uid: u32, left_idx: &mut u32, nearest_side: i32) -> u32 {
        let count = self.hdr.messages_count;
        let mut left = *left_idx;
        let mut right = count;
        let mut idx = left;

        while left < right {
            idx = (left + right) / 2;
            let rec_uid = self.record(idx + 1).uid();
            if rec_uid < uid {
                left = idx + 1;
            } else if rec_uid > uid {
                right = idx;
            } else {
                break;
            }
        }
        if idx == count {
            return 0;
        }

        *left_idx = left;
        let rec_uid = self.record(idx + 1).uid();
        if rec_uid != uid {
            if nearest_side > 0 {
                if rec_uid > uid {
                    idx + 1
                } else if idx == count - 1 {
                    0
                } else {
                    idx + 2
                }
            } else if rec_uid < uid {
                idx + 1
            } else {
                idx
            }
        } else {
            idx + 1
        }
    }

    /// Maps an inclusive UID range to the sequences it covers; (0, 0) when
    /// no mail falls inside it.
    pub(crate) fn uid_range_to_seqs(&self, mut uid1: u32, mut uid2: u32) -> (u32, u32) {
        assert!(uid1 > 0 && uid1 <= uid2);
        if uid2 >= self.hdr.next_uid {
            uid2 = self.hdr.next_uid.saturating_sub(1);
            if uid1 > uid2 {
                return (0, 0);
            }
        }
        let mut left_idx = 0;
        let seq1 = self.bsearch_uid(uid1, &mut left_idx, 1);
        if seq1 == 0 || self.record(seq1).uid() > uid2 {
            return (0, 0);
        }
        if uid1 == uid2 {
            return (seq1, seq1);
        }
        let seq2 = self.bsearch_uid(uid2, &mut left_idx, -1);
        debug_assert!(seq2 >= seq1);
        (seq1, seq2)
    }

    /// Sequence holding exactly `uid`, if present.
    pub(crate) fn seq_of_uid(&self, uid: u32) -> Option<u32> {
        match self.uid_range_to_seqs(uid, uid) {
            (0, _) => None,
            (seq, _) => Some(seq),
        }
    }

    /// Slot index of the extension named `name` in this map, if present.
    pub(crate) fn ext_slot(&self, name: &str) -> Option<usize> {
        self.extensions.iter().position(|ext| ext.name == name)
    }

    pub(crate) fn ext(&self, slot: usize) -> &MapExt {
        &self.extensions[slot]
    }

    /// Extension slot bytes of record `seq`, `None` when the extension has
    /// no record slot in this map.
    pub(crate) fn ext_record_bytes(&self, seq: u32, slot: usize) -> Option<&[u8]> {
        let ext = &self.extensions[slot];
        if ext.record_size == 0 {
            return None;
        }
        Some(self.record(seq).ext_bytes(ext.record_offset, ext.record_size))
    }

    /// Extension header data bytes.
    pub(crate) fn ext_header_bytes(&self, slot: usize) -> &[u8] {
        let ext = &self.extensions[slot];
        &self.hdr_block[ext.hdr_offset as usize..(ext.hdr_offset + ext.hdr_size) as usize]
    }

    /// Heap clone, the starting point of every private sync map.
    pub(crate) fn to_memory(&self) -> Map {
        let used = self.hdr.messages_count as usize * self.record_size();
        Map {
            hdr: self.hdr,
            hdr_block: self.hdr_block.clone(),
            records: Records::Heap(self.record_region()[..used].to_vec()),
            extensions: self.extensions.clone(),
            keywords: self.keywords.clone(),
        }
    }

    pub(crate) fn is_in_memory(&self) -> bool {
        matches!(self.records, Records::Heap(_))
    }

    // --- Mutation, heap maps only. Used by sync replay and the writer. ---

    pub(crate) fn records_mut(&mut self) -> &mut Vec<u8> {
        match &mut self.records {
            Records::Heap(data) => data,
            Records::File(_) => panic!("mutating a file-backed map"),
        }
    }

    /// Refreshes the header image inside `hdr_block` from `self.hdr`.
    pub(crate) fn sync_header_block(&mut self) {
        let base = self.hdr.base_header_size as usize;
        self.hdr_block[..INDEX_BASE_HEADER_SIZE].copy_from_slice(self.hdr.as_bytes());
        debug_assert!(base >= INDEX_BASE_HEADER_SIZE);
    }

    /// Serializes the whole map (header block + records) for the index
    /// file checkpoint.
    pub(crate) fn to_file_image(&self) -> Vec<u8> {
        let used = self.hdr.messages_count as usize * self.record_size();
        let mut image = Vec::with_capacity(self.hdr_block.len() + used);
        image.extend_from_slice(&self.hdr_block);
        image.extend_from_slice(&self.record_region()[..used]);
        image
    }

    pub(crate) fn record_mut(&mut self, seq: u32) -> &mut [u8] {
        assert!(seq > 0 && seq <= self.hdr.messages_count);
        let size = self.record_size();
        let start = (seq as usize - 1) * size;
        &mut self.records_mut()[start..start + size]
    }

    /// Appends one record (fixed prefix from `rec`, extension slots
    /// zeroed) and maintains the header counters.
    pub(crate) fn append_record(&mut self, rec: &Record) {
        let size = self.record_size();
        let records = self.records_mut();
        let start = records.len();
        records.resize(start + size, 0);
        records[start..start + crate::ondisk::RECORD_BASE_SIZE].copy_from_slice(rec.as_bytes());
        self.hdr.messages_count += 1;
        self.hdr.next_uid = rec.uid + 1;
        self.header_update_counts(0, rec.flags);
        self.header_update_lowwaters(rec);
    }

    /// Removes the records covering `seq1..=seq2`; later sequences shift
    /// down.
    pub(crate) fn expunge_seqs(&mut self, seq1: u32, seq2: u32) {
        assert!(seq1 > 0 && seq1 <= seq2 && seq2 <= self.hdr.messages_count);
        for seq in seq1..=seq2 {
            let flags = self.record(seq).base().flags;
            // Counts fall as if the flags were cleared.
            self.header_update_counts(flags, 0);
        }
        let size = self.record_size();
        let start = (seq1 as usize - 1) * size;
        let end = seq2 as usize * size;
        self.records_mut().drain(start..end);
        self.hdr.messages_count -= seq2 - seq1 + 1;
    }

    /// Rewrites every record with a new stride, zero-filling grown
    /// suffixes. Called when an extension intro enlarges the layout.
    fn resize_records(&mut self, new_record_size: usize) {
        let old_size = self.record_size();
        if new_record_size == old_size {
            return;
        }
        let count = self.hdr.messages_count as usize;
        let old = std::mem::take(self.records_mut());
        let mut new = vec![0u8; count * new_record_size];
        let keep = old_size.min(new_record_size);
        for i in 0..count {
            new[i * new_record_size..i * new_record_size + keep]
                .copy_from_slice(&old[i * old_size..i * old_size + keep]);
        }
        *self.records_mut() = new;
        self.hdr.record_size = new_record_size as u32;
    }

    /// Re-serializes the header block from `self.hdr`, the extension table
    /// and `ext_data` (one data buffer per extension, in slot order).
    fn rebuild_header_block(&mut self, ext_data: &[Vec<u8>]) {
        let base = self.hdr.base_header_size as usize;
        let mut block = self.hdr_block[..base].to_vec();
        for (slot, ext) in self.extensions.iter_mut().enumerate() {
            let ext_hdr = ExtHeader {
                hdr_size: ext.hdr_size,
                reset_id: ext.reset_id,
                record_offset: ext.record_offset,
                record_size: ext.record_size,
                record_align: ext.record_align,
                name_size: ext.name.len() as u16,
            };
            block.extend_from_slice(ext_hdr.as_bytes());
            block.extend_from_slice(ext.name.as_bytes());
            block.resize(align4(block.len()), 0);
            ext.hdr_offset = block.len() as u32;
            debug_assert_eq!(ext_data[slot].len(), ext.hdr_size as usize);
            block.extend_from_slice(&ext_data[slot]);
            block.resize(align4(block.len()), 0);
        }
        self.hdr.header_size = block.len() as u32;
        block[..INDEX_BASE_HEADER_SIZE].copy_from_slice(self.hdr.as_bytes());
        self.hdr_block = block;
    }

    fn ext_data_buffers(&self) -> Vec<Vec<u8>> {
        (0..self.extensions.len())
            .map(|slot| self.ext_header_bytes(slot).to_vec())
            .collect()
    }

    /// Adds the extension if this map doesn't carry it yet, growing the
    /// record layout for its slot. Returns the slot index either way.
    pub(crate) fn add_or_rebind_ext(
        &mut self,
        name: &str,
        hdr_size: u32,
        record_size: u16,
        record_align: u16,
        reset_id: u32,
    ) -> usize {
        if let Some(slot) = self.ext_slot(name) {
            return slot;
        }
        let record_offset = if record_size > 0 {
            let align = record_align.max(1) as usize;
            self.record_size().div_ceil(align) * align
        } else {
            0
        };
        let mut ext_data = self.ext_data_buffers();
        ext_data.push(vec![0u8; hdr_size as usize]);
        self.extensions.push(MapExt {
            name: name.to_string(),
            hdr_offset: 0, // assigned by rebuild
            hdr_size,
            reset_id,
            record_offset: record_offset as u16,
            record_size,
            record_align,
        });
        if record_size > 0 {
            self.resize_records(align4(record_offset + record_size as usize));
        }
        self.rebuild_header_block(&ext_data);
        self.extensions.len() - 1
    }

    pub(crate) fn set_ext_reset_id(&mut self, slot: usize, reset_id: u32) {
        self.extensions[slot].reset_id = reset_id;
        let ext_data = self.ext_data_buffers();
        self.rebuild_header_block(&ext_data);
    }

    pub(crate) fn write_ext_header(&mut self, slot: usize, offset: u16, data: &[u8]) {
        let mut ext_data = self.ext_data_buffers();
        let buf = &mut ext_data[slot];
        let end = offset as usize + data.len();
        if end > buf.len() {
            buf.resize(end, 0);
            self.extensions[slot].hdr_size = end as u32;
        }
        buf[offset as usize..end].copy_from_slice(data);
        self.rebuild_header_block(&ext_data);
    }

    /// Applies a partial write into the base header image and re-reads the
    /// typed header from it.
    pub(crate) fn write_base_header(&mut self, offset: u16, data: &[u8]) {
        let end = offset as usize + data.len();
        if end > self.hdr.base_header_size as usize {
            return; // out-of-bounds updates from newer writers are skipped
        }
        self.hdr_block[offset as usize..end].copy_from_slice(data);
        self.hdr = IndexHeader::read_from_prefix(&self.hdr_block)
            .expect("header block shorter than base header")
            .0;
    }

    pub(crate) fn keyword_bit(&self, name: &str) -> Option<usize> {
        self.keywords
            .iter()
            .position(|kw| kw.eq_ignore_ascii_case(name))
    }

    /// Registers a keyword name in this map, extending the keywords
    /// extension's header data. `None` when the inline bitmap is full.
    pub(crate) fn add_keyword(&mut self, name: &str) -> Option<usize> {
        if let Some(bit) = self.keyword_bit(name) {
            return Some(bit);
        }
        if self.keywords.len() >= crate::ondisk::KEYWORDS_MAX {
            return None;
        }
        let slot = self.add_or_rebind_ext(KEYWORDS_EXT_NAME, 0, 0, 0, 0);
        let mut names_blob: Vec<u8> = Vec::new();
        for kw in &self.keywords {
            names_blob.extend_from_slice(kw.as_bytes());
            names_blob.push(0);
        }
        names_blob.extend_from_slice(name.as_bytes());
        names_blob.push(0);
        let mut ext_data = self.ext_data_buffers();
        self.extensions[slot].hdr_size = names_blob.len() as u32;
        ext_data[slot] = names_blob;
        self.rebuild_header_block(&ext_data);
        self.keywords.push(name.to_string());
        Some(self.keywords.len() - 1)
    }

    pub(crate) fn header_update_counts(&mut self, old_flags: u8, new_flags: u8) {
        let old = MailFlags::from_bits_truncate(old_flags);
        let new = MailFlags::from_bits_truncate(new_flags);
        if !old.contains(MailFlags::SEEN) && new.contains(MailFlags::SEEN) {
            self.hdr.seen_messages_count += 1;
        } else if old.contains(MailFlags::SEEN) && !new.contains(MailFlags::SEEN) {
            self.hdr.seen_messages_count = self.hdr.seen_messages_count.saturating_sub(1);
        }
        if !old.contains(MailFlags::DELETED) && new.contains(MailFlags::DELETED) {
            self.hdr.deleted_messages_count += 1;
        } else if old.contains(MailFlags::DELETED) && !new.contains(MailFlags::DELETED) {
            self.hdr.deleted_messages_count = self.hdr.deleted_messages_count.saturating_sub(1);
        }
        if new.contains(MailFlags::DIRTY) {
            self.hdr.flags |= crate::ondisk::HeaderFlags::HAVE_DIRTY.bits();
        }
    }

    pub(crate) fn header_update_lowwaters(&mut self, rec: &Record) {
        let flags = MailFlags::from_bits_truncate(rec.flags);
        let lower = |lowwater: &mut u32, uid: u32| {
            if *lowwater == 0 || uid < *lowwater {
                *lowwater = uid;
            }
        };
        if flags.contains(MailFlags::RECENT) {
            lower(&mut self.hdr.first_recent_uid_lowwater, rec.uid);
        }
        if !flags.contains(MailFlags::SEEN) {
            lower(&mut self.hdr.first_unseen_uid_lowwater, rec.uid);
        }
        if flags.contains(MailFlags::DELETED) {
            lower(&mut self.hdr.first_deleted_uid_lowwater, rec.uid);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use zerocopy::IntoBytes;

    pub(crate) fn heap_map_with_uids(uids: &[u32]) -> Map {
        let mut map = Map::empty(1, 1);
        for &uid in uids {
            let rec = Record {
                uid,
                flags: 0,
                keywords: [0; KEYWORDS_BYTE_COUNT],
            };
            map.records_mut().extend_from_slice(rec.as_bytes());
            map.hdr.messages_count += 1;
            map.hdr.next_uid = uid + 1;
        }
        map
    }

    #[test]
    fn record_access_by_seq() {
        let map = heap_map_with_uids(&[1, 5, 9]);
        assert_eq!(map.messages_count(), 3);
        assert_eq!(map.record(1).uid(), 1);
        assert_eq!(map.record(3).uid(), 9);
    }

    #[test]
    fn uid_range_lookup() {
        let map = heap_map_with_uids(&[2, 4, 6, 8, 10]);
        assert_eq!(map.uid_range_to_seqs(4, 8), (2, 4));
        assert_eq!(map.uid_range_to_seqs(3, 3), (0, 0));
        assert_eq!(map.uid_range_to_seqs(1, 100), (1, 5));
        assert_eq!(map.uid_range_to_seqs(11, 20), (0, 0));
        assert_eq!(map.uid_range_to_seqs(10, 10), (5, 5));
    }

    #[test]
    fn bsearch_left_hint_advances() {
        let map = heap_map_with_uids(&[1, 2, 3, 50, 51, 52]);
        let mut left = 0;
        assert_eq!(map.bsearch_uid(50, &mut left, 1), 4);
        // Subsequent searches reuse the narrowed hint.
        assert_eq!(map.bsearch_uid(52, &mut left, 1), 6);
        assert!(left > 0);
    }

    #[test]
    fn counts_follow_flag_transitions() {
        let mut map = heap_map_with_uids(&[1]);
        map.header_update_counts(0, MailFlags::SEEN.bits());
        assert_eq!(map.hdr.seen_messages_count, 1);
        map.header_update_counts(MailFlags::SEEN.bits(), 0);
        assert_eq!(map.hdr.seen_messages_count, 0);
        map.header_update_counts(0, MailFlags::DELETED.bits());
        assert_eq!(map.hdr.deleted_messages_count, 1);
    }
}
