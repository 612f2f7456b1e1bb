//! Cache compaction.
//!
//! Compaction rewrites the cache into a fresh file: live records are
//! copied with their linked lists collapsed into one record per mail,
//! dead space from expunged mails disappears, and the file gets a new
//! `file_seq`. The new file is renamed into place and the index's cache
//! extension reset_id is bumped in the same commit that publishes the new
//! offsets, so readers either see the new generation consistently or
//! treat all their cached offsets as absent.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use log::debug;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

use crate::cache::Cache;
use crate::cache::CacheState;
use crate::cache::fields;
use crate::cache::fields::CacheFieldId;
use crate::error::Error;
use crate::error::Result;
use crate::ondisk::CACHE_HEADER_SIZE;
use crate::ondisk::CACHE_RECORD_HEADER_SIZE;
use crate::ondisk::CACHE_VERSION;
use crate::ondisk::COMPAT_SIZEOF_FILE_OFFSET;
use crate::ondisk::CacheHeader;
use crate::ondisk::CacheRecordHeader;
use crate::ondisk::TMP_SUFFIX;
use crate::ondisk::align4;
use crate::view::View;

impl Cache {
    /// Rewrites the cache file, dropping dead space and collapsing record
    /// chains. The caller's `view` decides which mails survive; sync it
    /// first.
    pub fn compress(&self, view: &View) -> Result<()> {
        if self.inner.index.is_in_memory() {
            return Ok(());
        }
        let mut state = self.state();
        self.reopen_if_changed(&mut state)?;

        let old_file_seq = state.hdr.as_ref().map(|hdr| hdr.file_seq).unwrap_or(0);
        let index_reset_id = view
            .ext_header(self.inner.ext_id)
            .map(|(_, reset_id)| reset_id)
            .unwrap_or(0);
        let new_file_seq = old_file_seq.max(index_reset_id) + 1;

        let locked = state.file.is_some();
        if locked {
            self.lock_file(&mut state)?;
        }
        let rewritten = self.rewrite(&mut state, view, old_file_seq, new_file_seq);
        if locked && state.locked {
            let _ = self.unlock_file(&mut state);
        }
        let new_offsets = rewritten?;

        // Reset pending drop accounting; the dead space is gone.
        self.inner.pending_drops.lock().clear();
        state.need_compress_file_seq = 0;
        state.close_file();
        self.try_open(&mut state)?;
        drop(state);

        // Publish: bump the reset_id and point every surviving mail at its
        // new record, atomically through the log.
        let mut txn = self.inner.index.transaction();
        txn.reset_ext(self.inner.ext_id, new_file_seq);
        for (uid, offset) in new_offsets {
            txn.update_ext_record(self.inner.ext_id, uid, &offset.to_ne_bytes());
        }
        self.inner.index.commit(txn)?;
        Ok(())
    }

    /// Builds and renames the new file; returns (uid, new offset) pairs.
    fn rewrite(
        &self,
        state: &mut CacheState,
        view: &View,
        old_file_seq: u32,
        new_file_seq: u32,
    ) -> Result<Vec<(u32, u32)>> {
        let field_block = self.build_field_block();
        let mut image = CacheHeader {
            version: CACHE_VERSION,
            compat_sizeof_file_offset: COMPAT_SIZEOF_FILE_OFFSET,
            unused: [0; 2],
            indexid: self.inner.index.indexid(),
            file_seq: new_file_seq,
            continued_record_count: 0,
            used_file_size: 0, // patched below
            deleted_space: 0,
            field_header_offset: CACHE_HEADER_SIZE as u32,
        }
        .as_bytes()
        .to_vec();
        image.extend_from_slice(&field_block);

        let mut new_offsets = Vec::new();
        for seq in 1..=view.messages_count() {
            let Some((slot, reset_id)) = view.lookup_ext_latest(seq, self.inner.ext_id) else {
                continue;
            };
            if reset_id != old_file_seq {
                continue;
            }
            let Ok(offset) = u32::read_from_bytes(&slot) else {
                continue;
            };
            if offset == 0 {
                continue;
            }
            let values = self.collect_chain(state, offset);
            if values.is_empty() {
                continue;
            }
            let mut payload = Vec::new();
            {
                let registry = self.inner.fields.read();
                for (id, value) in &values {
                    // Field ids in the new file are registry order, which
                    // is exactly what build_field_block wrote.
                    fields::pack_u32(&mut payload, id.0);
                    fields::encode_value(&mut payload, registry.get(*id), value);
                }
            }
            let rec = CacheRecordHeader {
                prev_offset: 0,
                size: (CACHE_RECORD_HEADER_SIZE + payload.len()) as u32,
            };
            let new_offset = image.len() as u32;
            image.extend_from_slice(rec.as_bytes());
            image.extend_from_slice(&payload);
            image.resize(align4(image.len()), 0);
            new_offsets.push((view.lookup_uid(seq), new_offset));
        }

        let used = (image.len() as u32).to_ne_bytes();
        let used_offset = std::mem::offset_of!(CacheHeader, used_file_size);
        image[used_offset..used_offset + 4].copy_from_slice(&used);

        let tmp_path = {
            let mut os = self.inner.path.as_os_str().to_owned();
            os.push(TMP_SUFFIX);
            PathBuf::from(os)
        };
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&image)?;
            file.sync_data()
        };
        if let Err(err) = write() {
            let _ = fs::remove_file(&tmp_path);
            return Err(Error::io("pwrite", &tmp_path, err));
        }
        fs::rename(&tmp_path, &self.inner.path)
            .map_err(|err| Error::io("rename", &tmp_path, err))?;
        debug!(
            "{}: compacted to file_seq {new_file_seq}, {} live records",
            self.inner.path.display(),
            new_offsets.len()
        );
        Ok(new_offsets)
    }

    /// All field values reachable from `offset`, newest occurrence wins.
    fn collect_chain(&self, state: &CacheState, mut offset: u32) -> Vec<(CacheFieldId, Vec<u8>)> {
        let mut values: Vec<(CacheFieldId, Vec<u8>)> = Vec::new();
        let Some(map) = &state.map else {
            return values;
        };
        let bytes = map.as_slice();
        let registry = self.inner.fields.read();
        while offset != 0 {
            let pos = offset as usize;
            if pos + CACHE_RECORD_HEADER_SIZE > bytes.len() {
                break;
            }
            let (rec, _) =
                CacheRecordHeader::read_from_prefix(&bytes[pos..]).expect("bounds checked");
            if (rec.size as usize) < CACHE_RECORD_HEADER_SIZE
                || pos + rec.size as usize > bytes.len()
                || (rec.prev_offset != 0 && rec.prev_offset >= offset)
            {
                break;
            }
            let mut data = &bytes[pos + CACHE_RECORD_HEADER_SIZE..pos + rec.size as usize];
            while !data.is_empty() {
                let Some((file_id, used)) = fields::unpack_u32(data) else {
                    break;
                };
                data = &data[used..];
                let Some(Some(id)) = state.file_fields.get(file_id as usize).copied() else {
                    break;
                };
                let Some((value, used)) = fields::decode_value(registry.get(id), data) else {
                    break;
                };
                data = &data[used..];
                if !values.iter().any(|(existing, _)| *existing == id) {
                    values.push((id, value));
                }
            }
            offset = rec.prev_offset;
        }
        values
    }
}
