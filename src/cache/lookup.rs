//! Reading cached fields.

use zerocopy::FromBytes;

use crate::cache::Cache;
use crate::cache::CacheState;
use crate::cache::fields;
use crate::cache::fields::CacheFieldId;
use crate::error::Result;
use crate::ondisk::CACHE_RECORD_HEADER_SIZE;
use crate::ondisk::CacheRecordHeader;
use crate::view::View;

impl Cache {
    /// The cached value of `field` for the mail at `seq`, or `None` on any
    /// kind of miss: no cache file, stale reset_id, field never cached.
    /// Misses are never errors; the caller recomputes from the mail store.
    pub fn lookup(&self, view: &View, seq: u32, field: CacheFieldId) -> Result<Option<Vec<u8>>> {
        let result = self.lookup_inner(view, seq, field)?;
        self.count_lookup(result.is_some());
        Ok(result)
    }

    fn lookup_inner(&self, view: &View, seq: u32, field: CacheFieldId) -> Result<Option<Vec<u8>>> {
        if self.inner.index.is_in_memory() {
            return Ok(None);
        }
        // Offsets come from the view's own snapshot: a reader that hasn't
        // synced past a compaction must see misses, not the new file.
        let Some(slot) = view.lookup_ext(seq, self.ext_id()) else {
            return Ok(None);
        };
        let Some((_, reset_id)) = view.ext_header(self.ext_id()) else {
            return Ok(None);
        };
        let Ok(offset) = u32::read_from_bytes(&slot) else {
            return Ok(None);
        };
        if offset == 0 {
            return Ok(None);
        }

        let mut state = self.state();
        if !state.opened {
            self.try_open(&mut state)?;
        }
        // The offset is only meaningful against the file generation the
        // index header says it belongs to.
        match &state.hdr {
            Some(hdr) if hdr.file_seq == reset_id => {}
            _ => {
                self.reopen_if_changed(&mut state)?;
                match &state.hdr {
                    Some(hdr) if hdr.file_seq == reset_id => {}
                    Some(hdr) => {
                        // Still different: wait for the next compaction.
                        state.need_compress_file_seq = hdr.file_seq;
                        return Ok(None);
                    }
                    None => return Ok(None),
                }
            }
        }

        match self.walk_chain(&mut state, offset, field)? {
            Some(value) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    /// Follows the record chain from `offset`, newest first, returning the
    /// first occurrence of `field`.
    fn walk_chain(
        &self,
        state: &mut CacheState,
        mut offset: u32,
        field: CacheFieldId,
    ) -> Result<Option<Vec<u8>>> {
        // The newest record may postdate our mapping.
        if let Some(hdr) = &state.hdr {
            if offset >= hdr.used_file_size || state.map.as_ref().is_none_or(|m| {
                (offset as usize + CACHE_RECORD_HEADER_SIZE) > m.len()
            }) {
                self.reopen_if_changed(state)?;
            }
        }

        while offset != 0 {
            let Some(map) = &state.map else { return Ok(None) };
            let bytes = map.as_slice();
            let pos = offset as usize;
            if pos + CACHE_RECORD_HEADER_SIZE > bytes.len() {
                return Ok(None);
            }
            let (rec, _) =
                CacheRecordHeader::read_from_prefix(&bytes[pos..]).expect("bounds checked");
            if (rec.size as usize) < CACHE_RECORD_HEADER_SIZE
                || pos + rec.size as usize > bytes.len()
            {
                self.set_corrupted(state, "record size out of bounds");
                return Ok(None);
            }
            // Chains only ever point backwards; anything else is a loop.
            if rec.prev_offset != 0 && rec.prev_offset >= offset {
                self.set_corrupted(state, "record chain loops");
                return Ok(None);
            }
            let data = &bytes[pos + CACHE_RECORD_HEADER_SIZE..pos + rec.size as usize];
            if let Some(value) = self.find_field(state, data, field) {
                return Ok(Some(value));
            }
            offset = rec.prev_offset;
        }
        Ok(None)
    }

    fn find_field(&self, state: &CacheState, mut data: &[u8], field: CacheFieldId) -> Option<Vec<u8>> {
        let registry = self.inner.fields.read();
        while !data.is_empty() {
            let (file_id, used) = fields::unpack_u32(data)?;
            data = &data[used..];
            // A field this process couldn't resolve has an unknown width;
            // nothing after it in this record is reachable.
            let id = (*state.file_fields.get(file_id as usize)?)?;
            let (value, used) = fields::decode_value(registry.get(id), data)?;
            data = &data[used..];
            if id == field {
                return Some(value);
            }
        }
        None
    }
}
