//! Cache field registry and value encoding.
//!
//! Fields are registered by name with a decode type. Inside a cache file
//! fields are referenced by small per-file ids; the file's field-name
//! block (see `mod.rs`) maps them back to names, so files stay readable
//! after a process registers fields in a different order.
//!
//! Values are encoded type-dependently: fixed-width counters verbatim,
//! strings and variable blobs length-prefixed, timestamps as 7-bit
//! continuation varints.

use std::collections::HashMap;

use crate::ondisk::CacheFieldType;

/// Stable handle to a registered cache field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheFieldId(pub(crate) u32);

#[derive(Debug, Clone)]
pub(crate) struct CacheField {
    pub(crate) name: String,
    pub(crate) typ: CacheFieldType,
    /// Value width for `Fixed` fields, 0 otherwise.
    pub(crate) size: u32,
}

#[derive(Debug, Default)]
pub(crate) struct FieldRegistry {
    fields: Vec<CacheField>,
    by_name: HashMap<String, u32>,
}

impl FieldRegistry {
    pub(crate) fn register(&mut self, name: &str, typ: CacheFieldType, size: u32) -> CacheFieldId {
        assert!(!name.is_empty());
        assert!(
            (typ == CacheFieldType::Fixed) == (size > 0),
            "field {name}: size only applies to fixed fields"
        );
        if let Some(&idx) = self.by_name.get(name) {
            return CacheFieldId(idx);
        }
        let idx = self.fields.len() as u32;
        self.fields.push(CacheField {
            name: name.to_string(),
            typ,
            size,
        });
        self.by_name.insert(name.to_string(), idx);
        CacheFieldId(idx)
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<CacheFieldId> {
        self.by_name.get(name).copied().map(CacheFieldId)
    }

    pub(crate) fn get(&self, id: CacheFieldId) -> &CacheField {
        &self.fields[id.0 as usize]
    }

    pub(crate) fn count(&self) -> usize {
        self.fields.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (CacheFieldId, &CacheField)> {
        self.fields
            .iter()
            .enumerate()
            .map(|(idx, field)| (CacheFieldId(idx as u32), field))
    }
}

/// Appends `n` as a 7-bit continuation varint (low groups first).
pub(crate) fn pack_u32(buf: &mut Vec<u8>, mut n: u32) {
    loop {
        let group = (n & 0x7f) as u8;
        n >>= 7;
        if n == 0 {
            buf.push(group);
            return;
        }
        buf.push(group | 0x80);
    }
}

/// Decodes a varint from the front of `data`, returning the value and the
/// number of bytes consumed. `None` on truncation or overflow.
pub(crate) fn unpack_u32(data: &[u8]) -> Option<(u32, usize)> {
    let mut value: u32 = 0;
    for (i, &byte) in data.iter().enumerate() {
        if i >= 5 {
            return None;
        }
        value |= ((byte & 0x7f) as u32).checked_shl(7 * i as u32)?;
        if byte & 0x80 == 0 {
            if i == 4 && byte > 0x0f {
                return None; // bits beyond 32
            }
            return Some((value, i + 1));
        }
    }
    None
}

/// Encodes one field value per its type. `data` is the logical value:
/// exactly `size` bytes for fixed fields, a little-endian u32 for dates,
/// arbitrary bytes otherwise.
pub(crate) fn encode_value(buf: &mut Vec<u8>, field: &CacheField, data: &[u8]) {
    match field.typ {
        CacheFieldType::Fixed => {
            debug_assert_eq!(data.len(), field.size as usize);
            buf.extend_from_slice(data);
        }
        CacheFieldType::Variable | CacheFieldType::String => {
            buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
            buf.extend_from_slice(data);
        }
        CacheFieldType::Date => {
            let secs = u32::from_le_bytes(data.try_into().expect("date value is 4 bytes"));
            pack_u32(buf, secs);
        }
    }
}

/// Decodes one field value from the front of `data`, returning the
/// logical value and bytes consumed. `None` on truncation.
pub(crate) fn decode_value(field: &CacheField, data: &[u8]) -> Option<(Vec<u8>, usize)> {
    match field.typ {
        CacheFieldType::Fixed => {
            let size = field.size as usize;
            if data.len() < size {
                return None;
            }
            Some((data[..size].to_vec(), size))
        }
        CacheFieldType::Variable | CacheFieldType::String => {
            if data.len() < 4 {
                return None;
            }
            let len = u32::from_le_bytes(data[..4].try_into().unwrap()) as usize;
            if data.len() < 4 + len {
                return None;
            }
            Some((data[4..4 + len].to_vec(), 4 + len))
        }
        CacheFieldType::Date => {
            let (secs, used) = unpack_u32(data)?;
            Some((secs.to_le_bytes().to_vec(), used))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn varint_roundtrip_and_width() {
        for n in [0u32, 1, 0x7f, 0x80, 0x3fff, 0x4000, 0x1f_ffff, u32::MAX] {
            let mut buf = Vec::new();
            pack_u32(&mut buf, n);
            // ceil(log2(n+1) / 7) bytes, one minimum.
            let expected = if n == 0 {
                1
            } else {
                (32 - n.leading_zeros()).div_ceil(7) as usize
            };
            assert_eq!(buf.len(), expected, "width of {n:#x}");
            let (decoded, used) = unpack_u32(&buf).unwrap();
            assert_eq!(decoded, n);
            assert_eq!(used, buf.len());
        }
    }

    #[test]
    fn varint_rejects_truncation_and_overflow() {
        assert!(unpack_u32(&[]).is_none());
        assert!(unpack_u32(&[0x80]).is_none());
        assert!(unpack_u32(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01]).is_none());
        assert!(unpack_u32(&[0x80, 0x80, 0x80, 0x80, 0x7f]).is_none());
    }

    #[test]
    fn registry_is_idempotent() {
        let mut registry = FieldRegistry::default();
        let a = registry.register("size", CacheFieldType::Fixed, 4);
        let b = registry.register("size", CacheFieldType::Fixed, 4);
        assert_eq!(a, b);
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.lookup("size"), Some(a));
        assert_eq!(registry.lookup("date"), None);
    }

    #[test]
    fn value_encodings_roundtrip() {
        let mut registry = FieldRegistry::default();
        let fixed = registry.register("size", CacheFieldType::Fixed, 4);
        let string = registry.register("subject", CacheFieldType::String, 0);
        let date = registry.register("received", CacheFieldType::Date, 0);

        for (id, value) in [
            (fixed, 1234u32.to_le_bytes().to_vec()),
            (string, b"Re: hello".to_vec()),
            (date, 1_600_000_000u32.to_le_bytes().to_vec()),
        ] {
            let field = registry.get(id).clone();
            let mut buf = Vec::new();
            encode_value(&mut buf, &field, &value);
            let (decoded, used) = decode_value(&field, &buf).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(used, buf.len());
        }
    }
}
