//! File-backed and heap-backed byte regions.
//!
//! The primary index and the cache are normally `mmap()`ed read-only. The
//! mapping length is rounded up to the page size so that a file growing
//! within the last mapped page only needs a length refresh, not a remap.
//! Heap backing is used when mmap is disabled, for in-memory indexes, and
//! for the private map copies view sync mutates.

use std::fs::File;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::path::Path;
use std::ptr::NonNull;
use std::slice;

use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;
use nix::sys::mman::mmap;
use nix::sys::mman::munmap;

use crate::error::Error;
use crate::error::Result;

#[derive(Debug)]
enum Backing {
    Mmap {
        ptr: NonNull<libc::c_void>,
        map_len: usize,
    },
    Heap(Vec<u8>),
}

/// A contiguous byte region holding one index or cache file image.
#[derive(Debug)]
pub(crate) struct FileMap {
    backing: Backing,
    /// Bytes of actual file content; for mmap backing this is ≤ the page
    /// rounded mapping length.
    len: usize,
}

// The mmap pointer is only ever dereferenced through &self borrows of the
// owning FileMap, which serializes access the same way a Vec would.
unsafe impl Send for FileMap {}
unsafe impl Sync for FileMap {}

fn round_to_page(len: usize) -> usize {
    let page = page_size::get();
    len.div_ceil(page).max(1) * page
}

fn map_fd(file: &File, path: &Path, len: usize) -> Result<NonNull<libc::c_void>> {
    let map_len =
        NonZeroUsize::new(len).ok_or_else(|| Error::corrupted(path, "mmap of empty file"))?;
    unsafe {
        mmap(
            None,
            map_len,
            ProtFlags::PROT_READ,
            MapFlags::MAP_SHARED,
            file.as_fd(),
            0,
        )
    }
    .map_err(|errno| Error::nix("mmap", path, errno))
}

impl FileMap {
    /// Maps the whole of `file` read-only.
    pub(crate) fn map_file(file: &File, path: &Path) -> Result<FileMap> {
        let len = file
            .metadata()
            .map_err(|err| Error::io("fstat", path, err))?
            .len() as usize;
        let map_len = round_to_page(len);
        let ptr = map_fd(file, path, map_len)?;
        Ok(FileMap {
            backing: Backing::Mmap { ptr, map_len },
            len,
        })
    }

    /// Reads the whole of `file` into a heap buffer (mmap-disabled mode).
    pub(crate) fn read_file(file: &File, path: &Path) -> Result<FileMap> {
        use std::io::Read;
        use std::io::Seek;
        let mut data = Vec::new();
        let mut file = file;
        file.seek(std::io::SeekFrom::Start(0))
            .map_err(|err| Error::io("lseek", path, err))?;
        file.read_to_end(&mut data)
            .map_err(|err| Error::io("read", path, err))?;
        Ok(FileMap::from_vec(data))
    }

    pub(crate) fn from_vec(data: Vec<u8>) -> FileMap {
        let len = data.len();
        FileMap {
            backing: Backing::Heap(data),
            len,
        }
    }

    /// Re-checks the file length after growth. Stays on the same mapping
    /// when the new length still fits the page-rounded region, otherwise
    /// maps anew.
    pub(crate) fn refresh(&mut self, file: &File, path: &Path) -> Result<()> {
        let new_len = file
            .metadata()
            .map_err(|err| Error::io("fstat", path, err))?
            .len() as usize;
        match &mut self.backing {
            Backing::Mmap { ptr, map_len } => {
                if new_len <= *map_len {
                    self.len = new_len;
                    return Ok(());
                }
                let new_map_len = round_to_page(new_len);
                let new_ptr = map_fd(file, path, new_map_len)?;
                let old_ptr = *ptr;
                let old_len = *map_len;
                *ptr = new_ptr;
                *map_len = new_map_len;
                self.len = new_len;
                if let Err(errno) = unsafe { munmap(old_ptr, old_len) } {
                    return Err(Error::nix("munmap", path, errno));
                }
                Ok(())
            }
            Backing::Heap(_) => {
                *self = FileMap::read_file(file, path)?;
                Ok(())
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        match &self.backing {
            Backing::Mmap { ptr, .. } => unsafe {
                slice::from_raw_parts(ptr.as_ptr() as *const u8, self.len)
            },
            Backing::Heap(data) => &data[..self.len],
        }
    }

    /// Heap copy of the region, used to build private mutable maps.
    pub(crate) fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }

    pub(crate) fn is_mmap(&self) -> bool {
        matches!(self.backing, Backing::Mmap { .. })
    }
}

impl Drop for FileMap {
    fn drop(&mut self) {
        if let Backing::Mmap { ptr, map_len } = &self.backing {
            let _ = unsafe { munmap(*ptr, *map_len) };
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn mmap_tracks_file_growth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grow");
        let mut file = File::create(&path).unwrap();
        file.write_all(b"hello").unwrap();
        file.sync_all().unwrap();

        let read_side = File::open(&path).unwrap();
        let mut map = FileMap::map_file(&read_side, &path).unwrap();
        assert_eq!(map.as_slice(), b"hello");

        file.write_all(b" world").unwrap();
        file.sync_all().unwrap();
        map.refresh(&read_side, &path).unwrap();
        assert_eq!(map.as_slice(), b"hello world");
    }

    #[test]
    fn heap_roundtrip() {
        let map = FileMap::from_vec(vec![1, 2, 3]);
        assert!(!map.is_mmap());
        assert_eq!(map.as_slice(), &[1, 2, 3]);
        assert_eq!(map.to_vec(), vec![1, 2, 3]);
    }
}
