//! Named POSIX shared memory regions

use std::fs::File;

use memmap2::{Mmap, MmapMut, MmapOptions};
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use tracing::{debug, warn};

use crate::error::ShmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

enum Mapping {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

/// A mapped shared memory object.
///
/// The creating side owns the name and unlinks it on drop; attached handles
/// only unmap. Regions are zero-filled on creation and sized up to whole pages.
pub struct SharedRegion {
    name: String,
    len: usize,
    map: Mapping,
    owner: bool,
}

fn round_to_page(len: usize) -> usize {
    let page = page_size::get();
    len.max(1).div_ceil(page) * page
}

impl SharedRegion {
    pub fn create(name: &str, len: usize) -> Result<Self, ShmError> {
        let create_err = |source| ShmError::Create {
            name: name.to_owned(),
            source,
        };
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(create_err)?;

        let mapped_len = round_to_page(len);
        if let Err(err) = ftruncate(&fd, mapped_len as i64) {
            let _ = shm_unlink(name);
            return Err(create_err(err));
        }

        let file = File::from(fd);
        // SAFETY: the object was just created with O_EXCL and sized above. Other
        // mappings only appear through `open`, whose users follow the trigger protocol.
        let map = match unsafe { MmapOptions::new().len(mapped_len).map_mut(&file) } {
            Ok(map) => map,
            Err(source) => {
                let _ = shm_unlink(name);
                return Err(ShmError::Map {
                    name: name.to_owned(),
                    source,
                });
            }
        };

        debug!(name, len, mapped_len, "created shared memory");
        Ok(Self {
            name: name.to_owned(),
            len,
            map: Mapping::ReadWrite(map),
            owner: true,
        })
    }

    /// Attaches to an existing region that must hold at least `len` bytes.
    pub fn open(name: &str, len: usize, access: Access) -> Result<Self, ShmError> {
        let flags = match access {
            Access::ReadOnly => OFlag::O_RDONLY,
            Access::ReadWrite => OFlag::O_RDWR,
        };
        let fd = shm_open(name, flags, Mode::empty()).map_err(|source| ShmError::Open {
            name: name.to_owned(),
            source,
        })?;
        let file = File::from(fd);

        let map_err = |source| ShmError::Map {
            name: name.to_owned(),
            source,
        };
        let actual = file.metadata().map_err(map_err)?.len() as usize;
        if actual < len {
            return Err(ShmError::SizeMismatch {
                name: name.to_owned(),
                expected: len,
                actual,
            });
        }

        // SAFETY: see `create`; the size was checked against the object above.
        let map = unsafe {
            match access {
                Access::ReadOnly => MmapOptions::new().len(actual).map(&file).map(Mapping::ReadOnly),
                Access::ReadWrite => MmapOptions::new()
                    .len(actual)
                    .map_mut(&file)
                    .map(Mapping::ReadWrite),
            }
        }
        .map_err(map_err)?;

        debug!(name, len, ?access, "attached shared memory");
        Ok(Self {
            name: name.to_owned(),
            len,
            map,
            owner: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Logical length requested by the creator (not page-rounded).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.map {
            Mapping::ReadOnly(map) => &map[..self.len],
            Mapping::ReadWrite(map) => &map[..self.len],
        }
    }

    pub fn as_mut_slice(&mut self) -> Result<&mut [u8], ShmError> {
        match &mut self.map {
            Mapping::ReadWrite(map) => Ok(&mut map[..self.len]),
            Mapping::ReadOnly(_) => Err(ShmError::ReadOnly {
                name: self.name.clone(),
            }),
        }
    }

    /// Base address of the mapping, valid for `len()` bytes while `self` lives.
    pub fn as_ptr(&self) -> *const u8 {
        match &self.map {
            Mapping::ReadOnly(map) => map.as_ptr(),
            Mapping::ReadWrite(map) => map.as_ptr(),
        }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if self.owner {
            if let Err(err) = shm_unlink(self.name.as_str()) {
                warn!(name = %self.name, %err, "failed to unlink shared memory");
            } else {
                debug!(name = %self.name, "unlinked shared memory");
            }
        }
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("owner", &self.owner)
            .finish()
    }
}
