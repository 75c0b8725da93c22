//! Guest framebuffer shared-memory view
//!
//! Read-only mapping of the POSIX shared memory object a guest publishes its
//! framebuffer into. The mapping is fixed-capacity: the guest may resize its
//! logical display freely within 4096×2048 without the mapping ever moving,
//! and reads can never leave the region. The guest writes concurrently with
//! no cross-process locking; a torn row is acceptable, an out-of-bounds read
//! is not.

use std::num::NonZeroUsize;
use std::os::unix::io::RawFd;

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::close;
use thiserror::Error;
use tracing::{debug, warn};

use crate::codec::{self, PixelFormat};

/// Largest framebuffer width a guest may announce.
pub const MAX_WIDTH: u32 = 4096;
/// Largest framebuffer height a guest may announce.
pub const MAX_HEIGHT: u32 = 2048;
/// Fixed capacity of every guest framebuffer region.
pub const SHM_CAPACITY: usize = (MAX_WIDTH as usize) * (MAX_HEIGHT as usize) * 4;

/// Errors raised by the shared-memory layer.
#[derive(Debug, Error)]
pub enum ShmError {
    /// `shm_open` failed.
    #[error("shm_open({name}) failed: {source}")]
    Open {
        /// Region name
        name: String,
        /// Underlying errno
        source: nix::Error,
    },

    /// `mmap` failed.
    #[error("mmap of {name} failed: {source}")]
    Map {
        /// Region name
        name: String,
        /// Underlying errno
        source: nix::Error,
    },
}

/// The shared-memory object name for a guest's numeric id.
pub fn region_name(vm_id: i32) -> String {
    format!("/{vm_id}.rdpmux")
}

/// Read-only mapping of a guest framebuffer region.
#[derive(Debug)]
pub struct FramebufferView {
    base: *const u8,
    len: usize,
    name: String,
}

// The mapping is immutable from this process and lives until drop.
unsafe impl Send for FramebufferView {}
unsafe impl Sync for FramebufferView {}

impl FramebufferView {
    /// Open and map `name` read-only with the given capacity.
    pub fn open(name: &str, capacity: usize) -> Result<Self, ShmError> {
        let fd: RawFd = shm_open(name, OFlag::O_RDONLY, Mode::empty()).map_err(|source| {
            ShmError::Open {
                name: name.to_owned(),
                source,
            }
        })?;

        let len = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        let base = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        };

        // The fd is only needed for the mapping itself.
        if let Err(e) = close(fd) {
            warn!("close({name}) after mmap failed: {e}");
        }

        let base = base.map_err(|source| ShmError::Map {
            name: name.to_owned(),
            source,
        })?;

        debug!("mapped {name}: {capacity} bytes read-only");

        Ok(Self {
            base: base as *const u8,
            len: capacity,
            name: name.to_owned(),
        })
    }

    /// Region name this view was opened from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the mapping is zero-length (never the case in practice).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The mapped bytes. The guest writes concurrently; rows may be torn but
    /// the slice never exceeds the fixed mapping.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base, self.len) }
    }

    /// Copy a rectangle out of the guest buffer into `dst`, converting from
    /// the guest pixel layout to the destination layout in one pass.
    ///
    /// `src_stride` is the guest's row pitch (`width × source bpp`); both
    /// buffers address the same coordinate space.
    #[allow(clippy::too_many_arguments)]
    pub fn copy_rect(
        &self,
        src_x: usize,
        src_y: usize,
        width: usize,
        height: usize,
        src_format: PixelFormat,
        src_stride: usize,
        dst: &mut [u8],
        dst_format: PixelFormat,
        dst_stride: usize,
    ) {
        codec::copy_rect(
            dst,
            dst_format,
            dst_stride,
            src_x,
            src_y,
            width,
            height,
            self.as_slice(),
            src_format,
            src_stride,
        );
    }
}

impl Drop for FramebufferView {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.base as *mut _, self.len) } {
            warn!("munmap of {} failed: {e}", self.name);
        }
    }
}

/// Remove a region by name. Used by tests and by guests tearing down.
pub fn unlink_region(name: &str) {
    let _ = shm_unlink(name);
}

/// Create a writable region filled with `data`. Test support only; guests
/// normally create and truncate their own regions.
#[cfg(test)]
pub(crate) fn create_test_region(name: &str, data: &[u8]) {
    use nix::unistd::ftruncate;

    unlink_region(name);
    let fd = shm_open(
        name,
        OFlag::O_CREAT | OFlag::O_RDWR,
        Mode::S_IRUSR | Mode::S_IWUSR,
    )
    .expect("shm_open for create");
    ftruncate(fd, data.len() as i64).expect("ftruncate");

    let base = unsafe {
        mmap(
            None,
            NonZeroUsize::new(data.len()).unwrap(),
            ProtFlags::PROT_WRITE | ProtFlags::PROT_READ,
            MapFlags::MAP_SHARED,
            fd,
            0,
        )
        .expect("mmap rw")
    };
    unsafe {
        std::ptr::copy_nonoverlapping(data.as_ptr(), base as *mut u8, data.len());
        munmap(base, data.len()).expect("munmap rw");
    }
    close(fd).expect("close");
}
