use core::fmt;
use core::ptr::{self, NonNull};

use std::io;
use std::mem;

/// The kernel identity of a region: its semaphore and shared memory ids.
///
/// This pair is what travels through the handshake; a peer process turns it
/// back into a usable region with [`SharedRegion::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionIds {
    pub sem: i32,
    pub shm: i32,
}

/// The access mode of an attached mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    ReadOnly,
    ReadWrite,
}

/// A shared memory segment paired with a binary semaphore.
///
/// The semaphore counter is initialized to 1; 1 means free. Dropping a
/// `SharedRegion` releases nothing kernel-side, destruction is always
/// explicit through [`destroy`] so that exactly one process owns the
/// lifetime.
///
/// [`destroy`]: SharedRegion::destroy
pub struct SharedRegion {
    sem_id: i32,
    shm_id: i32,
    size: usize,
}

impl SharedRegion {
    /// Create a region of the given size with a free lock.
    #[tracing::instrument]
    pub fn create(size: usize) -> io::Result<Self> {
        // SAFETY: We're just using c-apis as intended.
        unsafe {
            let shm_id = libc::shmget(libc::IPC_PRIVATE, size, libc::IPC_CREAT | 0o666);

            if shm_id == -1 {
                return Err(io::Error::last_os_error());
            }

            let sem_id = libc::semget(libc::IPC_PRIVATE, 1, libc::IPC_CREAT | 0o666);

            if sem_id == -1 {
                let e = io::Error::last_os_error();
                libc::shmctl(shm_id, libc::IPC_RMID, ptr::null_mut());
                return Err(e);
            }

            if libc::semctl(sem_id, 0, libc::SETVAL, 1) == -1 {
                let e = io::Error::last_os_error();
                libc::shmctl(shm_id, libc::IPC_RMID, ptr::null_mut());
                libc::semctl(sem_id, 0, libc::IPC_RMID);
                return Err(e);
            }

            tracing::trace!(shm_id, sem_id, size, "created region");

            Ok(Self {
                sem_id,
                shm_id,
                size,
            })
        }
    }

    /// Open a region created by another process from its kernel ids.
    ///
    /// The size is recovered from the segment itself.
    pub fn open(ids: RegionIds) -> io::Result<Self> {
        // SAFETY: We're just using c-apis as intended.
        unsafe {
            let mut ds = mem::zeroed::<libc::shmid_ds>();

            if libc::shmctl(ids.shm, libc::IPC_STAT, &mut ds) == -1 {
                return Err(io::Error::last_os_error());
            }

            Ok(Self {
                sem_id: ids.sem,
                shm_id: ids.shm,
                size: ds.shm_segsz as usize,
            })
        }
    }

    /// The kernel identity of the region.
    #[inline]
    pub fn ids(&self) -> RegionIds {
        RegionIds {
            sem: self.sem_id,
            shm: self.shm_id,
        }
    }

    /// The size of the region in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Map the region into this process.
    pub fn attach(&self, mode: Mode) -> io::Result<Mapping> {
        let flags = match mode {
            Mode::ReadOnly => libc::SHM_RDONLY,
            Mode::ReadWrite => 0,
        };

        // SAFETY: We're just using c-apis as intended.
        unsafe {
            let base = libc::shmat(self.shm_id, ptr::null(), flags);

            if base as isize == -1 {
                return Err(io::Error::last_os_error());
            }

            Ok(Mapping {
                base: NonNull::new_unchecked(base.cast()),
                len: self.size,
            })
        }
    }

    /// Take the region lock.
    ///
    /// The lock is released when the guard drops, so every exit path pairs
    /// the operations.
    #[inline]
    pub fn lock(&self) -> io::Result<LockGuard<'_>> {
        self.semop(-1)?;
        Ok(LockGuard { region: self })
    }

    /// Lock, copy the leading bytes of the region out, unlock.
    pub fn read_bytes(&self, map: &Mapping, buf: &mut [u8]) -> io::Result<()> {
        let _guard = self.lock()?;
        map.read_at(0, buf);
        Ok(())
    }

    /// Lock, overwrite the leading bytes of the region, unlock.
    pub fn write_bytes(&self, map: &Mapping, bytes: &[u8]) -> io::Result<()> {
        let _guard = self.lock()?;
        map.write_at(0, bytes);
        Ok(())
    }

    /// Mark both kernel objects for removal.
    ///
    /// Existing mappings stay usable until they detach; no new process can
    /// open the region afterwards.
    #[tracing::instrument(skip(self), fields(shm_id = self.shm_id, sem_id = self.sem_id))]
    pub fn destroy(self) -> io::Result<()> {
        // SAFETY: We're just using c-apis as intended.
        unsafe {
            let mut result = Ok(());

            if libc::shmctl(self.shm_id, libc::IPC_RMID, ptr::null_mut()) == -1 {
                result = Err(io::Error::last_os_error());
            }

            if libc::semctl(self.sem_id, 0, libc::IPC_RMID) == -1 && result.is_ok() {
                result = Err(io::Error::last_os_error());
            }

            result
        }
    }

    fn semop(&self, delta: i16) -> io::Result<()> {
        // SEM_UNDO keeps the lock recoverable when a holder dies between
        // acquire and release.
        let mut op = libc::sembuf {
            sem_num: 0,
            sem_op: delta,
            sem_flg: libc::SEM_UNDO as i16,
        };

        // SAFETY: We're just using c-apis as intended.
        unsafe {
            loop {
                if libc::semop(self.sem_id, &mut op, 1) == -1 {
                    match io::Error::last_os_error() {
                        e if e.kind() == io::ErrorKind::Interrupted => continue,
                        e => return Err(e),
                    }
                }

                return Ok(());
            }
        }
    }
}

impl fmt::Debug for SharedRegion {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRegion")
            .field("sem_id", &self.sem_id)
            .field("shm_id", &self.shm_id)
            .field("size", &self.size)
            .finish()
    }
}

/// Holds the region lock until dropped.
#[must_use = "Dropping the guard releases the lock immediately"]
pub struct LockGuard<'a> {
    region: &'a SharedRegion,
}

impl Drop for LockGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        _ = self.region.semop(1);
    }
}

/// An attached view of a region.
///
/// Detaches when dropped, so a mapping lives between exactly one attach and
/// one detach. Access is raw byte copies; callers serialize through the
/// region lock.
pub struct Mapping {
    base: NonNull<u8>,
    len: usize,
}

impl Mapping {
    /// The length of the mapping in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Test if the mapping is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read one byte of the mapping.
    #[inline]
    pub fn byte_at(&self, offset: usize) -> u8 {
        assert!(offset < self.len, "Offset out of bounds");

        // SAFETY: The offset was checked against the mapping length.
        unsafe { self.base.as_ptr().add(offset).read_volatile() }
    }

    /// Overwrite one byte of the mapping.
    #[inline]
    pub fn set_byte_at(&self, offset: usize, value: u8) {
        assert!(offset < self.len, "Offset out of bounds");

        // SAFETY: The offset was checked against the mapping length.
        unsafe { self.base.as_ptr().add(offset).write_volatile(value) }
    }

    /// Copy bytes out of the mapping.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) {
        assert!(
            offset.checked_add(buf.len()).is_some_and(|end| end <= self.len),
            "Range out of bounds"
        );

        // SAFETY: The range was checked against the mapping length.
        unsafe {
            ptr::copy_nonoverlapping(self.base.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
    }

    /// Copy bytes into the mapping.
    pub fn write_at(&self, offset: usize, bytes: &[u8]) {
        assert!(
            offset.checked_add(bytes.len()).is_some_and(|end| end <= self.len),
            "Range out of bounds"
        );

        // SAFETY: The range was checked against the mapping length.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.as_ptr().add(offset), bytes.len());
        }
    }

    /// Read a whole `T` from the start of the mapping.
    ///
    /// # Safety
    ///
    /// The mapping must hold a valid `T` at offset 0, placed there by the
    /// region's creator.
    #[inline]
    pub unsafe fn read_struct<T>(&self) -> T
    where
        T: Copy,
    {
        assert!(mem::size_of::<T>() <= self.len, "Mapping too small for T");

        // SAFETY: Size was checked; validity is the caller's contract.
        unsafe { self.base.as_ptr().cast::<T>().read_volatile() }
    }

    /// Write a whole `T` to the start of the mapping.
    ///
    /// # Safety
    ///
    /// The mapping must have been created to hold a `T` at offset 0.
    #[inline]
    pub unsafe fn write_struct<T>(&self, value: T)
    where
        T: Copy,
    {
        assert!(mem::size_of::<T>() <= self.len, "Mapping too small for T");

        // SAFETY: Size was checked; layout is the caller's contract.
        unsafe { self.base.as_ptr().cast::<T>().write_volatile(value) }
    }

    /// Detach the mapping, reporting any failure.
    pub fn detach(self) -> io::Result<()> {
        let base = self.base;
        mem::forget(self);

        // SAFETY: The mapping came from shmat and is detached exactly once
        // since `self` was consumed.
        unsafe {
            if libc::shmdt(base.as_ptr().cast()) == -1 {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(())
    }
}

impl Drop for Mapping {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: The mapping came from shmat and drop runs at most once.
        unsafe {
            _ = libc::shmdt(self.base.as_ptr().cast());
        }
    }
}

impl fmt::Debug for Mapping {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::{Mode, SharedRegion};

    #[test]
    fn create_attach_copy_destroy() -> io::Result<()> {
        let region = SharedRegion::create(16)?;
        let writer = region.attach(Mode::ReadWrite)?;
        let reader = region.attach(Mode::ReadOnly)?;

        region.write_bytes(&writer, &[1, 2, 3, 4])?;

        let mut buf = [0u8; 4];
        region.read_bytes(&reader, &mut buf)?;
        assert_eq!(buf, [1, 2, 3, 4]);

        reader.detach()?;
        writer.detach()?;
        region.destroy()
    }

    #[test]
    fn open_recovers_size() -> io::Result<()> {
        let region = SharedRegion::create(128)?;
        let opened = SharedRegion::open(region.ids())?;

        assert_eq!(opened.size(), 128);
        region.destroy()
    }

    #[test]
    fn version_byte_wraps() -> io::Result<()> {
        let region = SharedRegion::create(8)?;
        let map = region.attach(Mode::ReadWrite)?;

        map.set_byte_at(0, 255);

        {
            let _guard = region.lock()?;
            map.set_byte_at(0, map.byte_at(0).wrapping_add(1));
        }

        assert_eq!(map.byte_at(0), 0);

        map.detach()?;
        region.destroy()
    }

    #[test]
    fn destroyed_region_cannot_be_opened() -> io::Result<()> {
        let region = SharedRegion::create(8)?;
        let ids = region.ids();
        region.destroy()?;

        assert!(SharedRegion::open(ids).is_err());
        Ok(())
    }
}
