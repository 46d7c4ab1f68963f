use std::{
    fmt, io,
    sync::atomic::{AtomicU64, Ordering},
};

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, trace};

use crate::{os, Error, Protection, ReleaseError, Result};

static LAST_REGION_ID: AtomicU64 = AtomicU64::new(0);
static LAST_ALLOCATOR_ID: AtomicU64 = AtomicU64::new(0);

/// Identifies a region, including one that has already been released.
///
/// It carries no address, so holding on to it after release is harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(u64);

impl RegionId {
    fn next() -> Self {
        RegionId(LAST_REGION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct AllocatorId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Allocated,
    Written,
}

/// The process whose address space an allocator hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Process {
    pid: u32,
}

impl Process {
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
        }
    }

    pub fn with_pid(pid: u32) -> Self {
        Self { pid }
    }

    pub fn pid(self) -> u32 {
        self.pid
    }

    pub fn is_current(self) -> bool {
        self.pid == std::process::id()
    }
}

impl Default for Process {
    fn default() -> Self {
        Self::current()
    }
}

/// Parameters of a single allocation. The name only shows up in logs and `Debug`.
#[derive(Debug, Clone)]
pub struct RegionRequest {
    size: usize,
    protection: Protection,
    name: Option<String>,
}

impl RegionRequest {
    pub fn new(size: usize, protection: Protection) -> Self {
        Self {
            size,
            protection,
            name: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Anonymous memory owned by exactly one value.
///
/// The mapping is returned to the OS when the region is dropped or handed to
/// [`RegionAllocator::release`], whichever comes first.
#[derive(Debug)]
pub struct ExecutableRegion {
    id: RegionId,
    owner: AllocatorId,
    name: Option<String>,
    map: MmapMut,
    size: usize,
    protection: Protection,
    state: RegionState,
}

impl ExecutableRegion {
    pub fn id(&self) -> RegionId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn base(&self) -> *const u8 {
        self.map.as_ptr()
    }

    /// Logical size, as requested.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes actually mapped, a whole number of pages.
    pub fn reserved(&self) -> usize {
        self.map.len()
    }

    pub fn protection(&self) -> Protection {
        self.protection
    }

    pub fn state(&self) -> RegionState {
        self.state
    }

    pub fn read(&self, offset: usize, len: usize) -> Result<&[u8]> {
        if !self.protection.is_readable() {
            return Err(Error::denied(self.protection, "region is not readable"));
        }
        let end = self.checked_end(offset, len)?;
        Ok(&self.map[offset..end])
    }

    pub(crate) fn checked_end(&self, offset: usize, len: usize) -> Result<usize> {
        offset
            .checked_add(len)
            .filter(|&end| end <= self.size)
            .ok_or(Error::OutOfBounds {
                offset,
                len,
                size: self.size,
            })
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.map[..self.size]
    }

    pub(crate) fn mark_written(&mut self) {
        self.state = RegionState::Written;
    }
}

impl Drop for ExecutableRegion {
    fn drop(&mut self) {
        trace!(id = %self.id, name = ?self.name, reserved = self.map.len(), "unmapping region");
    }
}

/// Hands out [`ExecutableRegion`]s for one process.
#[derive(Debug)]
pub struct RegionAllocator {
    id: AllocatorId,
    process: Process,
}

impl RegionAllocator {
    pub fn new(process: Process) -> Self {
        Self {
            id: AllocatorId(LAST_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed)),
            process,
        }
    }

    pub fn process(&self) -> Process {
        self.process
    }

    pub fn allocate(&self, size: usize, protection: Protection) -> Result<ExecutableRegion> {
        self.allocate_with(RegionRequest::new(size, protection))
    }

    pub fn allocate_with(&self, request: RegionRequest) -> Result<ExecutableRegion> {
        let RegionRequest {
            size,
            protection,
            name,
        } = request;
        let fail = |source: io::Error| Error::Allocation {
            size,
            protection,
            source,
        };

        if !self.process.is_current() {
            return Err(fail(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("process {} is not the calling process", self.process.pid),
            )));
        }
        if size == 0 {
            return Err(fail(io::Error::new(
                io::ErrorKind::InvalidInput,
                "size must be greater than zero",
            )));
        }
        let reserved = os::round_up_to_page(size).ok_or_else(|| {
            fail(io::Error::new(
                io::ErrorKind::InvalidInput,
                "size overflows the address space",
            ))
        })?;

        let map = MmapOptions::new().len(reserved).map_anon().map_err(fail)?;
        if protection != Protection::ReadWrite {
            // SAFETY: the mapping was just created and nothing else refers to it.
            unsafe { os::protect(map.as_ptr(), reserved, protection) }.map_err(fail)?;
        }

        let region = ExecutableRegion {
            id: RegionId::next(),
            owner: self.id,
            name,
            map,
            size,
            protection,
            state: RegionState::Allocated,
        };
        debug!(id = %region.id, name = ?region.name, size, reserved, %protection, "allocated region");
        Ok(region)
    }

    pub fn set_protection(&self, region: &mut ExecutableRegion, protection: Protection) -> Result<()> {
        // SAFETY: the region owns the whole mapping and `&mut` rules out live handles into it.
        unsafe { os::protect(region.map.as_ptr(), region.map.len(), protection) }
            .map_err(|source| Error::Protection { protection, source })?;
        debug!(id = %region.id, from = %region.protection, to = %protection, "changed protection");
        region.protection = protection;
        Ok(())
    }

    /// Unmaps `region` now and returns its id.
    ///
    /// The region is moved in, so nothing can write to or bind it afterwards:
    ///
    /// ```compile_fail
    /// use engine::{loader, CodeBuffer, Protection, RegionAllocator};
    ///
    /// let allocator = RegionAllocator::default();
    /// let mut region = allocator.allocate(16, Protection::ReadWrite).unwrap();
    /// allocator.release(region).unwrap();
    /// loader::write(&mut region, 0, &CodeBuffer::from([0xc3])).unwrap();
    /// ```
    ///
    /// ```compile_fail
    /// use engine::{loader, CodeBuffer, CodeRegion, Protection, RegionAllocator, Signature, ValueType};
    ///
    /// let allocator = RegionAllocator::default();
    /// let code = CodeBuffer::from([0xc3]);
    /// let region = loader::load(&allocator, &code, Protection::ExecuteRead).unwrap();
    /// allocator.release(region).unwrap();
    /// let handle = region.bind(Signature::c([], ValueType::Void));
    /// ```
    ///
    /// Only the id survives:
    ///
    /// ```
    /// use engine::{Protection, RegionAllocator};
    ///
    /// let allocator = RegionAllocator::default();
    /// let region = allocator.allocate(16, Protection::ReadWrite).unwrap();
    /// let id = region.id();
    /// assert_eq!(allocator.release(region).unwrap(), id);
    /// ```
    pub fn release(&self, region: ExecutableRegion) -> Result<RegionId> {
        if region.owner != self.id {
            return Err(ReleaseError::new(region).into());
        }
        let id = region.id;
        drop(region);
        debug!(id = %id, "released region");
        Ok(id)
    }
}

impl Default for RegionAllocator {
    fn default() -> Self {
        Self::new(Process::current())
    }
}

#[test]
fn test_allocate_reports_logical_size() {
    let allocator = RegionAllocator::default();
    let region = allocator.allocate(11, Protection::ReadWrite).unwrap();
    assert_eq!(region.size(), 11);
    assert_eq!(region.reserved(), os::page_size());
    assert_eq!(region.state(), RegionState::Allocated);
    assert_eq!(region.read(0, 11).unwrap(), &[0; 11]);
    allocator.release(region).unwrap();
}

#[test]
fn test_allocate_zero_bytes_fails() {
    let allocator = RegionAllocator::default();
    let err = allocator.allocate(0, Protection::ExecuteReadWrite).unwrap_err();
    assert!(matches!(err, Error::Allocation { size: 0, .. }));
}

#[test]
fn test_allocate_in_other_process_fails() {
    let allocator = RegionAllocator::new(Process::with_pid(std::process::id().wrapping_add(1)));
    let err = allocator.allocate(16, Protection::ReadWrite).unwrap_err();
    match err {
        Error::Allocation { source, .. } => assert_eq!(source.kind(), io::ErrorKind::Unsupported),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_named_region() {
    let allocator = RegionAllocator::default();
    let region = allocator
        .allocate_with(RegionRequest::new(8, Protection::Read).name("Example1"))
        .unwrap();
    assert_eq!(region.name(), Some("Example1"));
    assert!(format!("{region:?}").contains("Example1"));
}

#[test]
fn test_no_access_region_cannot_be_read() {
    let allocator = RegionAllocator::default();
    let region = allocator.allocate(8, Protection::NoAccess).unwrap();
    assert!(matches!(region.read(0, 1), Err(Error::Protection { .. })));
}

#[test]
fn test_set_protection() {
    let allocator = RegionAllocator::default();
    let mut region = allocator.allocate(8, Protection::ReadWrite).unwrap();
    allocator
        .set_protection(&mut region, Protection::ExecuteRead)
        .unwrap();
    assert_eq!(region.protection(), Protection::ExecuteRead);
    allocator
        .set_protection(&mut region, Protection::NoAccess)
        .unwrap();
    assert_eq!(region.protection(), Protection::NoAccess);
}

#[test]
fn test_release_through_foreign_allocator_hands_region_back() {
    let owner = RegionAllocator::default();
    let stranger = RegionAllocator::default();
    let region = owner.allocate(8, Protection::ReadWrite).unwrap();
    let id = region.id();

    let err = match stranger.release(region) {
        Err(Error::Release(err)) => err,
        other => panic!("unexpected result: {other:?}"),
    };
    assert_eq!(err.id, id);
    let region = err.into_region();
    assert_eq!(owner.release(region).unwrap(), id);
}

#[test]
fn test_region_ids_are_unique() {
    let allocator = RegionAllocator::default();
    let a = allocator.allocate(1, Protection::ReadWrite).unwrap();
    let b = allocator.allocate(1, Protection::ReadWrite).unwrap();
    assert_ne!(a.id(), b.id());
    assert_ne!(a.base(), b.base());
}
