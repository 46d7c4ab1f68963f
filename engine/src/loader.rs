use tracing::{debug, trace};

use crate::{CodeBuffer, Error, ExecutableRegion, Protection, RegionAllocator, RegionRequest, Result};

/// Copies `code` into `region` starting at `offset`.
///
/// The region only counts as written once a write covers its entry byte.
pub fn write(region: &mut ExecutableRegion, offset: usize, code: &CodeBuffer) -> Result<()> {
    let end = region.checked_end(offset, code.len())?;
    if !region.protection().is_writable() {
        return Err(Error::denied(region.protection(), "region is not writable"));
    }
    region.bytes_mut()[offset..end].copy_from_slice(code);
    if offset == 0 && !code.is_empty() {
        region.mark_written();
    }
    trace!(id = %region.id(), offset, len = code.len(), "wrote code");
    Ok(())
}

/// Allocates a region that fits `code` exactly, writes it at offset 0 while
/// the region is still read-write and then switches it to `protection`.
pub fn load(allocator: &RegionAllocator, code: &CodeBuffer, protection: Protection) -> Result<ExecutableRegion> {
    load_with(allocator, RegionRequest::new(code.len(), Protection::ReadWrite), code, protection)
}

pub fn load_named(
    allocator: &RegionAllocator,
    name: &str,
    code: &CodeBuffer,
    protection: Protection,
) -> Result<ExecutableRegion> {
    load_with(
        allocator,
        RegionRequest::new(code.len(), Protection::ReadWrite).name(name),
        code,
        protection,
    )
}

fn load_with(
    allocator: &RegionAllocator,
    request: RegionRequest,
    code: &CodeBuffer,
    protection: Protection,
) -> Result<ExecutableRegion> {
    let mut region = allocator.allocate_with(request)?;
    write(&mut region, 0, code)?;
    if protection != Protection::ReadWrite {
        allocator.set_protection(&mut region, protection)?;
    }
    debug!(id = %region.id(), len = code.len(), %protection, "loaded code");
    Ok(region)
}

#[cfg(test)]
use proptest::prelude::*;

#[test]
fn test_write_then_read_back() {
    let allocator = RegionAllocator::default();
    let mut region = allocator.allocate(16, Protection::ReadWrite).unwrap();
    let code = CodeBuffer::from([0x55, 0x8b, 0x45, 0x08, 0xc3]);
    write(&mut region, 3, &code).unwrap();
    assert_eq!(region.read(3, code.len()).unwrap(), code.as_bytes());
    assert_eq!(region.read(0, 3).unwrap(), &[0, 0, 0]);
}

#[test]
fn test_only_entry_writes_mark_written() {
    let allocator = RegionAllocator::default();
    let mut region = allocator.allocate(16, Protection::ReadWrite).unwrap();
    write(&mut region, 0, &CodeBuffer::from(Vec::<u8>::new())).unwrap();
    assert_eq!(region.state(), crate::RegionState::Allocated);
    write(&mut region, 4, &CodeBuffer::from([0xc3])).unwrap();
    assert_eq!(region.state(), crate::RegionState::Allocated);
    write(&mut region, 0, &CodeBuffer::from([0x90])).unwrap();
    assert_eq!(region.state(), crate::RegionState::Written);
}

#[test]
fn test_write_into_read_only_region_fails() {
    let allocator = RegionAllocator::default();
    let mut region = allocator.allocate(16, Protection::ExecuteRead).unwrap();
    let err = write(&mut region, 0, &CodeBuffer::from([0xc3])).unwrap_err();
    assert!(matches!(
        err,
        Error::Protection {
            protection: Protection::ExecuteRead,
            ..
        }
    ));
    assert_eq!(region.state(), crate::RegionState::Allocated);
}

#[test]
fn test_write_offset_overflow_is_out_of_bounds() {
    let allocator = RegionAllocator::default();
    let mut region = allocator.allocate(4, Protection::ReadWrite).unwrap();
    let err = write(&mut region, usize::MAX, &CodeBuffer::from([0xc3])).unwrap_err();
    assert!(matches!(err, Error::OutOfBounds { size: 4, .. }));
}

#[test]
fn test_load_flips_to_requested_protection() {
    let allocator = RegionAllocator::default();
    let code = CodeBuffer::from([0x90, 0xc3]);
    let region = load_named(&allocator, "nop", &code, Protection::ExecuteRead).unwrap();
    assert_eq!(region.protection(), Protection::ExecuteRead);
    assert_eq!(region.size(), 2);
    assert_eq!(region.name(), Some("nop"));
    assert_eq!(region.read(0, 2).unwrap(), &[0x90, 0xc3]);
}

#[test]
fn test_load_empty_code_fails() {
    let allocator = RegionAllocator::default();
    let err = load(&allocator, &CodeBuffer::from(Vec::<u8>::new()), Protection::ExecuteRead).unwrap_err();
    assert!(matches!(err, Error::Allocation { .. }));
}

#[cfg(test)]
proptest! {
    #[test]
    fn test_write_bounds(size in 1usize..64, offset in 0usize..96, len in 0usize..96) {
        let allocator = RegionAllocator::default();
        let mut region = allocator.allocate(size, Protection::ReadWrite).unwrap();
        let code = CodeBuffer::from(vec![0xcc; len]);
        let result = write(&mut region, offset, &code);
        if offset + len > size {
            let is_out_of_bounds = matches!(result, Err(Error::OutOfBounds { .. }));
            prop_assert!(is_out_of_bounds);
        } else {
            prop_assert!(result.is_ok());
            prop_assert_eq!(region.read(offset, len).unwrap(), code.as_bytes());
        }
    }
}
