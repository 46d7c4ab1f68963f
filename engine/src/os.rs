//! Thin layer over the platform memory API: page size and page protection.

use std::{
    collections::BTreeMap,
    io,
    ops::Range,
    sync::{Mutex, MutexGuard, OnceLock, PoisonError},
};

use crate::Protection;

pub(crate) fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(sys::page_size)
}

pub(crate) fn round_up_to_page(len: usize) -> Option<usize> {
    let page = page_size();
    len.checked_add(page - 1).map(|len| len & !(page - 1))
}

/// Page aligned bounds of every page touched by `[addr, addr + len)`.
fn page_range(addr: *const u8, len: usize) -> io::Result<Range<usize>> {
    let page = page_size();
    let start = addr as usize & !(page - 1);
    let end = (addr as usize)
        .checked_add(len)
        .and_then(round_up_to_page)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "address range overflows"))?;
    Ok(start..end)
}

/// Changes the protection of every page touched by `[addr, addr + len)`.
///
/// # Safety
///
/// The range must lie inside memory the caller owns. Pages are the unit of
/// protection, so everything else sharing those pages is affected too.
pub(crate) unsafe fn protect(addr: *const u8, len: usize, protection: Protection) -> io::Result<()> {
    let pages = page_range(addr, len)?;
    // SAFETY: forwarded from the caller.
    unsafe { sys::protect(pages.start as *mut u8, pages.len(), protection) }
}

/// Start of each page made executable in place, with the number of live
/// buffers on it that still need it executable.
static IN_PLACE: Mutex<BTreeMap<usize, usize>> = Mutex::new(BTreeMap::new());

fn in_place_pages() -> MutexGuard<'static, BTreeMap<usize, usize>> {
    IN_PLACE.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unshare(holders: &mut BTreeMap<usize, usize>, page: usize) {
    if let Some(count) = holders.get_mut(&page) {
        *count -= 1;
        if *count == 0 {
            holders.remove(&page);
        }
    }
}

/// Sets one page to read-write, plus execute while any buffer on it holds it.
unsafe fn apply(holders: &BTreeMap<usize, usize>, page: usize) -> io::Result<()> {
    let protection = if holders.contains_key(&page) {
        Protection::ExecuteReadWrite
    } else {
        Protection::ReadWrite
    };
    // SAFETY: the page belongs to a buffer borrowed by a live in-place region.
    unsafe { sys::protect(page as *mut u8, page_size(), protection) }
}

/// Protects the pages under a caller owned buffer, which must stay writable.
///
/// Pages shared with other in-place buffers keep execute for as long as one
/// of them needs it, so `protection` is only a lower bound for each page.
///
/// # Safety
///
/// Same as [`protect`]. Every successful call must be paired with one
/// [`unprotect_in_place`] for the same range and protection.
pub(crate) unsafe fn protect_in_place(addr: *const u8, len: usize, protection: Protection) -> io::Result<()> {
    let range = page_range(addr, len)?;
    let executable = protection.is_executable();
    let mut holders = in_place_pages();
    for (done, page) in range.clone().step_by(page_size()).enumerate() {
        if executable {
            *holders.entry(page).or_insert(0) += 1;
        }
        // SAFETY: forwarded from the caller.
        if let Err(err) = unsafe { apply(&holders, page) } {
            for page in range.step_by(page_size()).take(done + 1) {
                if executable {
                    unshare(&mut holders, page);
                }
                // SAFETY: as above.
                let _ = unsafe { apply(&holders, page) };
            }
            return Err(err);
        }
    }
    Ok(())
}

/// Undoes [`protect_in_place`]. A page only loses execute once no other
/// in-place buffer on it needs it.
///
/// # Safety
///
/// Same as [`protect`], for a range previously passed to [`protect_in_place`].
pub(crate) unsafe fn unprotect_in_place(addr: *const u8, len: usize, protection: Protection) -> io::Result<()> {
    let range = page_range(addr, len)?;
    let mut holders = in_place_pages();
    let mut result = Ok(());
    for page in range.step_by(page_size()) {
        if protection.is_executable() {
            unshare(&mut holders, page);
        }
        // SAFETY: forwarded from the caller.
        if let Err(err) = unsafe { apply(&holders, page) } {
            if result.is_ok() {
                result = Err(err);
            }
        }
    }
    result
}

#[cfg(test)]
fn in_place_holders(addr: *const u8) -> usize {
    let page = addr as usize & !(page_size() - 1);
    in_place_pages().get(&page).copied().unwrap_or(0)
}

#[cfg(unix)]
mod sys {
    use std::io;

    use crate::Protection;

    pub(super) fn page_size() -> usize {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    }

    fn flags(protection: Protection) -> libc::c_int {
        match protection {
            Protection::NoAccess => libc::PROT_NONE,
            Protection::Read => libc::PROT_READ,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::Execute => libc::PROT_EXEC,
            Protection::ExecuteRead => libc::PROT_READ | libc::PROT_EXEC,
            Protection::ExecuteReadWrite => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        }
    }

    pub(super) unsafe fn protect(addr: *mut u8, len: usize, protection: Protection) -> io::Result<()> {
        // SAFETY: addr is page aligned and the range is owned by the caller.
        if unsafe { libc::mprotect(addr.cast(), len, flags(protection)) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(windows)]
mod sys {
    use std::io;

    use windows::Win32::System::{
        Memory::{
            VirtualProtect, PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_NOACCESS,
            PAGE_PROTECTION_FLAGS, PAGE_READONLY, PAGE_READWRITE,
        },
        SystemInformation::{GetSystemInfo, SYSTEM_INFO},
    };

    use crate::Protection;

    pub(super) fn page_size() -> usize {
        let mut info = SYSTEM_INFO::default();
        // SAFETY: info is a valid out pointer.
        unsafe { GetSystemInfo(&mut info) };
        info.dwPageSize as usize
    }

    fn flags(protection: Protection) -> PAGE_PROTECTION_FLAGS {
        match protection {
            Protection::NoAccess => PAGE_NOACCESS,
            Protection::Read => PAGE_READONLY,
            Protection::ReadWrite => PAGE_READWRITE,
            Protection::Execute => PAGE_EXECUTE,
            Protection::ExecuteRead => PAGE_EXECUTE_READ,
            Protection::ExecuteReadWrite => PAGE_EXECUTE_READWRITE,
        }
    }

    pub(super) unsafe fn protect(addr: *mut u8, len: usize, protection: Protection) -> io::Result<()> {
        let mut old = PAGE_PROTECTION_FLAGS::default();
        // SAFETY: the range is owned by the caller.
        unsafe { VirtualProtect(addr.cast(), len, flags(protection), &mut old) }
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
    }
}

#[test]
fn test_shared_page_stays_executable_until_last_holder() {
    let map = memmap2::MmapOptions::new().len(page_size()).map_anon().unwrap();
    let first = map.as_ptr();
    let second = first.wrapping_add(64);
    unsafe {
        protect_in_place(first, 16, Protection::ExecuteReadWrite).unwrap();
        protect_in_place(second, 16, Protection::ExecuteReadWrite).unwrap();
        protect_in_place(second, 16, Protection::ReadWrite).unwrap();
    }
    assert_eq!(in_place_holders(first), 2);

    unsafe { unprotect_in_place(first, 16, Protection::ExecuteReadWrite) }.unwrap();
    assert_eq!(in_place_holders(second), 1);
    unsafe { unprotect_in_place(second, 16, Protection::ReadWrite) }.unwrap();
    assert_eq!(in_place_holders(second), 1);
    unsafe { unprotect_in_place(second, 16, Protection::ExecuteReadWrite) }.unwrap();
    assert_eq!(in_place_holders(first), 0);
}

#[test]
fn test_page_size_is_power_of_two() {
    assert!(page_size().is_power_of_two());
    assert_eq!(round_up_to_page(1), Some(page_size()));
    assert_eq!(round_up_to_page(page_size()), Some(page_size()));
    assert_eq!(round_up_to_page(usize::MAX), None);
}
