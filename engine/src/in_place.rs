use tracing::{debug, warn};

use crate::{os, CodeRegion, Error, Protection, RegionState, Result};

/// Caller owned bytes made executable where they are, without copying them
/// into an allocated region.
///
/// Protection is changed for every page the buffer touches, including any
/// unrelated data that shares those pages, so only flags that keep the pages
/// writable are accepted. The pages go back to read-write when this value is
/// dropped, except for pages another live `InPlaceRegion` still needs
/// executable. The exclusive borrow pins the buffer in place for as long as
/// code in it can be called.
#[derive(Debug)]
pub struct InPlaceRegion<'a> {
    code: &'a mut [u8],
    protection: Protection,
    restored: bool,
}

impl<'a> InPlaceRegion<'a> {
    pub fn protect(code: &'a mut [u8], protection: Protection) -> Result<Self> {
        if !protection.is_writable() {
            return Err(Error::denied(
                protection,
                "in-place protection must keep the surrounding pages writable",
            ));
        }
        if code.is_empty() {
            return Err(Error::denied(protection, "cannot protect an empty buffer"));
        }
        // SAFETY: the buffer is borrowed exclusively and stays writable.
        unsafe { os::protect_in_place(code.as_ptr(), code.len(), protection) }
            .map_err(|source| Error::Protection { protection, source })?;
        debug!(addr = ?code.as_ptr(), len = code.len(), %protection, "protected buffer in place");
        Ok(Self {
            code,
            protection,
            restored: false,
        })
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Puts the pages back to read-write now instead of on drop, reporting failure.
    pub fn restore(mut self) -> Result<()> {
        self.restore_pages()
    }

    fn restore_pages(&mut self) -> Result<()> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;
        // SAFETY: same range as in `protect`, still exclusively borrowed.
        unsafe { os::unprotect_in_place(self.code.as_ptr(), self.code.len(), self.protection) }.map_err(
            |source| Error::Protection {
                protection: Protection::ReadWrite,
                source,
            },
        )?;
        debug!(addr = ?self.code.as_ptr(), "restored buffer protection");
        Ok(())
    }
}

impl Drop for InPlaceRegion<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.restore_pages() {
            warn!(%err, "buffer left with {} protection", self.protection);
        }
    }
}

impl CodeRegion for InPlaceRegion<'_> {
    fn entry(&self) -> *const u8 {
        self.code.as_ptr()
    }

    fn protection(&self) -> Protection {
        if self.restored {
            Protection::ReadWrite
        } else {
            self.protection
        }
    }

    // The caller filled the buffer before handing it over.
    fn state(&self) -> RegionState {
        RegionState::Written
    }
}

#[test]
fn test_read_only_flags_are_rejected() {
    let mut code = vec![0xc3];
    for protection in [Protection::NoAccess, Protection::Read, Protection::ExecuteRead, Protection::Execute] {
        let err = InPlaceRegion::protect(&mut code, protection).unwrap_err();
        assert!(matches!(err, Error::Protection { .. }));
    }
}

#[test]
fn test_empty_buffer_is_rejected() {
    let err = InPlaceRegion::protect(&mut [], Protection::ExecuteReadWrite).unwrap_err();
    assert!(matches!(err, Error::Protection { .. }));
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[test]
fn test_invoke_in_place() {
    use crate::{samples, Signature, Value, ValueType};

    let mut code = samples::add_i32().to_vec();
    let region = InPlaceRegion::protect(&mut code, Protection::ExecuteReadWrite).unwrap();
    let handle = region.bind(Signature::c([ValueType::I32, ValueType::I32], ValueType::I32));
    let result = unsafe { handle.invoke(&[Value::I32(10), Value::I32(-15)]) }.unwrap();
    assert_eq!(result, Value::I32(-5));
    region.restore().unwrap();
    code[0] = 0x90;
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[test]
fn test_restore_keeps_shared_page_executable() {
    use crate::{samples, Signature, Value, ValueType};

    let add = samples::add_i32();
    let mut buffer = vec![0xcc; 2 * add.len()];
    let (first, second) = buffer.split_at_mut(add.len());
    first.copy_from_slice(&add);
    second.copy_from_slice(&add);

    let first = InPlaceRegion::protect(first, Protection::ExecuteReadWrite).unwrap();
    let second = InPlaceRegion::protect(second, Protection::ExecuteReadWrite).unwrap();
    first.restore().unwrap();

    let handle = second.bind(Signature::c([ValueType::I32, ValueType::I32], ValueType::I32));
    let result = unsafe { handle.invoke(&[Value::I32(1), Value::I32(2)]) }.unwrap();
    assert_eq!(result, Value::I32(3));
    second.restore().unwrap();
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[test]
#[should_panic(expected = "rw- protection")]
fn test_invoke_in_place_without_execute_panics() {
    use crate::{samples, Signature, ValueType};

    let mut code = samples::return_constant(3).to_vec();
    let region = InPlaceRegion::protect(&mut code, Protection::ReadWrite).unwrap();
    let handle = region.bind(Signature::c([], ValueType::I32));
    let _ = unsafe { handle.invoke(&[]) };
}
