//! Runs machine code from byte buffers inside the current process.
//!
//! Code is copied into an [`ExecutableRegion`] handed out by a
//! [`RegionAllocator`], bound to a [`Signature`] and called through a
//! [`CallableHandle`]. [`InPlaceRegion`] does the same for a buffer the caller
//! already owns, and [`Assembler`] turns text into a [`CodeBuffer`].

pub mod asm;
mod code;
mod error;
mod in_place;
mod invoke;
pub mod loader;
mod os;
mod protection;
mod region;
pub mod samples;

pub use asm::{Assembler, Bitness};
pub use code::CodeBuffer;
pub use error::{Error, ReleaseError, Result};
pub use in_place::InPlaceRegion;
pub use invoke::{CallConv, CallableHandle, CodeRegion, Signature, Value, ValueType, MAX_PARAMS};
pub use protection::Protection;
pub use region::{ExecutableRegion, Process, RegionAllocator, RegionId, RegionRequest, RegionState};

#[cfg(all(test, any(target_arch = "x86", target_arch = "x86_64")))]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_assemble_load_invoke_release() {
        let mut asm = Assembler::default();
        asm.add_line_with("mov eax, {0}", &[42]).unwrap().add_line("ret");
        let code = asm.assemble().unwrap();

        let allocator = RegionAllocator::default();
        let region = loader::load_named(&allocator, "answer", &code, Protection::ExecuteRead).unwrap();
        let value = unsafe { region.bind(Signature::c([], ValueType::I32)).invoke(&[]) }.unwrap();
        assert_eq!(value, Value::I32(42));

        let id = region.id();
        assert_eq!(allocator.release(region).unwrap(), id);
    }

    #[test]
    fn test_regions_on_many_threads() {
        let allocator = RegionAllocator::default();
        let results = thread::scope(|scope| {
            let handles = (0..8)
                .map(|k| {
                    let allocator = &allocator;
                    scope.spawn(move || {
                        let code = samples::return_constant(k * 1000 + 7);
                        let region = loader::load(allocator, &code, Protection::ExecuteRead).unwrap();
                        let handle = region.bind(Signature::c([], ValueType::I32));
                        (0..100)
                            .map(|_| unsafe { handle.invoke(&[]) }.unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect::<Vec<_>>()
        });
        for (k, values) in results.into_iter().enumerate() {
            let expected = Value::I32(k as i32 * 1000 + 7);
            assert!(values.iter().all(|value| *value == expected));
        }
    }

    #[test]
    fn test_handles_shared_across_threads() {
        let allocator = RegionAllocator::default();
        let region = loader::load(&allocator, &samples::add_i32(), Protection::ExecuteRead).unwrap();
        let handle = region.bind(Signature::c([ValueType::I32, ValueType::I32], ValueType::I32));
        thread::scope(|scope| {
            for x in 0..4 {
                let handle = handle.clone();
                scope.spawn(move || {
                    let sum = unsafe { handle.invoke(&[Value::I32(x), Value::I32(x)]) }.unwrap();
                    assert_eq!(sum, Value::I32(2 * x));
                });
            }
        });
    }

    #[test]
    fn test_rewrite_after_flipping_back_to_writable() {
        let allocator = RegionAllocator::default();
        let mut region = loader::load(&allocator, &samples::return_constant(1), Protection::ExecuteRead).unwrap();
        let signature = Signature::c([], ValueType::I32);
        assert_eq!(unsafe { region.bind(signature.clone()).invoke(&[]) }.unwrap(), Value::I32(1));

        allocator.set_protection(&mut region, Protection::ReadWrite).unwrap();
        loader::write(&mut region, 0, &samples::return_constant(2)).unwrap();
        allocator.set_protection(&mut region, Protection::ExecuteRead).unwrap();
        assert_eq!(unsafe { region.bind(signature).invoke(&[]) }.unwrap(), Value::I32(2));
    }
}
