use std::{fmt, mem};

use tracing::trace;

use crate::{Error, Protection, RegionState, Result};

/// Most integer arguments every supported calling convention passes in registers.
pub const MAX_PARAMS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallConv {
    /// `extern "C"`: arguments right to left, caller cleans the stack.
    C,
    /// `extern "system"`: stdcall on 32-bit Windows, C everywhere else.
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Void,
    I32,
    I64,
    Ptr,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Void => write!(f, "()"),
            ValueType::I32 => write!(f, "i32"),
            ValueType::I64 => write!(f, "i64"),
            ValueType::Ptr => write!(f, "usize"),
        }
    }
}

impl ValueType {
    fn from_raw(self, raw: isize) -> Value {
        match self {
            ValueType::Void => Value::Unit,
            ValueType::I32 => Value::I32(raw as i32),
            ValueType::I64 => Value::I64(raw as i64),
            ValueType::Ptr => Value::Ptr(raw as usize),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    Unit,
    I32(i32),
    I64(i64),
    Ptr(usize),
}

impl Value {
    pub fn ty(self) -> ValueType {
        match self {
            Value::Unit => ValueType::Void,
            Value::I32(_) => ValueType::I32,
            Value::I64(_) => ValueType::I64,
            Value::Ptr(_) => ValueType::Ptr,
        }
    }

    // Widened to the width of a register or stack slot.
    fn to_raw(self) -> isize {
        match self {
            Value::Unit => 0,
            Value::I32(v) => v as isize,
            Value::I64(v) => v as isize,
            Value::Ptr(v) => v as isize,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => write!(f, "()"),
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::Ptr(v) => write!(f, "{v:#x}"),
        }
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::I32(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::I64(value)
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::Ptr(value)
    }
}

/// Shape of a native function: how to call it and what goes in and out.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    conv: CallConv,
    params: Vec<ValueType>,
    ret: ValueType,
}

impl Signature {
    pub fn new(conv: CallConv, params: impl IntoIterator<Item = ValueType>, ret: ValueType) -> Self {
        Self {
            conv,
            params: params.into_iter().collect(),
            ret,
        }
    }

    pub fn c(params: impl IntoIterator<Item = ValueType>, ret: ValueType) -> Self {
        Self::new(CallConv::C, params, ret)
    }

    pub fn conv(&self) -> CallConv {
        self.conv
    }

    pub fn params(&self) -> &[ValueType] {
        &self.params
    }

    pub fn ret(&self) -> ValueType {
        self.ret
    }

    fn check(&self, args: &[Value]) -> Result<()> {
        let unsupported = |reason| Error::UnsupportedSignature {
            signature: self.clone(),
            reason,
        };
        if self.params.len() > MAX_PARAMS {
            return Err(unsupported("too many parameters"));
        }
        if self.params.contains(&ValueType::Void) {
            return Err(unsupported("parameters cannot be void"));
        }
        if cfg!(target_pointer_width = "32")
            && (self.ret == ValueType::I64 || self.params.contains(&ValueType::I64))
        {
            return Err(unsupported("64-bit integers need a 64-bit host"));
        }
        if !args.iter().map(|arg| arg.ty()).eq(self.params.iter().copied()) {
            return Err(Error::SignatureMismatch {
                expected: self.clone(),
                found: args.iter().map(|arg| arg.ty()).collect(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let abi = match self.conv {
            CallConv::C => "C",
            CallConv::System => "system",
        };
        write!(f, "extern \"{abi}\" fn(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{param}")?;
        }
        write!(f, ") -> {}", self.ret)
    }
}

/// Memory that code can be bound to and called from.
pub trait CodeRegion {
    /// Address of byte 0, where execution starts.
    fn entry(&self) -> *const u8;
    fn protection(&self) -> Protection;
    fn state(&self) -> RegionState;

    fn bind(&self, signature: Signature) -> CallableHandle<'_>
    where
        Self: Sized + Sync,
    {
        CallableHandle::bind(self, signature)
    }
}

impl CodeRegion for crate::ExecutableRegion {
    fn entry(&self) -> *const u8 {
        self.base()
    }

    fn protection(&self) -> Protection {
        self.protection()
    }

    fn state(&self) -> RegionState {
        self.state()
    }
}

/// A region's entry point together with the signature to call it with.
///
/// Borrows the region, so it cannot outlive it and the region's protection
/// cannot change underneath it.
///
/// ```
/// use engine::{loader, CodeBuffer, CodeRegion, Protection, RegionAllocator, Signature, ValueType};
///
/// let allocator = RegionAllocator::default();
/// let code = CodeBuffer::from([0xc3]);
/// let region = loader::load(&allocator, &code, Protection::ExecuteRead).unwrap();
/// let handle = region.bind(Signature::c([], ValueType::Void));
/// assert_eq!(handle.signature().ret(), ValueType::Void);
/// ```
///
/// Dropping or releasing the region while a handle is alive is rejected:
///
/// ```compile_fail
/// use engine::{loader, CodeBuffer, CodeRegion, Protection, RegionAllocator, Signature, ValueType};
///
/// let allocator = RegionAllocator::default();
/// let code = CodeBuffer::from([0xc3]);
/// let region = loader::load(&allocator, &code, Protection::ExecuteRead).unwrap();
/// let handle = region.bind(Signature::c([], ValueType::Void));
/// allocator.release(region).unwrap();
/// let _ = unsafe { handle.invoke(&[]) };
/// ```
///
/// and so is changing its protection:
///
/// ```compile_fail
/// use engine::{loader, CodeBuffer, CodeRegion, Protection, RegionAllocator, Signature, ValueType};
///
/// let allocator = RegionAllocator::default();
/// let code = CodeBuffer::from([0xc3]);
/// let mut region = loader::load(&allocator, &code, Protection::ExecuteRead).unwrap();
/// let handle = region.bind(Signature::c([], ValueType::Void));
/// allocator.set_protection(&mut region, Protection::ReadWrite).unwrap();
/// let _ = unsafe { handle.invoke(&[]) };
/// ```
#[derive(Clone)]
pub struct CallableHandle<'r> {
    region: &'r (dyn CodeRegion + Sync),
    signature: Signature,
}

impl fmt::Debug for CallableHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallableHandle")
            .field("entry", &self.region.entry())
            .field("signature", &self.signature)
            .finish()
    }
}

impl<'r> CallableHandle<'r> {
    pub fn bind<R: CodeRegion + Sync>(region: &'r R, signature: Signature) -> Self {
        Self { region, signature }
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Calls the code at the start of the region and returns what it left in
    /// the return register.
    ///
    /// # Panics
    ///
    /// If the region was never written or is not executable. Jumping there
    /// would fault, so nothing is executed.
    ///
    /// # Safety
    ///
    /// The bytes in the region must be a complete function for this handle's
    /// signature on the running CPU. Nothing checks that.
    pub unsafe fn invoke(&self, args: &[Value]) -> Result<Value> {
        let protection = self.region.protection();
        assert!(
            self.region.state() == RegionState::Written,
            "invoked a code region that was never written"
        );
        assert!(
            protection.is_executable(),
            "invoked a code region with {protection} protection"
        );
        self.signature.check(args)?;

        let raw = args.iter().map(|arg| arg.to_raw()).collect::<Vec<_>>();
        let entry = self.region.entry();
        trace!(signature = %self.signature, ?entry, "invoking");
        // SAFETY: the region is written and executable, the arguments match the
        // signature and the caller vouches for the code itself.
        let ret = unsafe { trampoline(self.signature.conv, entry, &raw) };
        Ok(self.signature.ret.from_raw(ret))
    }
}

macro_rules! call {
    ($abi:tt, $entry:expr, $args:expr) => {
        match $args.len() {
            0 => call!(@with $abi, $entry, $args;),
            1 => call!(@with $abi, $entry, $args; 0),
            2 => call!(@with $abi, $entry, $args; 0 1),
            3 => call!(@with $abi, $entry, $args; 0 1 2),
            4 => call!(@with $abi, $entry, $args; 0 1 2 3),
            5 => call!(@with $abi, $entry, $args; 0 1 2 3 4),
            6 => call!(@with $abi, $entry, $args; 0 1 2 3 4 5),
            n => unreachable!("{n} arguments passed the signature check"),
        }
    };
    (@with $abi:tt, $entry:expr, $args:expr; $($i:tt)*) => {{
        let f = mem::transmute::<*const u8, unsafe extern $abi fn($(call!(@slot $i)),*) -> isize>($entry);
        f($($args[$i]),*)
    }};
    (@slot $i:tt) => { isize };
}

unsafe fn trampoline(conv: CallConv, entry: *const u8, args: &[isize]) -> isize {
    match conv {
        CallConv::C => call!("C", entry, args),
        CallConv::System => call!("system", entry, args),
    }
}

#[cfg(all(test, any(target_arch = "x86", target_arch = "x86_64")))]
mod tests {
    use super::*;
    use crate::{loader, samples, CodeBuffer, RegionAllocator};

    fn add_signature() -> Signature {
        Signature::c([ValueType::I32, ValueType::I32], ValueType::I32)
    }

    #[test]
    fn test_invoke_returns_constant() {
        let allocator = RegionAllocator::default();
        let region = loader::load(&allocator, &samples::return_constant(1), Protection::ExecuteRead).unwrap();
        let handle = region.bind(Signature::c([], ValueType::I32));
        assert_eq!(unsafe { handle.invoke(&[]) }.unwrap(), Value::I32(1));
    }

    #[test]
    fn test_invoke_add() {
        let allocator = RegionAllocator::default();
        let region = loader::load(&allocator, &samples::add_i32(), Protection::ExecuteReadWrite).unwrap();
        let handle = CallableHandle::bind(&region, add_signature());
        let result = unsafe { handle.invoke(&[Value::I32(10), Value::I32(-15)]) }.unwrap();
        assert_eq!(result, Value::I32(-5));
    }

    #[test]
    fn test_invoke_void_return() {
        let allocator = RegionAllocator::default();
        let region = loader::load(&allocator, &CodeBuffer::from([0xc3]), Protection::ExecuteRead).unwrap();
        let handle = region.bind(Signature::new(CallConv::System, [], ValueType::Void));
        assert_eq!(unsafe { handle.invoke(&[]) }.unwrap(), Value::Unit);
    }

    #[test]
    fn test_argument_count_mismatch() {
        let allocator = RegionAllocator::default();
        let region = loader::load(&allocator, &samples::add_i32(), Protection::ExecuteRead).unwrap();
        let handle = region.bind(add_signature());
        let err = unsafe { handle.invoke(&[Value::I32(1)]) }.unwrap_err();
        match err {
            Error::SignatureMismatch { found, .. } => assert_eq!(found, [ValueType::I32]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_argument_type_mismatch() {
        let allocator = RegionAllocator::default();
        let region = loader::load(&allocator, &samples::add_i32(), Protection::ExecuteRead).unwrap();
        let handle = region.bind(add_signature());
        let err = unsafe { handle.invoke(&[Value::I32(1), Value::Ptr(2)]) }.unwrap_err();
        assert_eq!(
            err.to_string(),
            "arguments (i32, usize) do not match extern \"C\" fn(i32, i32) -> i32"
        );
    }

    #[test]
    fn test_too_many_parameters() {
        let allocator = RegionAllocator::default();
        let region = loader::load(&allocator, &CodeBuffer::from([0xc3]), Protection::ExecuteRead).unwrap();
        let handle = region.bind(Signature::c(vec![ValueType::Ptr; MAX_PARAMS + 1], ValueType::Void));
        let args = vec![Value::Ptr(0); MAX_PARAMS + 1];
        let err = unsafe { handle.invoke(&args) }.unwrap_err();
        assert!(matches!(err, Error::UnsupportedSignature { .. }));
    }

    #[test]
    #[should_panic(expected = "rw- protection")]
    fn test_invoke_without_execute_panics() {
        let allocator = RegionAllocator::default();
        let region = loader::load(&allocator, &samples::return_constant(7), Protection::ReadWrite).unwrap();
        let handle = region.bind(Signature::c([], ValueType::I32));
        let _ = unsafe { handle.invoke(&[]) };
    }

    #[test]
    #[should_panic(expected = "never written")]
    fn test_invoke_unwritten_panics() {
        let allocator = RegionAllocator::default();
        let region = allocator.allocate(16, Protection::ExecuteReadWrite).unwrap();
        let handle = region.bind(Signature::c([], ValueType::I32));
        let _ = unsafe { handle.invoke(&[]) };
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::I32(-5).to_string(), "-5");
        assert_eq!(Value::Ptr(0x1f).to_string(), "0x1f");
        assert_eq!(Value::Unit.to_string(), "()");
    }

    #[test]
    fn test_signature_display() {
        let signature = Signature::new(CallConv::System, [ValueType::Ptr, ValueType::I64], ValueType::Void);
        assert_eq!(signature.to_string(), "extern \"system\" fn(usize, i64) -> ()");
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_invoke_wide_values() {
        let allocator = RegionAllocator::default();
        let region = loader::load(&allocator, &samples::add_i64(), Protection::ExecuteRead).unwrap();
        let handle = region.bind(Signature::c([ValueType::I64, ValueType::I64], ValueType::I64));
        let result = unsafe { handle.invoke(&[Value::I64(1 << 40), Value::I64(-1)]) }.unwrap();
        assert_eq!(result, Value::I64((1 << 40) - 1));
    }

    proptest::proptest! {
        #[test]
        fn test_add_any_pair(x in proptest::num::i32::ANY, y in proptest::num::i32::ANY) {
            let allocator = RegionAllocator::default();
            let region = loader::load(&allocator, &samples::add_i32(), Protection::ExecuteRead).unwrap();
            let handle = region.bind(add_signature());
            let result = unsafe { handle.invoke(&[x.into(), y.into()]) }.unwrap();
            proptest::prop_assert_eq!(result, Value::I32(x.wrapping_add(y)));
        }

        #[test]
        fn test_constant_any(k in proptest::num::i32::ANY) {
            let allocator = RegionAllocator::default();
            let region = loader::load(&allocator, &samples::return_constant(k), Protection::ExecuteRead).unwrap();
            let handle = region.bind(Signature::c([], ValueType::I32));
            proptest::prop_assert_eq!(unsafe { handle.invoke(&[]) }.unwrap(), Value::I32(k));
        }
    }
}
