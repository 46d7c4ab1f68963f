use std::{fs, path::Path};

use anyhow::{ensure, Context};
use engine::{loader, CodeBuffer, CodeRegion, Protection, RegionAllocator, Signature, Value, ValueType, MAX_PARAMS};
use tracing::debug;

/// Integers as wide as a general purpose register on the host.
fn native_int() -> ValueType {
    if cfg!(target_pointer_width = "64") {
        ValueType::I64
    } else {
        ValueType::I32
    }
}

fn native_value(arg: i64) -> anyhow::Result<Value> {
    Ok(match native_int() {
        ValueType::I64 => Value::I64(arg),
        _ => Value::I32(i32::try_from(arg).with_context(|| format!("argument {arg} does not fit in 32 bits"))?),
    })
}

/// Loads the file as machine code and calls byte 0 with `args`.
pub fn run_file(path: &Path, args: &[i64], protection: Protection) -> anyhow::Result<Value> {
    ensure!(args.len() <= MAX_PARAMS, "at most {MAX_PARAMS} arguments are supported");
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    ensure!(!bytes.is_empty(), "{} is empty", path.display());
    debug!(path = %path.display(), len = bytes.len(), "read code");

    let args = args.iter().map(|&arg| native_value(arg)).collect::<anyhow::Result<Vec<_>>>()?;
    let signature = Signature::c(args.iter().map(|arg| arg.ty()), native_int());
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let allocator = RegionAllocator::default();
    let region = loader::load_named(&allocator, &name, &CodeBuffer::from(bytes), protection)
        .with_context(|| format!("failed to load {}", path.display()))?;
    // SAFETY: whoever runs the binary vouches for the file.
    let value = unsafe { region.bind(signature).invoke(&args) }?;
    allocator.release(region)?;
    Ok(value)
}

#[cfg(test)]
use std::io::Write;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[test]
fn test_run_constant_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&engine::samples::return_constant(7)).unwrap();
    let value = run_file(file.path(), &[], Protection::ExecuteRead).unwrap();
    assert_eq!(value.to_string(), "7");
}

#[cfg(target_arch = "x86_64")]
#[test]
fn test_run_add_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("add.bin");
    fs::write(&path, engine::samples::add_i64().as_bytes()).unwrap();
    for protection in [Protection::ExecuteRead, Protection::ExecuteReadWrite] {
        let value = run_file(&path, &[10, -15], protection).unwrap();
        assert_eq!(value, Value::I64(-5));
    }
}

#[test]
fn test_run_missing_or_empty_file() {
    let dir = tempfile::tempdir().unwrap();
    assert!(run_file(&dir.path().join("missing.bin"), &[], Protection::ExecuteRead).is_err());

    let empty = tempfile::NamedTempFile::new().unwrap();
    let err = run_file(empty.path(), &[], Protection::ExecuteRead).unwrap_err();
    assert!(err.to_string().contains("is empty"));
}

#[test]
fn test_run_too_many_arguments() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let args = [0; MAX_PARAMS + 1];
    assert!(run_file(file.path(), &args, Protection::ExecuteRead).is_err());
}
