//! The five walkthroughs: the same few routines reached through the assembler,
//! through hand written bytes and through a buffer made executable in place.

use std::fmt;

use anyhow::Context;
use engine::{
    loader, samples, Assembler, Bitness, CodeBuffer, CodeRegion, InPlaceRegion, Protection, RegionAllocator,
    Signature, Value, ValueType,
};
use tracing::info;

pub struct Outcome {
    pub label: &'static str,
    pub value: Value,
    pub expected: Option<Value>,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} return value: {}", self.label, self.value)?;
        if let Some(expected) = self.expected {
            write!(f, ", expected: {expected}")?;
        }
        Ok(())
    }
}

pub fn run(n: u8, protection: Protection) -> anyhow::Result<Outcome> {
    let allocator = RegionAllocator::default();
    match n {
        1 => constant(&allocator, protection),
        2 => return_address(&allocator, protection),
        3 => assembled_add(&allocator, protection),
        4 => raw_add(&allocator, protection),
        5 => in_place_add(),
        _ => anyhow::bail!("there is no Example{n}"),
    }
}

fn add_signature() -> Signature {
    Signature::c([ValueType::I32, ValueType::I32], ValueType::I32)
}

fn mode_line() -> &'static str {
    match Bitness::host() {
        Bitness::X86 => "use32",
        Bitness::X64 => "use64",
    }
}

/// Loads `code` into a fresh named region, calls it once and releases it.
fn call_once(
    allocator: &RegionAllocator,
    name: &str,
    code: &CodeBuffer,
    protection: Protection,
    signature: Signature,
    args: &[Value],
) -> anyhow::Result<Value> {
    let region = loader::load_named(allocator, name, code, protection)
        .with_context(|| format!("failed to load {name}"))?;
    // SAFETY: every caller passes code built for the host ABI and `signature`.
    let value = unsafe { region.bind(signature).invoke(args) }?;
    let id = allocator.release(region)?;
    info!(%id, name, %value, "called region");
    Ok(value)
}

fn constant(allocator: &RegionAllocator, protection: Protection) -> anyhow::Result<Outcome> {
    const VALUE: i32 = 1;
    let mut asm = Assembler::default();
    asm.add_line(mode_line())
        .add_line_with("mov eax, {0}", &[VALUE.into()])?
        .add_line("ret");
    let code = asm.assemble()?;
    let value = call_once(allocator, "Example1", &code, protection, Signature::c([], ValueType::I32), &[])?;
    Ok(Outcome {
        label: "Example1",
        value,
        expected: Some(Value::I32(VALUE)),
    })
}

fn return_address(allocator: &RegionAllocator, protection: Protection) -> anyhow::Result<Outcome> {
    let mut asm = Assembler::default();
    asm.add_line(mode_line());
    match Bitness::host() {
        Bitness::X86 => asm.add_line("mov eax, [esp]"),
        Bitness::X64 => asm.add_line("mov rax, [rsp]"),
    };
    asm.add_line("ret");
    let code = asm.assemble()?;
    let value = call_once(allocator, "Example2", &code, protection, Signature::c([], ValueType::Ptr), &[])?;
    Ok(Outcome {
        label: "Example2",
        value,
        expected: None,
    })
}

fn assembled_add(allocator: &RegionAllocator, protection: Protection) -> anyhow::Result<Outcome> {
    let mut asm = Assembler::default();
    asm.add_line(mode_line());
    if cfg!(target_arch = "x86") {
        asm.add_line("push ebp")
            .add_line("mov ebp, esp")
            .add_line("mov eax, [ebp+8]")
            .add_line("mov edx, [ebp+12]")
            .add_line("add eax, edx")
            .add_line("pop ebp");
    } else if cfg!(windows) {
        asm.add_line("mov eax, ecx").add_line("add eax, edx");
    } else {
        asm.add_line("mov eax, edi").add_line("add eax, esi");
    }
    asm.add_line("ret");
    let code = asm.assemble()?;
    let args = [Value::I32(10), Value::I32(-15)];
    let value = call_once(allocator, "Example3", &code, protection, add_signature(), &args)?;
    Ok(Outcome {
        label: "Example3",
        value,
        expected: Some(Value::I32(-5)),
    })
}

fn raw_add(allocator: &RegionAllocator, protection: Protection) -> anyhow::Result<Outcome> {
    let value = call_once(
        allocator,
        "Example4",
        &samples::add_i32(),
        protection,
        add_signature(),
        &[Value::I32(10), Value::I32(-15)],
    )?;
    Ok(Outcome {
        label: "Example4 (raw bytes)",
        value,
        expected: Some(Value::I32(-5)),
    })
}

// The pages around the buffer have to stay writable, so this one always runs rwx.
fn in_place_add() -> anyhow::Result<Outcome> {
    let mut code = samples::add_i32().to_vec();
    let region = InPlaceRegion::protect(&mut code, Protection::ExecuteReadWrite)
        .context("failed to make the buffer executable")?;
    // SAFETY: host ABI add routine matching `add_signature`.
    let value = unsafe { region.bind(add_signature()).invoke(&[Value::I32(10), Value::I32(-15)]) }?;
    region.restore()?;
    Ok(Outcome {
        label: "Example5 (in place)",
        value,
        expected: Some(Value::I32(-5)),
    })
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[test]
fn test_walkthroughs_return_expected_values() {
    for protection in [Protection::ExecuteRead, Protection::ExecuteReadWrite] {
        for n in 1..=5 {
            let outcome = run(n, protection).unwrap();
            match outcome.expected {
                Some(expected) => assert_eq!(outcome.value, expected, "{}", outcome.label),
                None => assert!(matches!(outcome.value, Value::Ptr(addr) if addr != 0)),
            }
        }
    }
}

#[test]
fn test_unknown_walkthrough() {
    assert!(run(0, Protection::ExecuteRead).is_err());
}

#[test]
fn test_outcome_display() {
    let outcome = Outcome {
        label: "Example3",
        value: Value::I32(-5),
        expected: Some(Value::I32(-5)),
    };
    assert_eq!(outcome.to_string(), "Example3 return value: -5, expected: -5");
}
