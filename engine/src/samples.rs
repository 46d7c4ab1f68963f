//! Hand assembled routines for the host calling convention.

use crate::CodeBuffer;

/// `int add(int x, int y)` for 32-bit cdecl: both arguments are read from the
/// stack through a fresh frame and the sum is left in eax.
pub const CDECL_ADD_X86: [u8; 13] = [
    0x55, //             push ebp
    0x89, 0xe5, //       mov  ebp, esp
    0x8b, 0x45, 0x08, // mov  eax, [ebp+8]
    0x8b, 0x55, 0x0c, // mov  edx, [ebp+12]
    0x01, 0xd0, //       add  eax, edx
    0x5d, //             pop  ebp
    0xc3, //             ret
];

/// `mov eax, k; ret`, the same bytes in 32 and 64-bit mode.
pub fn return_constant(k: i32) -> CodeBuffer {
    let mut code = vec![0xb8];
    code.extend(k.to_le_bytes());
    code.push(0xc3);
    code.into()
}

/// `int add(int x, int y)` for the running target.
pub fn add_i32() -> CodeBuffer {
    if cfg!(target_arch = "x86") {
        CodeBuffer::from(CDECL_ADD_X86)
    } else if cfg!(windows) {
        // mov eax, ecx; add eax, edx; ret
        CodeBuffer::from([0x89, 0xc8, 0x01, 0xd0, 0xc3])
    } else {
        // mov eax, edi; add eax, esi; ret
        CodeBuffer::from([0x89, 0xf8, 0x01, 0xf0, 0xc3])
    }
}

/// `int64_t add(int64_t x, int64_t y)`, x86-64 only.
pub fn add_i64() -> CodeBuffer {
    if cfg!(windows) {
        // lea rax, [rcx+rdx]; ret
        CodeBuffer::from([0x48, 0x8d, 0x04, 0x11, 0xc3])
    } else {
        // lea rax, [rdi+rsi]; ret
        CodeBuffer::from([0x48, 0x8d, 0x04, 0x37, 0xc3])
    }
}

/// Returns the address the call will return to, read from the top of the stack.
pub fn return_address() -> CodeBuffer {
    if cfg!(target_arch = "x86") {
        // mov eax, [esp]; ret
        CodeBuffer::from([0x8b, 0x04, 0x24, 0xc3])
    } else {
        // mov rax, [rsp]; ret
        CodeBuffer::from([0x48, 0x8b, 0x04, 0x24, 0xc3])
    }
}

#[test]
fn test_return_constant_encoding() {
    assert_eq!(
        return_constant(-2).as_bytes(),
        &[0xb8, 0xfe, 0xff, 0xff, 0xff, 0xc3]
    );
}
