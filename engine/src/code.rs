use std::ops::Deref;

/// Already assembled machine code. Execution always starts at byte 0.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CodeBuffer {
    bytes: Box<[u8]>,
}

impl CodeBuffer {
    pub fn new(bytes: impl Into<Box<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Deref for CodeBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl From<Vec<u8>> for CodeBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&[u8]> for CodeBuffer {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes)
    }
}

impl<const N: usize> From<[u8; N]> for CodeBuffer {
    fn from(bytes: [u8; N]) -> Self {
        Self::new(bytes.to_vec())
    }
}

#[test]
fn test_code_buffer_keeps_bytes() {
    let code = CodeBuffer::from([0xb8, 0x01, 0x00, 0x00, 0x00, 0xc3]);
    assert_eq!(code.len(), 6);
    assert_eq!(code[0], 0xb8);
    assert_eq!(code.as_bytes().last(), Some(&0xc3));
    assert!(CodeBuffer::from(Vec::<u8>::new()).is_empty());
}
