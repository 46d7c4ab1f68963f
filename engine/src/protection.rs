use std::fmt;

/// Access rights of a region, as understood by the platform memory API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protection {
    NoAccess,
    Read,
    ReadWrite,
    Execute,
    ExecuteRead,
    ExecuteReadWrite,
}

impl Protection {
    pub fn is_readable(self) -> bool {
        matches!(
            self,
            Protection::Read
                | Protection::ReadWrite
                | Protection::ExecuteRead
                | Protection::ExecuteReadWrite
        )
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Protection::ReadWrite | Protection::ExecuteReadWrite)
    }

    pub fn is_executable(self) -> bool {
        matches!(
            self,
            Protection::Execute | Protection::ExecuteRead | Protection::ExecuteReadWrite
        )
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protection::NoAccess => write!(f, "---"),
            Protection::Read => write!(f, "r--"),
            Protection::ReadWrite => write!(f, "rw-"),
            Protection::Execute => write!(f, "--x"),
            Protection::ExecuteRead => write!(f, "r-x"),
            Protection::ExecuteReadWrite => write!(f, "rwx"),
        }
    }
}

#[test]
fn test_only_write_flags_are_writable() {
    let writable = [
        Protection::NoAccess,
        Protection::Read,
        Protection::ReadWrite,
        Protection::Execute,
        Protection::ExecuteRead,
        Protection::ExecuteReadWrite,
    ]
    .into_iter()
    .filter(|p| p.is_writable())
    .collect::<Vec<_>>();
    assert_eq!(
        writable,
        [Protection::ReadWrite, Protection::ExecuteReadWrite]
    );
}

#[test]
fn test_execute_flags() {
    assert!(Protection::Execute.is_executable());
    assert!(!Protection::Execute.is_readable());
    assert!(Protection::ExecuteRead.is_readable());
    assert!(!Protection::ReadWrite.is_executable());
    assert_eq!(Protection::ExecuteReadWrite.to_string(), "rwx");
}
