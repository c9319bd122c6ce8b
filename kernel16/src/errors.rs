use thiserror::Error;

use crate::cpu::Fault16;

/// Legacy codes a failing module load hands back in place of an instance handle.
pub const ERROR_FILE_NOT_FOUND: u16 = 2;
pub const ERROR_NOT_ENOUGH_MEMORY: u16 = 8;
pub const ERROR_BAD_FORMAT: u16 = 11;
pub const ERROR_INVALID_HANDLE: u16 = 6;
/// OS/2 linear executable.
pub const ERROR_LX_MODULE: u16 = 12;
/// 32-bit PE image.
pub const ERROR_WIN32_MODULE: u16 = 21;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("bad executable format: {0}")]
    BadFormat(String),
    #[error("{0} is a 32-bit module")]
    Win32Module(String),
    #[error("{0} is an OS/2 linear executable")]
    LinearExecutable(String),
    #[error("module {0} not found")]
    ModuleNotFound(String),
    #[error("invalid handle {0:#06x}")]
    InvalidHandle(u16),
    #[error("invalid selector {0:#06x}")]
    InvalidSelector(u16),
    #[error("access {0:04x}:{1:04x} outside segment limit")]
    OutOfBounds(u16, u32),
    #[error("linear address {0:#010x} not mapped")]
    Unmapped(u32),
    #[error("no free selectors for {0} entries")]
    OutOfSelectors(u16),
    #[error("out of memory allocating {0:#x} bytes")]
    OutOfMemory(u32),
    #[error("no room for a local heap in {0:#06x}")]
    LocalHeapFull(u16),
    #[error("task exited with code {0}")]
    TaskExit(u16),
    #[error("16-bit fault {0}")]
    Fault(#[from] Fault16),
    #[error("io error {0}")]
    IoError(#[from] std::io::Error),
    #[error("loader error {0}")]
    LoaderError(#[from] goblin::error::Error),
    #[error("custom error {0}")]
    Custom(#[from] anyhow::Error),
}

impl KernelError {
    /// The small integer a Win16 caller sees instead of an instance handle.
    pub fn legacy_code(&self) -> u16 {
        match self {
            KernelError::BadFormat(_) | KernelError::LoaderError(_) => ERROR_BAD_FORMAT,
            KernelError::Win32Module(_) => ERROR_WIN32_MODULE,
            KernelError::LinearExecutable(_) => ERROR_LX_MODULE,
            KernelError::ModuleNotFound(_) | KernelError::IoError(_) => ERROR_FILE_NOT_FOUND,
            KernelError::OutOfMemory(_)
            | KernelError::OutOfSelectors(_)
            | KernelError::LocalHeapFull(_) => ERROR_NOT_ENOUGH_MEMORY,
            KernelError::InvalidHandle(_) | KernelError::InvalidSelector(_) => {
                ERROR_INVALID_HANDLE
            }
            _ => ERROR_BAD_FORMAT,
        }
    }
}

pub type Result<T> = std::result::Result<T, KernelError>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_legacy_codes() {
        assert_eq!(
            KernelError::Win32Module("A.DLL".into()).legacy_code(),
            ERROR_WIN32_MODULE
        );
        assert_eq!(
            KernelError::LinearExecutable("A.DLL".into()).legacy_code(),
            ERROR_LX_MODULE
        );
        assert_eq!(
            KernelError::BadFormat("truncated".into()).legacy_code(),
            ERROR_BAD_FORMAT
        );
        assert!(KernelError::ModuleNotFound("X".into()).legacy_code() < 32);
    }
}
