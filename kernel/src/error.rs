//! Error types for the Obsidian kernel
//!
//! Every fallible kernel path reports through these enums; the syscall
//! boundary converts them into the negative integers of the user ABI.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Physical memory exhausted
    OutOfMemory,
    /// Address outside a valid window
    InvalidAddress { addr: usize },
    /// Scheduler-related errors
    Sched(SchedError),
    /// System call errors
    Syscall(SyscallError),
    /// Filesystem-related errors
    Fs(FsError),
    /// ELF loader errors
    Elf(ElfError),
    /// Generic invalid argument
    InvalidArgument { name: &'static str },
    /// A fixed pool ran dry
    ResourceExhausted { resource: &'static str },
    /// Operation would block (empty pipe with a live writer, full pipe
    /// with a live reader); the syscall layer retries with a yield
    WouldBlock,
    /// Write end or read end of a pipe closed
    BrokenPipe,
    /// Subsystem used before its `init()`
    NotInitialized { subsystem: &'static str },
}

/// Scheduler-specific errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// All 16 task slots are in use
    TaskTableFull,
    /// No task is current (scheduler not bootstrapped)
    NoCurrentTask,
    /// Kernel stack allocation failed
    StackAllocFailed,
    /// Address-space construction failed
    AddressSpaceFailed,
}

/// System call errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    /// Unknown syscall number
    InvalidSyscall { nr: usize },
    /// Descriptor out of range or unused
    BadFileDescriptor,
    /// User pointer was null or out of the user window
    InvalidPointer { addr: usize },
    /// Output buffer too small
    BufferTooSmall,
    /// Argument value not acceptable
    InvalidArgument,
}

/// Filesystem-specific errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// File or directory not found
    NotFound,
    /// Path already exists
    AlreadyExists,
    /// Target is not a directory
    NotADirectory,
    /// Target is not a file
    NotAFile,
    /// Directory is not empty
    DirectoryNotEmpty,
    /// Invalid path format
    InvalidPath,
    /// Root filesystem not mounted
    NoRootFs,
    /// Volume is not FAT32
    NotFat32,
    /// I/O error from the block device
    IoError,
    /// No free cluster / no free directory slot
    NoSpace,
    /// Node cache full
    NodeCacheFull,
    /// File descriptor table full
    TooManyOpenFiles,
    /// Operation not supported on this node type
    NotSupported,
}

/// ELF loader errors, with the loader's fixed error-code table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    BadMagic,
    Not64Bit,
    NotLittleEndian,
    WrongType,
    WrongMachine,
    NotAFile,
    TooLarge,
    ShortRead,
}

impl ElfError {
    /// The loader's ABI error code.
    pub fn code(self) -> isize {
        match self {
            ElfError::BadMagic => -1,
            ElfError::Not64Bit => -2,
            ElfError::NotLittleEndian => -3,
            ElfError::WrongType => -4,
            ElfError::WrongMachine => -5,
            ElfError::NotAFile => -10,
            ElfError::TooLarge => -11,
            ElfError::ShortRead => -12,
        }
    }
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl KernelError {
    /// Convert into the negative return value of the user ABI.
    ///
    /// ELF errors keep their specific codes; everything else is `-1`,
    /// matching the "user program decides how to react" contract.
    pub fn to_errno(self) -> isize {
        match self {
            KernelError::Elf(e) => e.code(),
            _ => -1,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "Out of physical memory"),
            Self::InvalidAddress { addr } => write!(f, "Invalid address: {:#x}", addr),
            Self::Sched(e) => write!(f, "Scheduler error: {:?}", e),
            Self::Syscall(e) => write!(f, "Syscall error: {:?}", e),
            Self::Fs(e) => write!(f, "Filesystem error: {:?}", e),
            Self::Elf(e) => write!(f, "ELF error: {:?}", e),
            Self::InvalidArgument { name } => write!(f, "Invalid argument '{}'", name),
            Self::ResourceExhausted { resource } => {
                write!(f, "Resource exhausted: {}", resource)
            }
            Self::WouldBlock => write!(f, "Operation would block"),
            Self::BrokenPipe => write!(f, "Broken pipe"),
            Self::NotInitialized { subsystem } => {
                write!(f, "Subsystem not initialized: {}", subsystem)
            }
        }
    }
}

impl From<SchedError> for KernelError {
    fn from(err: SchedError) -> Self {
        Self::Sched(err)
    }
}

impl From<SyscallError> for KernelError {
    fn from(err: SyscallError) -> Self {
        Self::Syscall(err)
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        Self::Fs(err)
    }
}

impl From<ElfError> for KernelError {
    fn from(err: ElfError) -> Self {
        Self::Elf(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elf_error_codes() {
        assert_eq!(ElfError::BadMagic.code(), -1);
        assert_eq!(ElfError::Not64Bit.code(), -2);
        assert_eq!(ElfError::NotLittleEndian.code(), -3);
        assert_eq!(ElfError::WrongType.code(), -4);
        assert_eq!(ElfError::WrongMachine.code(), -5);
        assert_eq!(ElfError::TooLarge.code(), -11);
        assert_eq!(ElfError::ShortRead.code(), -12);
    }

    #[test]
    fn test_errno_passthrough_for_elf() {
        let err: KernelError = ElfError::TooLarge.into();
        assert_eq!(err.to_errno(), -11);
    }

    #[test]
    fn test_errno_generic() {
        let err: KernelError = FsError::NotFound.into();
        assert_eq!(err.to_errno(), -1);
        let err: KernelError = SyscallError::BadFileDescriptor.into();
        assert_eq!(err.to_errno(), -1);
        assert_eq!(KernelError::WouldBlock.to_errno(), -1);
        assert_eq!(KernelError::BrokenPipe.to_errno(), -1);
    }
}
