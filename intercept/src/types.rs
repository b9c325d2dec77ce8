use thiserror::Error;

/// Failure to redirect a single function.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    #[error("symbol `{0}` not found in any loaded module")]
    SymbolNotFound(String),

    #[error("no relocation slot in any loaded module references `{0}`")]
    NoRelocationSlot(String),

    #[error("cannot change protection of {addr:#x}+{len:#x} (errno {errno})")]
    Protection { addr: usize, len: usize, errno: i32 },

    #[error("prologue at {0:#x} cannot be relocated")]
    Relocation(usize),

    #[error("patch at {0:#x} cannot be written atomically")]
    Misaligned(usize),

    #[error("function at {0:#x} is already patched")]
    AlreadyPatched(usize),

    #[error("code allocation failed")]
    AllocationFailed,

    #[error("not supported on this platform")]
    Unsupported,
}

pub type Result<T> = core::result::Result<T, HookError>;

impl HookError {
    /// Build a [`HookError::Protection`] from the current `errno`.
    pub(crate) fn protection(addr: usize, len: usize) -> Self {
        HookError::Protection {
            addr,
            len,
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub path: String,
    pub base_address: usize,
    pub size: usize,
}

/// One line of `/proc/self/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub start: usize,
    pub end: usize,
    /// `PROT_*` bits.
    pub prot: i32,
    pub shared: bool,
    pub path: Option<String>,
}

impl Mapping {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.end
    }
}

/// A relocation slot that was rewritten, with the value it held before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPatch {
    pub slot: usize,
    pub previous: usize,
}
