//! Handles and flags for named regions of a DSM buffer

use std::cell::Cell;
use std::rc::Rc;

use crate::error::DsmError;

/// An open region. Clones share the cursor.
#[derive(Debug, Clone)]
pub struct FileHandle {
    pub fd: u64,
    /// Region name as registered on the start server
    pub name: String,
    pub(crate) position: Rc<Cell<u64>>,
    pub flags: OpenFlags,
}

impl FileHandle {
    pub fn new(fd: u64, name: String, flags: OpenFlags) -> Self {
        Self {
            fd,
            name,
            position: Rc::new(Cell::new(0)),
            flags,
        }
    }

    /// Cursor offset relative to the region start
    pub fn position(&self) -> u64 {
        self.position.get()
    }

    pub fn seek(&self, pos: u64) {
        self.position.set(pos);
    }

    pub fn advance(&self, bytes: u64) {
        self.position.set(self.position.get().saturating_add(bytes));
    }
}

/// Access mode for `dsm_open`
///
/// `truncate` only takes effect together with `write`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    /// Register an empty region when the name is unknown
    pub create: bool,
    pub truncate: bool,
    /// Start the cursor at the current length
    pub append: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    pub fn write_only() -> Self {
        Self {
            write: true,
            ..Self::default()
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Self::default()
        }
    }

    pub fn create() -> Self {
        Self {
            create: true,
            ..Self::read_write()
        }
    }

    pub fn with_truncate(self) -> Self {
        Self {
            truncate: true,
            ..self
        }
    }

    pub fn with_append(self) -> Self {
        Self {
            append: true,
            ..self
        }
    }
}

/// Errors of the region API
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("region not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    PermissionDenied(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("bad descriptor: {0}")]
    BadDescriptor(u64),

    #[error(transparent)]
    Dsm(#[from] DsmError),
}

pub type ApiResult<T> = Result<T, ApiError>;
