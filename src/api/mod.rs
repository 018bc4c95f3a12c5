/// Heavy-data file API over a DSM buffer
///
/// Named regions of the buffer are opened, read, written and closed like
/// files. The start server keeps the region registry; an open region holds
/// its name lock until it is closed.
pub mod file_ops;
pub mod types;

// Re-export main types
pub use file_ops::*;
pub use types::*;
