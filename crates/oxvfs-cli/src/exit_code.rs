//! Exit codes for the CLI.
//!
//! Scripts can tell a lock conflict apart from a real failure and retry.

/// Successful execution
pub const SUCCESS: u8 = 0;

/// General/unspecified error
pub const GENERAL_ERROR: u8 = 1;

/// Command-line usage error (bad arguments, lock protocol misuse)
pub const USAGE_ERROR: u8 = 2;

/// Another process holds a conflicting lock
pub const BUSY: u8 = 3;

/// File not found
pub const NOT_FOUND: u8 = 4;

/// Permission denied
pub const PERMISSION_DENIED: u8 = 5;

/// I/O failure (read, write, sync, lock syscall)
pub const IO_ERROR: u8 = 6;

/// Content could not be decoded
pub const DECODE_FAILED: u8 = 7;
