//! Pull-based content decoding.
//!
//! A [`FilterChain`] strings decoders together so that raw response bytes
//! written into the first stage come out of the last stage fully decoded.
//! Each stage owns a fixed staging buffer and only pulls from its upstream
//! neighbour when it has run dry, so memory use stays bounded by the buffer
//! sizes no matter how large the content is.
//!
//! Supported encodings: `gzip`, `deflate` (with or without the zlib
//! wrapper), `bzip2`, and SDCH (shared-dictionary VCDIFF, with dictionaries
//! kept in an [`SdchManager`]).
//!
//! # Example
//!
//! ```no_run
//! use oxvfs_filter::{FilterChain, FilterContext, FilterStatus};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let body: Vec<u8> = std::fs::read("response.gz")?;
//! let ctx = FilterContext::new().with_mime_type("text/html");
//! let mut chain = FilterChain::from_encodings(&["gzip"], &ctx, None)?
//!     .expect("gzip needs decoding");
//! let (status, decoded) = chain.decode_all(&body, 4096);
//! assert_ne!(status, FilterStatus::Error);
//! # let _ = decoded;
//! # Ok(())
//! # }
//! ```

mod bz2;
pub mod chain;
pub mod dictionary;
pub mod filter;
mod gzip;
mod sdch;
pub mod vcdiff;

pub use bz2::Bzip2Filter;
pub use chain::{ChainError, FilterChain, FilterContext, fixup_encoding_types};
pub use dictionary::{Dictionary, SdchError, SdchManager, dictionary_hashes};
pub use filter::{DEFAULT_BUFFER_SIZE, Filter, FilterStatus, FilterType, StreamBuffer};
pub use gzip::GzipFilter;
pub use sdch::SdchFilter;
pub use vcdiff::{VcdiffDecoder, VcdiffError};
