//! Filter chains and the factory that builds them from response metadata.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

use crate::bz2::Bzip2Filter;
use crate::dictionary::SdchManager;
use crate::filter::{DEFAULT_BUFFER_SIZE, Filter, FilterStatus, FilterType};
use crate::gzip::GzipFilter;
use crate::sdch::SdchFilter;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("unsupported content encoding '{0}'")]
    UnsupportedEncoding(String),

    #[error("SDCH decoding needs a dictionary manager and a request URL")]
    SdchUnavailable,
}

/// Response metadata that decides how content is decoded.
#[derive(Debug, Clone)]
pub struct FilterContext {
    pub mime_type: String,
    pub url: Option<Url>,
    pub is_download: bool,
    /// A dictionary was advertised on the request
    pub is_sdch_response: bool,
    pub response_code: Option<u16>,
    pub input_buffer_size: usize,
}

impl Default for FilterContext {
    fn default() -> Self {
        Self {
            mime_type: String::new(),
            url: None,
            is_download: false,
            is_sdch_response: false,
            response_code: None,
            input_buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl FilterContext {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    #[must_use]
    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    #[must_use]
    pub fn with_download(mut self, is_download: bool) -> Self {
        self.is_download = is_download;
        self
    }

    #[must_use]
    pub fn with_sdch_response(mut self, is_sdch_response: bool) -> Self {
        self.is_sdch_response = is_sdch_response;
        self
    }

    #[must_use]
    pub fn with_response_code(mut self, code: u16) -> Self {
        self.response_code = Some(code);
        self
    }

    #[must_use]
    pub fn with_input_buffer_size(mut self, size: usize) -> Self {
        self.input_buffer_size = size;
        self
    }
}

/// Reads in a row that may return nothing before `decode_all` gives up.
const MAX_IDLE_READS: u32 = 16;

const GZIP_MIME_TYPES: [&str; 3] = ["application/x-gzip", "application/gzip", "application/x-gunzip"];

/// Mime types rendered inline rather than saved.
fn is_supported_mime_type(mime_type: &str) -> bool {
    let mime = mime_type.to_ascii_lowercase();
    mime.starts_with("text/")
        || mime.starts_with("image/")
        || matches!(
            mime.as_str(),
            "application/xhtml+xml"
                | "application/xml"
                | "application/json"
                | "application/javascript"
                | "application/x-javascript"
        )
}

fn url_extension(url: Option<&Url>) -> String {
    url.and_then(|u| u.path_segments()?.next_back().map(str::to_string))
        .and_then(|name| name.rfind('.').map(|dot| name[dot..].to_ascii_lowercase()))
        .unwrap_or_default()
}

/// Adjust the declared encodings for known server and proxy mistakes.
///
/// `types` lists encodings in the order they were applied by the server,
/// matching the `Content-Encoding` header.
pub fn fixup_encoding_types(context: &FilterContext, types: &mut Vec<FilterType>) {
    if types.as_slice() == [FilterType::Gzip] {
        let mime = context.mime_type.to_ascii_lowercase();
        if GZIP_MIME_TYPES.contains(&mime.as_str()) {
            // A gzip file served with gzip encoding is the file itself
            debug!(mime = %context.mime_type, "ignoring gzip encoding of gzip content");
            types.clear();
        }
        let ext = url_extension(context.url.as_ref());
        let gz_file = ext.ends_with(".gz") || ext == ".tgz";
        if context.is_download {
            if gz_file || ext == ".svgz" {
                types.clear();
            }
        } else if gz_file && !is_supported_mime_type(&context.mime_type) {
            types.clear();
        }
    }

    if !context.is_sdch_response {
        return;
    }

    if types.first() == Some(&FilterType::Sdch) {
        if types.len() == 1 {
            // Proxies strip ",gzip" from "sdch,gzip" without touching the body
            types.push(FilterType::GzipHelpingSdch);
        }
        return;
    }

    // A dictionary was advertised but the server did not say it used it.
    // Decode what was declared, then try SDCH and gzip tentatively.
    debug!(declared = ?types, "adding tentative SDCH decoding");
    types.insert(0, FilterType::GzipHelpingSdch);
    types.insert(0, FilterType::SdchPossible);
}

struct Stage {
    filter: Box<dyn Filter>,
    last_status: FilterStatus,
}

impl Stage {
    fn new(filter: Box<dyn Filter>) -> Self {
        Self {
            filter,
            last_status: FilterStatus::NeedMoreData,
        }
    }

    /// Decode into the next stage's staging buffer.
    fn push_into(&mut self, next: &mut Stage) {
        let next_buf = next.filter.stream_mut();
        if !next_buf.is_empty() {
            return;
        }
        let (status, n) = self.filter.read_filtered_data(next_buf.stream_buffer_mut());
        self.last_status = status;
        if status != FilterStatus::Error && n > 0 {
            next_buf.flush(n);
        }
    }
}

/// Decoders applied in sequence, raw input first.
pub struct FilterChain {
    stages: Vec<Stage>,
    last_status: FilterStatus,
}

impl FilterChain {
    /// Chain `filters`, where the first receives the raw input.
    ///
    /// Returns `None` for an empty list.
    pub fn new(filters: Vec<Box<dyn Filter>>) -> Option<Self> {
        if filters.is_empty() {
            return None;
        }
        Some(Self {
            stages: filters.into_iter().map(Stage::new).collect(),
            last_status: FilterStatus::NeedMoreData,
        })
    }

    /// Build a chain from decoder kinds in `Content-Encoding` order.
    pub fn from_types(
        types: &[FilterType],
        context: &FilterContext,
        manager: Option<&Arc<SdchManager>>,
    ) -> Result<Option<Self>, ChainError> {
        let size = context.input_buffer_size;
        let mut filters: Vec<Box<dyn Filter>> = Vec::with_capacity(types.len());
        // The last encoding applied is the first one undone
        for &kind in types.iter().rev() {
            let filter: Box<dyn Filter> = match kind {
                FilterType::Deflate | FilterType::Gzip | FilterType::GzipHelpingSdch => {
                    Box::new(GzipFilter::new(kind, size))
                }
                FilterType::Bzip2 => Box::new(Bzip2Filter::new(size, false)),
                FilterType::Sdch | FilterType::SdchPossible => {
                    let (Some(manager), Some(url)) = (manager, context.url.clone()) else {
                        return Err(ChainError::SdchUnavailable);
                    };
                    Box::new(SdchFilter::new(
                        kind,
                        size,
                        Arc::clone(manager),
                        url,
                        context.response_code,
                    ))
                }
                FilterType::Unsupported => {
                    return Err(ChainError::UnsupportedEncoding(kind.to_string()));
                }
            };
            filters.push(filter);
        }
        Ok(Self::new(filters))
    }

    /// Build a chain from `Content-Encoding` tokens, applying the usual
    /// fix-ups. `Ok(None)` means the content is used as-is.
    pub fn from_encodings<S: AsRef<str>>(
        encodings: &[S],
        context: &FilterContext,
        manager: Option<&Arc<SdchManager>>,
    ) -> Result<Option<Self>, ChainError> {
        let mut types = Vec::with_capacity(encodings.len());
        for name in encodings {
            let name = name.as_ref();
            match FilterType::from_encoding(name) {
                FilterType::Unsupported => {
                    return Err(ChainError::UnsupportedEncoding(name.to_string()));
                }
                kind => types.push(kind),
            }
        }
        fixup_encoding_types(context, &mut types);
        Self::from_types(&types, context, manager)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage kinds, raw input first.
    pub fn filter_types(&self) -> Vec<FilterType> {
        self.stages.iter().map(|s| s.filter.filter_type()).collect()
    }

    pub fn last_status(&self) -> FilterStatus {
        self.last_status
    }

    /// Writable staging buffer of the raw-input stage.
    pub fn stream_buffer(&mut self) -> &mut [u8] {
        self.stages[0].filter.stream_mut().stream_buffer_mut()
    }

    pub fn stream_buffer_size(&self) -> usize {
        self.stages[0].filter.stream().capacity()
    }

    /// Whether the raw-input stage has consumed everything flushed into it.
    pub fn is_drained(&self) -> bool {
        self.stages[0].filter.stream().is_empty()
    }

    /// Commit `n` bytes written to [`stream_buffer`](Self::stream_buffer).
    pub fn flush_stream_buffer(&mut self, n: usize) -> bool {
        self.stages[0].filter.stream_mut().flush(n)
    }

    /// Pull decoded output into `dest`.
    pub fn read_data(&mut self, dest: &mut [u8]) -> (FilterStatus, usize) {
        let result = if dest.is_empty() {
            (FilterStatus::Error, 0)
        } else {
            read_stage(&mut self.stages, dest)
        };
        self.last_status = result.0;
        result
    }

    /// Feed `input` in `chunk`-sized pieces and collect all output, using
    /// `chunk`-sized reads as well.
    ///
    /// The status is `Error` if any stage failed, `Done` if the stream
    /// ended, and `NeedMoreData` if the input ran out first.
    pub fn decode_all(&mut self, input: &[u8], chunk: usize) -> (FilterStatus, Vec<u8>) {
        let chunk = chunk.clamp(1, self.stream_buffer_size());
        let mut output = Vec::new();
        let mut dest = vec![0u8; chunk];
        let mut pos = 0;
        let mut saw_done = false;
        let mut stalls = 0;

        loop {
            let mut fed = false;
            if pos < input.len() && self.is_drained() {
                let n = chunk.min(input.len() - pos);
                self.stream_buffer()[..n].copy_from_slice(&input[pos..pos + n]);
                fed = self.flush_stream_buffer(n);
                if fed {
                    pos += n;
                }
            }

            let (status, n) = self.read_data(&mut dest);
            output.extend_from_slice(&dest[..n]);
            match status {
                FilterStatus::Error => return (FilterStatus::Error, output),
                FilterStatus::Done => saw_done = true,
                FilterStatus::Ok | FilterStatus::NeedMoreData => {}
            }

            let input_left = pos < input.len() && self.is_drained();
            if n == 0 && !fed && !input_left {
                stalls += 1;
                if (stalls >= 2 && status != FilterStatus::Ok) || stalls >= MAX_IDLE_READS {
                    break;
                }
            } else {
                stalls = 0;
            }
        }

        let status = if saw_done {
            FilterStatus::Done
        } else {
            FilterStatus::NeedMoreData
        };
        trace!(%status, input = input.len(), output = output.len(), "chain drained");
        (status, output)
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("types", &self.filter_types())
            .field("last_status", &self.last_status)
            .finish()
    }
}

/// Pull through `stages[0]` and everything downstream of it.
fn read_stage(stages: &mut [Stage], dest: &mut [u8]) -> (FilterStatus, usize) {
    let Some((head, tail)) = stages.split_first_mut() else {
        return (FilterStatus::Error, 0);
    };
    if head.last_status == FilterStatus::Error {
        return (FilterStatus::Error, 0);
    }
    if tail.is_empty() {
        let result = head.filter.read_filtered_data(dest);
        head.last_status = result.0;
        return result;
    }
    if head.last_status == FilterStatus::NeedMoreData && head.filter.stream().is_empty() {
        return read_stage(tail, dest);
    }

    let mut written;
    loop {
        if tail[0].last_status == FilterStatus::NeedMoreData {
            head.push_into(&mut tail[0]);
            if head.last_status == FilterStatus::Error {
                return (FilterStatus::Error, 0);
            }
        }
        written = read_stage(tail, dest).1;
        if head.last_status == FilterStatus::NeedMoreData {
            return (tail[0].last_status, written);
        }
        // Keep pumping while this stage holds input but the next one has
        // produced nothing, so callers never see Ok with an empty result.
        if !(head.last_status == FilterStatus::Ok
            && tail[0].last_status == FilterStatus::NeedMoreData
            && written == 0)
        {
            break;
        }
    }

    if tail[0].last_status == FilterStatus::Error {
        return (FilterStatus::Error, written);
    }
    (FilterStatus::Ok, written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(encodings: &[&str], context: &FilterContext) -> Vec<FilterType> {
        let mut t: Vec<_> = encodings.iter().map(|e| FilterType::from_encoding(e)).collect();
        fixup_encoding_types(context, &mut t);
        t
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_gzip_file_downloads_are_not_decoded() {
        let ctx = FilterContext::new()
            .with_url(url("http://example.com/archive.tar.gz"))
            .with_mime_type("application/octet-stream")
            .with_download(true);
        assert!(types(&["gzip"], &ctx).is_empty());

        let ctx = FilterContext::new()
            .with_url(url("http://example.com/file"))
            .with_mime_type("application/x-gzip");
        assert!(types(&["gzip"], &ctx).is_empty());

        let ctx = FilterContext::new()
            .with_url(url("http://example.com/page.html"))
            .with_mime_type("text/html");
        assert_eq!(types(&["gzip"], &ctx), [FilterType::Gzip]);
    }

    #[test]
    fn test_gz_extension_with_viewable_mime_is_decoded() {
        let ctx = FilterContext::new()
            .with_url(url("http://example.com/log.txt.gz"))
            .with_mime_type("text/plain");
        assert_eq!(types(&["gzip"], &ctx), [FilterType::Gzip]);

        let ctx = ctx.with_mime_type("application/octet-stream");
        assert!(types(&["gzip"], &ctx).is_empty());
    }

    #[test]
    fn test_sdch_fixups() {
        let ctx = FilterContext::new()
            .with_url(url("http://example.com/"))
            .with_mime_type("text/html")
            .with_sdch_response(true);
        assert_eq!(
            types(&["sdch"], &ctx),
            [FilterType::Sdch, FilterType::GzipHelpingSdch]
        );
        assert_eq!(
            types(&["sdch", "gzip"], &ctx),
            [FilterType::Sdch, FilterType::Gzip]
        );
        assert_eq!(
            types(&["gzip"], &ctx),
            [FilterType::SdchPossible, FilterType::GzipHelpingSdch, FilterType::Gzip]
        );
        assert_eq!(
            types(&[], &ctx),
            [FilterType::SdchPossible, FilterType::GzipHelpingSdch]
        );

        let plain = FilterContext::new().with_mime_type("text/html");
        assert_eq!(types(&["sdch"], &plain), [FilterType::Sdch]);
    }

    #[test]
    fn test_factory_orders_stages_from_raw_input() {
        let ctx = FilterContext::new().with_input_buffer_size(128);
        let chain = FilterChain::from_encodings(&["bzip2", "gzip"], &ctx, None)
            .unwrap()
            .unwrap();
        assert_eq!(chain.filter_types(), [FilterType::Gzip, FilterType::Bzip2]);
        assert_eq!(chain.stream_buffer_size(), 128);
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_factory_errors() {
        let ctx = FilterContext::new();
        assert_eq!(
            FilterChain::from_encodings(&["br"], &ctx, None).unwrap_err(),
            ChainError::UnsupportedEncoding("br".into())
        );
        assert_eq!(
            FilterChain::from_encodings(&["sdch"], &ctx, None).unwrap_err(),
            ChainError::SdchUnavailable
        );
        assert!(
            FilterChain::from_encodings::<&str>(&[], &ctx, None)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_read_with_empty_destination_is_error() {
        let ctx = FilterContext::new();
        let mut chain = FilterChain::from_encodings(&["gzip"], &ctx, None)
            .unwrap()
            .unwrap();
        assert_eq!(chain.read_data(&mut []), (FilterStatus::Error, 0));
        assert_eq!(chain.last_status(), FilterStatus::Error);
    }
}
