//! Frame stream extraction from chunked upload bodies.
//!
//! Devices either post one JPEG per request (raw-body framing) or stream a
//! multipart body (`multipart/x-mixed-replace`, `multipart/form-data`) whose
//! parts carry JPEG payloads. [`FrameExtractor`] is a stateful parser fed
//! with body chunks of arbitrary size; it yields every payload it can carve
//! so far and keeps unconsumed bytes for the next chunk.
//!
//! Carved payloads are narrowed to the bytes between the first `FF D8` and
//! the last `FF D9`, which strips trailing CRLFs and other framing leftovers.
//! Incomplete data never produces an error: the extractor simply waits.

use crate::frame::{has_jpeg_markers, JPEG_EOI, JPEG_SOI};
use bytes::Bytes;
use std::ops::Range;
use tracing::{debug, trace, warn};

/// Upper bound on bytes buffered for one stream before they are discarded.
pub const MAX_BUFFERED_BYTES: usize = 32 * 1024 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// How an upload body is split into frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// The whole body is one frame
    Raw,
    /// Multipart body; holds the delimiter (`--` + boundary)
    Multipart { delimiter: Vec<u8> },
}

/// Counters for one extraction stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtractorStats {
    pub frames_emitted: u64,
    pub parts_rejected: u64,
    pub bytes_received: u64,
}

/// Outcome of one carving attempt over the buffered bytes.
enum Carve {
    Frame(Bytes),
    Rejected(&'static str),
    Skipped,
    NeedMore,
}

/// Stateful per-stream frame parser.
#[derive(Debug)]
pub struct FrameExtractor {
    framing: Framing,
    buffer: Vec<u8>,
    max_buffered: usize,
    overflowed: bool,
    stats: ExtractorStats,
}

impl FrameExtractor {
    /// Create an extractor with explicit framing.
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buffer: Vec::new(),
            max_buffered: MAX_BUFFERED_BYTES,
            overflowed: false,
            stats: ExtractorStats::default(),
        }
    }

    /// Pick the framing from a request Content-Type header.
    ///
    /// A `boundary=` parameter selects multipart framing, anything else
    /// (including a missing header) selects raw-body framing.
    pub fn for_content_type(content_type: Option<&str>) -> Self {
        let framing = match content_type.and_then(boundary_from_content_type) {
            Some(boundary) => Framing::Multipart {
                delimiter: [b"--".as_slice(), boundary.as_bytes()].concat(),
            },
            None => Framing::Raw,
        };
        Self::new(framing)
    }

    /// Override the limit on bytes held back between chunks.
    pub fn with_buffer_limit(mut self, max_buffered: usize) -> Self {
        self.max_buffered = max_buffered;
        self
    }

    pub fn framing(&self) -> &Framing {
        &self.framing
    }

    pub fn stats(&self) -> ExtractorStats {
        self.stats
    }

    /// Bytes currently held back waiting for more input.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Feed one body chunk and return every frame payload completed so far.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.stats.bytes_received += chunk.len() as u64;

        if self.overflowed {
            return Vec::new();
        }

        match self.framing {
            Framing::Raw => {
                if self.buffer.len() + chunk.len() > self.max_buffered {
                    warn!(
                        buffered = self.buffer.len(),
                        chunk = chunk.len(),
                        "Upload buffer limit exceeded, discarding raw body"
                    );
                    self.buffer = Vec::new();
                    self.stats.parts_rejected += 1;
                    // Raw bodies cannot resynchronise.
                    self.overflowed = true;
                } else {
                    self.buffer.extend_from_slice(chunk);
                }
                Vec::new()
            }
            Framing::Multipart { .. } => {
                self.buffer.extend_from_slice(chunk);
                let frames = self.drain_parts(false);

                // Only an unfinished part counts against the limit; the
                // stream recovers at the next delimiter.
                if self.buffer.len() > self.max_buffered {
                    warn!(
                        buffered = self.buffer.len(),
                        "Upload buffer limit exceeded, discarding partial part"
                    );
                    self.buffer.clear();
                    self.stats.parts_rejected += 1;
                }
                frames
            }
        }
    }

    /// Signal the end of the body and return any final frame.
    pub fn finish(&mut self) -> Vec<Bytes> {
        match self.framing {
            Framing::Raw => {
                let body = std::mem::take(&mut self.buffer);
                if self.overflowed {
                    return Vec::new();
                }
                if has_jpeg_markers(&body) {
                    self.stats.frames_emitted += 1;
                    vec![Bytes::from(body)]
                } else {
                    warn!(len = body.len(), "Raw body is not a JPEG frame, dropping");
                    self.stats.parts_rejected += 1;
                    Vec::new()
                }
            }
            Framing::Multipart { .. } => {
                let frames = self.drain_parts(true);
                if !self.buffer.is_empty() {
                    trace!(len = self.buffer.len(), "Discarding trailing bytes at end of stream");
                    self.buffer.clear();
                }
                frames
            }
        }
    }

    fn drain_parts(&mut self, at_eof: bool) -> Vec<Bytes> {
        let Framing::Multipart { delimiter } = &self.framing else {
            return Vec::new();
        };

        let mut frames = Vec::new();
        loop {
            match carve_part(&mut self.buffer, delimiter, at_eof) {
                Carve::Frame(payload) => {
                    self.stats.frames_emitted += 1;
                    trace!(len = payload.len(), "Carved frame from multipart stream");
                    frames.push(payload);
                }
                Carve::Rejected(reason) => {
                    self.stats.parts_rejected += 1;
                    warn!(reason, "Dropping malformed multipart part");
                }
                Carve::Skipped => {}
                Carve::NeedMore => break,
            }
        }
        frames
    }
}

/// Extract the `boundary` parameter of a Content-Type value.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Try to carve the next part out of `buffer`, draining what was consumed.
fn carve_part(buffer: &mut Vec<u8>, delimiter: &[u8], at_eof: bool) -> Carve {
    let Some(start) = find(buffer, delimiter) else {
        // Keep only a tail that could still begin a split delimiter.
        let keep = if at_eof { 0 } else { delimiter.len().saturating_sub(1) };
        if buffer.len() > keep {
            let discard = buffer.len() - keep;
            debug!(discarded = discard, "Discarding bytes outside of any part");
            buffer.drain(..discard);
        }
        return Carve::NeedMore;
    };
    if start > 0 {
        buffer.drain(..start);
    }

    let after_delimiter = delimiter.len();
    if buffer.len() < after_delimiter + 2 {
        if at_eof {
            buffer.clear();
        }
        return Carve::NeedMore;
    }

    // Closing delimiter `--boundary--`
    if &buffer[after_delimiter..after_delimiter + 2] == b"--" {
        buffer.drain(..after_delimiter + 2);
        return Carve::Skipped;
    }

    let Some(header_len) = find(&buffer[after_delimiter..], HEADER_TERMINATOR) else {
        if at_eof {
            buffer.clear();
            return Carve::Rejected("part headers never terminated");
        }
        return Carve::NeedMore;
    };
    let headers = &buffer[after_delimiter..after_delimiter + header_len];
    let body_start = after_delimiter + header_len + HEADER_TERMINATOR.len();

    // Content-Length is trusted only when no delimiter shows up inside the
    // declared range and the sliced bytes hold a complete JPEG.
    if let Some(length) = content_length(headers) {
        let declared_end = body_start.saturating_add(length);
        let available_end = declared_end.min(buffer.len());
        let lies = find(&buffer[body_start..available_end], delimiter).is_some();

        if !lies {
            if declared_end > buffer.len() {
                if !at_eof {
                    return Carve::NeedMore;
                }
            } else if let Some(range) = jpeg_range(&buffer[body_start..declared_end]) {
                let payload = Bytes::copy_from_slice(
                    &buffer[body_start + range.start..body_start + range.end],
                );
                buffer.drain(..declared_end);
                return Carve::Frame(payload);
            }
        }
    }

    let body_end = match find(&buffer[body_start..], delimiter) {
        Some(offset) => body_start + offset,
        None if at_eof => buffer.len(),
        None => return Carve::NeedMore,
    };

    let carved = jpeg_range(&buffer[body_start..body_end]).map(|range| {
        Bytes::copy_from_slice(&buffer[body_start + range.start..body_start + range.end])
    });
    buffer.drain(..body_end);

    match carved {
        Some(payload) => Carve::Frame(payload),
        None => Carve::Rejected("part does not contain a JPEG image"),
    }
}

/// Parse a case-insensitive `Content-Length` header from raw part headers.
fn content_length(headers: &[u8]) -> Option<usize> {
    let headers = std::str::from_utf8(headers).ok()?;
    headers.split("\r\n").find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

/// Range from the first SOI marker to the end of the last EOI marker.
fn jpeg_range(part: &[u8]) -> Option<Range<usize>> {
    let start = find(part, &JPEG_SOI)?;
    let eoi = rfind(part, &JPEG_EOI)?;
    (eoi >= start + JPEG_SOI.len()).then(|| start..eoi + JPEG_EOI.len())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}
