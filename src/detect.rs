//! Frame boundary detection for a byte stream.
//!
//! Clients send commands as arrays of bulk strings, so at the top level any of the five types
//! is accepted but array elements must be bulk strings. Bulk string payloads are skipped by
//! length, never scanned, so they may contain CRLF.

use crate::frame::{self, DataType, Error, CRLF};

/// Length headers (`$`/`*`, sign, digits, CRLF) never need more bytes than this.
const MAX_HEADER_LEN: usize = 32;

/// The smallest possible array element, `$-1\r\n`.
const MIN_ELEMENT_LEN: usize = 5;

/// Where the detector is in the frame currently being accumulated. Offsets are relative to the
/// first byte of the frame.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Progress {
    /// Nothing is known about the frame yet.
    Start,
    /// Waiting for the CRLF that ends a simple string, error or integer. The search resumes at
    /// `scan_from`.
    Line { scan_from: usize },
    /// The frame is complete once the buffer holds `len` bytes.
    Sized { len: usize },
    /// An array header has been read, `remaining` elements are still expected and the next
    /// one starts at `next`.
    Elements { next: usize, remaining: usize },
}

/// Decides whether an accumulating buffer holds one complete frame.
///
/// The detector remembers how far it got on the previous call, so feeding it a buffer one
/// byte at a time costs time linear in the frame size. The buffer passed to consecutive
/// [`FrameDetector::check`] calls must start at the same frame and only ever grow until a
/// frame is reported complete (or [`FrameDetector::reset`] is called).
#[derive(Debug)]
pub struct FrameDetector {
    max_frame_size: usize,
    progress: Progress,
}

impl FrameDetector {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            progress: Progress::Start,
        }
    }

    pub fn reset(&mut self) {
        self.progress = Progress::Start;
    }

    /// Returns `Ok(Some(len))` when the first `len` bytes of `buf` form a complete frame and
    /// `Ok(None)` when more bytes are needed. Errors are terminal: no amount of further input
    /// can turn the buffer into a valid frame.
    ///
    /// Once a frame is reported complete (or an error returned) the detector starts over for
    /// the next frame.
    pub fn check(&mut self, buf: &[u8]) -> Result<Option<usize>, Error> {
        let result = self.advance(buf);
        if !matches!(result, Ok(None)) {
            self.reset();
        }
        result
    }

    fn advance(&mut self, buf: &[u8]) -> Result<Option<usize>, Error> {
        loop {
            match self.progress {
                Progress::Start => {
                    let Some(&first_byte) = buf.first() else {
                        return Ok(None);
                    };

                    self.progress = match DataType::try_from(first_byte)? {
                        DataType::SimpleString | DataType::SimpleError | DataType::Integer => {
                            Progress::Line { scan_from: 1 }
                        }
                        DataType::BulkString => match self.bulk_string_end(buf)? {
                            Some(len) => Progress::Sized { len },
                            None => return Ok(None),
                        },
                        DataType::Array => {
                            let Some((count, header_end)) = self.header(buf)? else {
                                return Ok(None);
                            };
                            match count {
                                None | Some(0) => return Ok(Some(header_end)),
                                Some(count) => {
                                    self.ensure_fits(
                                        header_end.saturating_add(
                                            count.saturating_mul(MIN_ELEMENT_LEN),
                                        ),
                                    )?;
                                    Progress::Elements {
                                        next: header_end,
                                        remaining: count,
                                    }
                                }
                            }
                        }
                    };
                }
                Progress::Line { scan_from } => {
                    return match frame::find_crlf(buf, scan_from) {
                        Some(crlf) => {
                            let len = crlf + CRLF.len();
                            self.ensure_fits(len)?;
                            Ok(Some(len))
                        }
                        None => {
                            self.ensure_fits(buf.len())?;
                            // The last byte may be the CR of a CRLF split across reads.
                            self.progress = Progress::Line {
                                scan_from: buf.len().saturating_sub(1).max(scan_from),
                            };
                            Ok(None)
                        }
                    };
                }
                Progress::Sized { len } => {
                    return Ok((buf.len() >= len).then_some(len));
                }
                Progress::Elements {
                    mut next,
                    mut remaining,
                } => {
                    while remaining > 0 {
                        let Some(&first_byte) = buf.get(next) else {
                            break;
                        };
                        if DataType::try_from(first_byte)? != DataType::BulkString {
                            return Err(Error::MalformedFrame(
                                "array elements must be bulk strings",
                            ));
                        }
                        let Some(len) = self.bulk_string_end(&buf[next..])? else {
                            break;
                        };
                        let end = next.saturating_add(len);
                        self.ensure_fits(end)?;
                        if end > buf.len() {
                            break;
                        }
                        next = end;
                        remaining -= 1;
                    }

                    if remaining == 0 {
                        return Ok(Some(next));
                    }
                    self.progress = Progress::Elements { next, remaining };
                    return Ok(None);
                }
            }
        }
    }

    /// Total length of the bulk string starting at `buf[0]`, once its header is available.
    fn bulk_string_end(&self, buf: &[u8]) -> Result<Option<usize>, Error> {
        let Some((length, header_end)) = self.header(buf)? else {
            return Ok(None);
        };
        let len = match length {
            Some(length) => header_end
                .saturating_add(length)
                .saturating_add(CRLF.len()),
            None => header_end,
        };
        self.ensure_fits(len)?;
        Ok(Some(len))
    }

    /// Leading zeros don't count toward the header width limit, they only count toward the
    /// frame size.
    fn header(&self, buf: &[u8]) -> Result<Option<(Option<usize>, usize)>, Error> {
        let zeros = buf.iter().skip(1).take_while(|&&byte| byte == b'0').count();
        let width = MAX_HEADER_LEN.saturating_add(zeros);
        let window = &buf[..buf.len().min(width)];
        match frame::parse_header(window) {
            Some(header) => header.map(Some),
            None if window.len() == width => Err(Error::InvalidInteger(
                String::from_utf8_lossy(&window[1..]).into_owned(),
            )),
            None => {
                self.ensure_fits(window.len())?;
                Ok(None)
            }
        }
    }

    fn ensure_fits(&self, size: usize) -> Result<(), Error> {
        if size > self.max_frame_size {
            return Err(Error::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }
}
