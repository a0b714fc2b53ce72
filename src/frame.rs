// https://redis.io/docs/reference/protocol-spec

use std::fmt;
use std::string::FromUtf8Error;

use bytes::Bytes;
use thiserror::Error as ThisError;

pub(crate) static CRLF: &[u8; 2] = b"\r\n";

/// Arrays nested deeper than this are rejected while decoding.
const MAX_NESTING_DEPTH: usize = 32;

#[derive(Debug, ThisError, Clone, PartialEq)]
pub enum Error {
    /// The frame does not start with the expected prefix or does not end with CRLF.
    #[error("protocol error; malformed frame: {0}")]
    MalformedFrame(&'static str),
    #[error("protocol error; invalid integer {0:?}")]
    InvalidInteger(String),
    /// The frame is `actual` bytes long, its length header says it should be `expected`.
    #[error("protocol error; length header expects {expected} bytes, frame has {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("protocol error; frame ended before every array element was read")]
    UnexpectedEnd,
    #[error("protocol error; invalid frame data type: {0:#04x}")]
    UnknownType(u8),
    #[error("protocol error; frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    NullBulk,
    Array(Vec<Frame>),
    NullArray,
}

// Protocol specification: https://redis.io/docs/reference/protocol-spec/
impl Frame {
    pub fn data_type(&self) -> DataType {
        match self {
            Frame::Simple(_) => DataType::SimpleString,
            Frame::Error(_) => DataType::SimpleError,
            Frame::Integer(_) => DataType::Integer,
            Frame::Bulk(_) | Frame::NullBulk => DataType::BulkString,
            Frame::Array(_) | Frame::NullArray => DataType::Array,
        }
    }

    /// Decodes `src`, which must hold exactly one complete frame of the given type, starting
    /// with its prefix byte and ending with its own CRLF.
    ///
    /// Truncation is the frame detector's concern; this only checks that the length headers
    /// agree with the bytes that are actually there.
    pub fn decode(src: &[u8], data_type: DataType) -> Result<Self, Error> {
        decode_frame(src, data_type, 0)
    }

    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Frame::Simple(s) => {
                let mut bytes = Vec::with_capacity(1 + s.len() + CRLF.len());
                bytes.push(u8::from(DataType::SimpleString));
                bytes.extend_from_slice(s.as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Frame::Error(s) => {
                let mut bytes = Vec::with_capacity(1 + s.len() + CRLF.len());
                bytes.push(u8::from(DataType::SimpleError));
                bytes.extend_from_slice(s.as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Frame::Integer(i) => {
                let digits = i.to_string();
                let mut bytes = Vec::with_capacity(1 + digits.len() + CRLF.len());
                bytes.push(u8::from(DataType::Integer));
                bytes.extend_from_slice(digits.as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Frame::Bulk(bytes) => {
                let length_str = bytes.len().to_string();
                let mut result = Vec::with_capacity(
                    1 + length_str.len() + CRLF.len() + bytes.len() + CRLF.len(),
                );
                result.push(u8::from(DataType::BulkString));
                result.extend_from_slice(length_str.as_bytes());
                result.extend_from_slice(CRLF);
                result.extend_from_slice(bytes);
                result.extend_from_slice(CRLF);
                result
            }
            Frame::NullBulk => b"$-1\r\n".to_vec(),
            Frame::Array(arr) => {
                let length_str = arr.len().to_string();
                let mut bytes = Vec::with_capacity(1 + length_str.len() + CRLF.len());
                bytes.push(u8::from(DataType::Array));
                bytes.extend_from_slice(length_str.as_bytes());
                bytes.extend_from_slice(CRLF);
                for frame in arr {
                    bytes.extend(frame.serialize());
                }
                bytes
            }
            Frame::NullArray => b"*-1\r\n".to_vec(),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Simple(s) => write!(f, "+{}", s),
            Frame::Error(s) => write!(f, "-{}", s),
            Frame::Integer(i) => write!(f, ":{}", i),
            Frame::Bulk(bytes) => write!(f, "${}", String::from_utf8_lossy(bytes)),
            Frame::NullBulk => write!(f, "$-1"),
            Frame::Array(arr) => {
                write!(f, "*{}", arr.len())?;
                for frame in arr {
                    write!(f, " {}", frame)?;
                }
                Ok(())
            }
            Frame::NullArray => write!(f, "*-1"),
        }
    }
}

fn decode_frame(src: &[u8], data_type: DataType, depth: usize) -> Result<Frame, Error> {
    validate(src, data_type)?;

    let payload = &src[1..src.len() - CRLF.len()];

    match data_type {
        DataType::SimpleString => Ok(Frame::Simple(String::from_utf8(payload.to_vec())?)),
        DataType::SimpleError => Ok(Frame::Error(String::from_utf8(payload.to_vec())?)),
        DataType::Integer => parse_integer(payload).map(Frame::Integer),
        // $<length>\r\n<data>\r\n
        DataType::BulkString => {
            let (length, header_end) = parse_header(src).ok_or(Error::MalformedFrame(
                "bulk string length is not terminated by CRLF",
            ))??;

            let Some(length) = length else {
                return Ok(Frame::NullBulk);
            };

            let expected = header_end
                .saturating_add(length)
                .saturating_add(CRLF.len());
            if src.len() != expected {
                return Err(Error::LengthMismatch {
                    expected,
                    actual: src.len(),
                });
            }

            let data = Bytes::copy_from_slice(&src[header_end..header_end + length]);
            Ok(Frame::Bulk(data))
        }
        // *<number-of-elements>\r\n<element-1>...<element-n>
        DataType::Array => {
            let (count, header_end) = parse_header(src).ok_or(Error::MalformedFrame(
                "array length is not terminated by CRLF",
            ))??;

            let Some(count) = count else {
                return Ok(Frame::NullArray);
            };

            let (frames, end) = decode_elements(src, header_end, count, depth)?;
            if end != src.len() {
                return Err(Error::LengthMismatch {
                    expected: end,
                    actual: src.len(),
                });
            }

            Ok(Frame::Array(frames))
        }
    }
}

fn validate(src: &[u8], data_type: DataType) -> Result<(), Error> {
    let Some(&first_byte) = src.first() else {
        return Err(Error::MalformedFrame("empty frame"));
    };
    if first_byte != u8::from(data_type) {
        return Err(Error::MalformedFrame("unexpected type prefix"));
    }
    if src.len() < 1 + CRLF.len() || !src.ends_with(CRLF) {
        return Err(Error::MalformedFrame("missing CRLF terminator"));
    }
    Ok(())
}

/// Decodes `count` consecutive elements starting at `pos`, returning them together with the
/// offset right after the last one.
fn decode_elements(
    src: &[u8],
    mut pos: usize,
    count: usize,
    depth: usize,
) -> Result<(Vec<Frame>, usize), Error> {
    if depth >= MAX_NESTING_DEPTH {
        return Err(Error::MalformedFrame("arrays nested too deeply"));
    }

    // Every element takes at least three bytes, so the declared count alone can't force a
    // large allocation.
    let mut frames = Vec::with_capacity(count.min(src.len() / 3));
    for _ in 0..count {
        let (frame, end) = decode_element(src, pos, depth)?;
        frames.push(frame);
        pos = end;
    }

    Ok((frames, pos))
}

fn decode_element(src: &[u8], pos: usize, depth: usize) -> Result<(Frame, usize), Error> {
    let rest = &src[pos..];
    let first_byte = *rest.first().ok_or(Error::UnexpectedEnd)?;
    let data_type = DataType::try_from(first_byte)?;

    match data_type {
        DataType::SimpleString | DataType::SimpleError | DataType::Integer => {
            let end = find_crlf(rest, 1).ok_or(Error::UnexpectedEnd)? + CRLF.len();
            let frame = decode_frame(&rest[..end], data_type, depth)?;
            Ok((frame, pos + end))
        }
        DataType::BulkString => {
            let (length, header_end) = parse_header(rest).ok_or(Error::UnexpectedEnd)??;
            let end = match length {
                Some(length) => header_end
                    .saturating_add(length)
                    .saturating_add(CRLF.len()),
                None => header_end,
            };
            if end > rest.len() {
                return Err(Error::UnexpectedEnd);
            }
            let frame = decode_frame(&rest[..end], data_type, depth)?;
            Ok((frame, pos + end))
        }
        DataType::Array => {
            let (count, header_end) = parse_header(rest).ok_or(Error::UnexpectedEnd)??;
            match count {
                Some(count) => {
                    let (frames, end) =
                        decode_elements(src, pos + header_end, count, depth + 1)?;
                    Ok((Frame::Array(frames), end))
                }
                None => Ok((Frame::NullArray, pos + header_end)),
            }
        }
    }
}

/// Reads the `<prefix><length>\r\n` header at the start of `src`. Returns `None` when the
/// header's CRLF is not there yet, otherwise the parsed length (`None` for `-1`) and the offset
/// of the first byte after the header.
pub(crate) fn parse_header(src: &[u8]) -> Option<Result<(Option<usize>, usize), Error>> {
    let crlf = find_crlf(src, 1)?;
    Some(parse_length(&src[1..crlf]).map(|length| (length, crlf + CRLF.len())))
}

/// Parses a bulk string or array length: a non-negative integer, or `-1` for null.
fn parse_length(digits: &[u8]) -> Result<Option<usize>, Error> {
    match parse_integer(digits)? {
        -1 => Ok(None),
        length => usize::try_from(length)
            .map(Some)
            .map_err(|_| Error::InvalidInteger(length.to_string())),
    }
}

/// An optional `-` followed by one or more ASCII digits. Leading zeros are accepted.
fn parse_integer(src: &[u8]) -> Result<i64, Error> {
    let invalid = || Error::InvalidInteger(String::from_utf8_lossy(src).into_owned());

    let (negative, digits) = match src.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, src),
    };
    if digits.is_empty() {
        return Err(invalid());
    }

    // Negative numbers are accumulated below zero so that i64::MIN is reachable.
    digits.iter().try_fold(0i64, |acc, &byte| {
        if !byte.is_ascii_digit() {
            return Err(invalid());
        }
        let digit = i64::from(byte - b'0');
        let acc = acc.checked_mul(10);
        let acc = if negative {
            acc.and_then(|acc| acc.checked_sub(digit))
        } else {
            acc.and_then(|acc| acc.checked_add(digit))
        };
        acc.ok_or_else(invalid)
    })
}

/// Position of the first CRLF in `src` at or after `from`.
pub(crate) fn find_crlf(src: &[u8], from: usize) -> Option<usize> {
    src.get(from..)?
        .windows(CRLF.len())
        .position(|window| window == CRLF)
        .map(|index| from + index)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    SimpleString, // '+'
    SimpleError,  // '-'
    Integer,      // ':'
    BulkString,   // '$'
    Array,        // '*'
}

impl TryFrom<u8> for DataType {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            b'+' => Ok(Self::SimpleString),
            b'-' => Ok(Self::SimpleError),
            b':' => Ok(Self::Integer),
            b'$' => Ok(Self::BulkString),
            b'*' => Ok(Self::Array),
            _ => Err(Error::UnknownType(byte)),
        }
    }
}

impl From<DataType> for u8 {
    fn from(value: DataType) -> Self {
        match value {
            DataType::SimpleString => b'+',
            DataType::SimpleError => b'-',
            DataType::Integer => b':',
            DataType::BulkString => b'$',
            DataType::Array => b'*',
        }
    }
}

impl From<FromUtf8Error> for Error {
    fn from(_src: FromUtf8Error) -> Error {
        Error::MalformedFrame("invalid UTF-8 text")
    }
}
