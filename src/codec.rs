use bytes::{Buf, BytesMut};
use std::io;
use thiserror::Error as ThisError;
use tokio_util::codec::{Decoder, Encoder};

use crate::config::DEFAULT_MAX_FRAME_SIZE;
use crate::detect::FrameDetector;
use crate::frame::{self, DataType, Frame};

#[derive(Debug, ThisError)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] frame::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Splits a byte stream into frames and writes frames back as bytes.
///
/// Reads from the transport may arrive in chunks of any size, but frame boundaries are the
/// ones a reader consuming one byte at a time would find: the detector always reports the
/// shortest complete prefix of the buffer.
#[derive(Debug)]
pub struct FrameCodec {
    detector: FrameDetector,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            detector: FrameDetector::new(max_frame_size),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Stray whitespace between frames is dropped. A frame in progress always starts with
        // its type prefix, so this never eats into one.
        let whitespace = src
            .iter()
            .take_while(|byte| matches!(byte, b'\r' | b'\n' | b' '))
            .count();
        src.advance(whitespace);

        let Some(len) = self.detector.check(src)? else {
            return Ok(None); // Not enough data to make up an entire frame.
        };

        // Remove the frame from the buffer.
        let data = src.split_to(len);
        let data_type = DataType::try_from(data[0])?;
        let frame = Frame::decode(&data, data_type)?;

        Ok(Some(frame))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => {
                self.detector.reset();
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed in the middle of a frame",
                )
                .into())
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&frame.serialize());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rand::Rng;

    fn bulk_array(parts: &[&str]) -> Frame {
        Frame::Array(
            parts
                .iter()
                .map(|part| Frame::Bulk(Bytes::copy_from_slice(part.as_bytes())))
                .collect(),
        )
    }

    #[test]
    fn decode_frames_from_a_single_buffer() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"+OK\r\n:42\r\n*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n$-1\r\n"[..]);

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Simple("OK".to_string()))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Integer(42)));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(bulk_array(&["GET", "foo"]))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::NullBulk));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_skips_whitespace_between_frames() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"\r\n \r\n+PING\r\n\n\n  *-1\r\n"[..]);

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Simple("PING".to_string()))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::NullArray));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn decode_waits_for_the_rest_of_a_frame() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$3\r\nf"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"oo\r");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(bulk_array(&["GET", "foo"]))
        );
    }

    #[test]
    fn decode_is_independent_of_chunking() {
        let expected = vec![
            bulk_array(&["SET", "foo", "bar\r\nbaz"]),
            bulk_array(&["GET", "foo"]),
            Frame::Simple("OK".to_string()),
            Frame::Bulk(Bytes::from_static(b"\r\n\r\n")),
            bulk_array(&["PING"]),
            Frame::Integer(-7),
        ];
        let stream: Vec<u8> = expected
            .iter()
            .flat_map(|frame| {
                let mut bytes = frame.serialize();
                bytes.extend_from_slice(b"\r\n");
                bytes
            })
            .collect();

        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let mut codec = FrameCodec::default();
            let mut buf = BytesMut::new();
            let mut frames = vec![];
            let mut rest = &stream[..];

            while !rest.is_empty() {
                let n = rng.gen_range(1..=rest.len().min(9));
                buf.extend_from_slice(&rest[..n]);
                rest = &rest[n..];

                while let Some(frame) = codec.decode(&mut buf).unwrap() {
                    frames.push(frame);
                }
            }

            assert_eq!(frames, expected);
        }
    }

    #[test]
    fn decode_rejects_unknown_types() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"PING\r\n"[..]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::Protocol(frame::Error::UnknownType(b'P')))
        ));
    }

    #[test]
    fn decode_rejects_frames_over_the_limit() {
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::from(&b"$100\r\n"[..]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::Protocol(frame::Error::FrameTooLarge { size: 108, max: 16 }))
        ));
    }

    #[test]
    fn decode_reports_bulk_string_without_terminator() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"$3\r\nfooXX"[..]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::Protocol(frame::Error::MalformedFrame(_)))
        ));
    }

    #[test]
    fn decode_eof_in_the_middle_of_a_frame() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"*1\r\n$4\r\nPI"[..]);

        match codec.decode_eof(&mut buf) {
            Err(Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn decode_eof_after_trailing_whitespace() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"+OK\r\n\r\n"[..]);

        assert_eq!(
            codec.decode_eof(&mut buf).unwrap(),
            Some(Frame::Simple("OK".to_string()))
        );
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn encode_frame() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();

        codec
            .encode(Frame::Bulk(Bytes::from("bar")), &mut buf)
            .unwrap();
        codec.encode(Frame::NullBulk, &mut buf).unwrap();

        assert_eq!(&buf[..], b"$3\r\nbar\r\n$-1\r\n");
    }
}
