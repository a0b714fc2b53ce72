use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use uuid::Uuid;

use crate::codec::{self, FrameCodec};
use crate::config::DEFAULT_MAX_FRAME_SIZE;
use crate::frame::Frame;

/// Size of the read buffer allocated for every connection.
const READ_BUFFER_CAPACITY: usize = 4096;

/// One client's byte stream, read as frames and written as frames.
pub struct Connection {
    pub id: Uuid,
    // Data is read from the socket into the read buffer. When a frame is parsed, the corresponding
    // data is removed from the buffer.
    reader: FramedRead<OwnedReadHalf, FrameCodec>,
    writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Connection {
        Self::with_max_frame_size(stream, DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(stream: TcpStream, max_frame_size: usize) -> Connection {
        let (reader, writer) = stream.into_split();

        Connection {
            id: Uuid::new_v4(),
            reader: FramedRead::with_capacity(
                reader,
                FrameCodec::new(max_frame_size),
                READ_BUFFER_CAPACITY,
            ),
            writer: FramedWrite::new(writer, FrameCodec::new(max_frame_size)),
        }
    }

    /// Waits for the next complete frame.
    ///
    /// Returns `Ok(None)` when the peer closed the connection between frames. Closing it in the
    /// middle of a frame is an `UnexpectedEof` I/O error, and a frame that can't be decoded is a
    /// protocol error. After an error the connection can't be read from anymore.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, codec::Error> {
        self.reader.next().await.transpose()
    }

    /// Writes `frame` and flushes it to the socket.
    pub async fn write_frame(&mut self, frame: Frame) -> Result<(), codec::Error> {
        self.writer.send(frame).await
    }
}
