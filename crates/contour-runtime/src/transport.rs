use contour_types::Frame;
use contour_wire::{FrameCodec, Framing, WireError};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Frame-level view of one backend transport.
pub struct Channel {
    sender: FrameSender,
    receiver: FrameReceiver,
}

impl Channel {
    pub fn new<R, W>(reader: R, writer: W, framing: Framing, max_frame_bytes: usize) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader: BoxedReader = Box::new(reader);
        let writer: BoxedWriter = Box::new(writer);
        Self {
            sender: FrameSender {
                inner: FramedWrite::new(writer, FrameCodec::new(framing, max_frame_bytes)),
            },
            receiver: FrameReceiver {
                inner: FramedRead::new(reader, FrameCodec::new(framing, max_frame_bytes)),
            },
        }
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<(), WireError> {
        self.sender.send(frame).await
    }

    pub async fn receive(&mut self) -> Option<Result<Frame, WireError>> {
        self.receiver.receive().await
    }

    pub fn split(self) -> (FrameSender, FrameReceiver) {
        (self.sender, self.receiver)
    }
}

pub struct FrameSender {
    inner: FramedWrite<BoxedWriter, FrameCodec>,
}

impl FrameSender {
    /// Writes and flushes one frame.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), WireError> {
        self.inner.send(frame).await
    }

    /// Flushes and shuts down the write half, signalling end of input to the backend.
    pub async fn close(&mut self) -> Result<(), WireError> {
        SinkExt::<&Frame>::close(&mut self.inner).await
    }
}

pub struct FrameReceiver {
    inner: FramedRead<BoxedReader, FrameCodec>,
}

impl FrameReceiver {
    /// Next decoded frame; `None` once the transport is closed.
    pub async fn receive(&mut self) -> Option<Result<Frame, WireError>> {
        self.inner.next().await
    }
}
