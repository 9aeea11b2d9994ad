use tokio::net::TcpStream;

use super::{pump_channels, Channel, Pump};
use crate::client::Client;

pub const NAME: &str = "buffer";

const BUFFER_SIZE: usize = 16 * 1024;

/// Copies through a userspace buffer per direction. Works everywhere.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferPump;

impl Pump for BufferPump {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn relay(&self, client: &mut Client) -> crate::Result<()> {
        pump_channels(client, Buffer::new(), Buffer::new()).await
    }
}

struct Buffer {
    buf: Box<[u8]>,
    pos: usize,
    cap: usize,
}

impl Buffer {
    fn new() -> Self {
        Self {
            buf: vec![0; BUFFER_SIZE].into_boxed_slice(),
            pos: 0,
            cap: 0,
        }
    }
}

impl Channel for Buffer {
    fn has_room(&self) -> bool {
        self.cap < self.buf.len() || self.pos > 0
    }

    fn has_pending(&self) -> bool {
        self.pos < self.cap
    }

    fn fill(&mut self, from: &TcpStream) -> std::io::Result<usize> {
        if self.pos > 0 {
            self.buf.copy_within(self.pos..self.cap, 0);
            self.cap -= self.pos;
            self.pos = 0;
        }
        let n = from.try_read(&mut self.buf[self.cap..])?;
        self.cap += n;
        Ok(n)
    }

    fn drain(&mut self, to: &TcpStream) -> std::io::Result<usize> {
        let n = to.try_write(&self.buf[self.pos..self.cap])?;
        self.pos += n;
        if self.pos == self.cap {
            self.pos = 0;
            self.cap = 0;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let outside = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (inside, _) = listener.accept().await.unwrap();
        (outside, inside)
    }

    #[tokio::test]
    async fn carries_bytes_in_order() {
        let (mut writer, source) = socket_pair().await;
        let (mut reader, sink) = socket_pair().await;
        let mut buffer = Buffer::new();
        assert!(buffer.has_room());
        assert!(!buffer.has_pending());

        writer.write_all(b"hello ").await.unwrap();
        source.readable().await.unwrap();
        assert_eq!(buffer.fill(&source).unwrap(), 6);
        assert!(buffer.has_pending());

        sink.writable().await.unwrap();
        assert_eq!(buffer.drain(&sink).unwrap(), 6);
        assert!(!buffer.has_pending());

        let mut out = [0; 6];
        reader.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hello ");
    }

    #[tokio::test]
    async fn end_of_stream_reads_zero() {
        let (writer, source) = socket_pair().await;
        drop(writer);

        let mut buffer = Buffer::new();
        source.readable().await.unwrap();
        assert_eq!(buffer.fill(&source).unwrap(), 0);
    }

    #[test]
    fn full_buffer_has_no_room_until_drained() {
        let mut buffer = Buffer::new();
        buffer.cap = BUFFER_SIZE;
        assert!(!buffer.has_room());

        buffer.pos = 1;
        assert!(buffer.has_room());
    }
}
