use std::fmt::Write as _;
use std::io;

use arrayvec::ArrayString;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{server::TlsStream, TlsAcceptor};

const READ_CHUNK: usize = 8192;

/// Result of reading one line from the peer.
#[derive(Debug, PartialEq, Eq)]
pub enum Line {
    Complete(Vec<u8>),
    /// The line exceeded the caller's limit. Its bytes were consumed and
    /// dropped up to and including the terminator.
    TooLong,
    /// The peer closed the connection.
    Eof,
}

enum Transport<Stream: AsyncRead + AsyncWrite + Unpin + Send> {
    Plain(Stream),
    Tls(Box<TlsStream<Stream>>),
    /// Transient state while a STARTTLS handshake is in flight.
    Detached,
}

/// A line-oriented client connection, plain or TLS.
///
/// Lines are CRLF terminated; a bare LF is accepted leniently. Replies are
/// formatted into a bounded stack buffer, which also enforces the reply
/// line limit.
pub struct Connection<Stream: AsyncRead + AsyncWrite + Unpin + Send> {
    transport: Transport<Stream>,
    buf: Vec<u8>,
    start: usize,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Connection<Stream> {
    pub fn plain(stream: Stream) -> Self {
        Self {
            transport: Transport::Plain(stream),
            buf: Vec::new(),
            start: 0,
        }
    }

    pub fn tls(stream: TlsStream<Stream>) -> Self {
        Self {
            transport: Transport::Tls(Box::new(stream)),
            buf: Vec::new(),
            start: 0,
        }
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self.transport, Transport::Tls(_))
    }

    /// Reads one line of at most `limit` bytes, terminator included.
    ///
    /// A longer line is consumed through its terminator and reported as
    /// [`Line::TooLong`] without retaining its content.
    pub async fn read_line(&mut self, limit: usize) -> io::Result<Line> {
        let mut overlong = false;
        loop {
            if let Some(offset) = self.buf[self.start..].iter().position(|&b| b == b'\n') {
                let end = self.start + offset;
                let mut line = self.buf[self.start..end].to_vec();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                self.consume(end + 1);
                if overlong || line.len() + 2 > limit {
                    return Ok(Line::TooLong);
                }
                return Ok(Line::Complete(line));
            }

            if self.buf.len() - self.start > limit {
                overlong = true;
                self.buf.clear();
                self.start = 0;
            }

            if self.fill().await? == 0 {
                return Ok(Line::Eof);
            }
        }
    }

    /// Writes one CRLF-terminated reply line.
    pub async fn send<S: core::fmt::Display + Send + Sync>(
        &mut self,
        response: &S,
    ) -> io::Result<usize> {
        let mut buffer = ArrayString::<512>::new();
        write!(&mut buffer, "{response}\r\n")
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "reply line too long"))?;
        self.write_all(buffer.as_bytes()).await?;
        Ok(buffer.len())
    }

    /// Upgrades a plain connection to TLS in place. An already upgraded
    /// connection is left untouched.
    ///
    /// On handshake failure the connection is unusable and every later
    /// operation fails with `NotConnected`.
    pub async fn upgrade(&mut self, acceptor: &TlsAcceptor) -> io::Result<()> {
        match std::mem::replace(&mut self.transport, Transport::Detached) {
            Transport::Plain(stream) => {
                let stream = acceptor.accept(stream).await?;
                self.transport = Transport::Tls(Box::new(stream));
                self.buf.clear();
                self.start = 0;
                Ok(())
            }
            other => {
                self.transport = other;
                Ok(())
            }
        }
    }

    async fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let read = match &mut self.transport {
            Transport::Plain(stream) => stream.read(&mut chunk).await?,
            Transport::Tls(stream) => stream.read(&mut chunk).await?,
            Transport::Detached => return Err(detached()),
        };
        self.buf.extend_from_slice(&chunk[..read]);
        Ok(read)
    }

    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        match &mut self.transport {
            Transport::Plain(stream) => {
                stream.write_all(bytes).await?;
                stream.flush().await
            }
            Transport::Tls(stream) => {
                stream.write_all(bytes).await?;
                stream.flush().await
            }
            Transport::Detached => Err(detached()),
        }
    }

    fn consume(&mut self, up_to: usize) {
        self.start = up_to;
        if self.start >= self.buf.len() {
            self.buf.clear();
            self.start = 0;
        } else if self.start > READ_CHUNK {
            self.buf.drain(..self.start);
            self.start = 0;
        }
    }
}

fn detached() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection lost during TLS upgrade")
}

#[cfg(test)]
mod test {
    use tokio::io::AsyncWriteExt;

    use super::{Connection, Line};

    #[tokio::test]
    async fn reads_crlf_lines() {
        let (client, server) = tokio::io::duplex(256);
        let mut connection = Connection::plain(server);
        let mut client = client;

        client.write_all(b"HELO one\r\nNOOP\r\n").await.unwrap();

        assert_eq!(
            connection.read_line(512).await.unwrap(),
            Line::Complete(b"HELO one".to_vec())
        );
        assert_eq!(
            connection.read_line(512).await.unwrap(),
            Line::Complete(b"NOOP".to_vec())
        );
    }

    #[tokio::test]
    async fn bare_lf_is_accepted() {
        let (client, server) = tokio::io::duplex(256);
        let mut connection = Connection::plain(server);
        let mut client = client;

        client.write_all(b"QUIT\n").await.unwrap();
        assert_eq!(
            connection.read_line(512).await.unwrap(),
            Line::Complete(b"QUIT".to_vec())
        );
    }

    #[tokio::test]
    async fn overlong_line_is_consumed_and_flagged() {
        let (client, server) = tokio::io::duplex(4096);
        let mut connection = Connection::plain(server);
        let mut client = client;

        let long = vec![b'a'; 600];
        client.write_all(&long).await.unwrap();
        client.write_all(b"\r\nNOOP\r\n").await.unwrap();

        assert_eq!(connection.read_line(512).await.unwrap(), Line::TooLong);
        assert_eq!(
            connection.read_line(512).await.unwrap(),
            Line::Complete(b"NOOP".to_vec())
        );
    }

    #[tokio::test]
    async fn eof_is_reported() {
        let (client, server) = tokio::io::duplex(256);
        let mut connection = Connection::plain(server);
        drop(client);

        assert_eq!(connection.read_line(512).await.unwrap(), Line::Eof);
    }

    #[tokio::test]
    async fn replies_are_crlf_terminated() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut connection = Connection::plain(server);

        let written = connection.send(&"220 example ESMTP Blackhole").await.unwrap();
        assert_eq!(written, 29);

        let mut received = vec![0u8; written];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut received)
            .await
            .unwrap();
        assert_eq!(&received, b"220 example ESMTP Blackhole\r\n");
    }
}
