//! Line protocol reader
//!
//! Reads raw-socket clients (telnet, netcat) byte by byte, strips telnet
//! IAC sequences and performs local line editing. Printable ASCII is echoed;
//! UTF-8 bytes are kept in the line but not echoed.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};

use crate::writer::SharedWriter;

/// Telnet "interpret as command" marker
const IAC: u8 = 0xFF;
const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7F;

/// Erase the character left of the cursor
const ERASE: &[u8] = b"\x08 \x08";
const NEWLINE: &[u8] = b"\r\n";

/// Line editor over one connection's read half
pub struct LineReader<R, W> {
    reader: BufReader<R>,
    echo: SharedWriter<W>,
    line: Vec<u8>,
    max_len: usize,
}

impl<R, W> LineReader<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, echo: SharedWriter<W>, max_len: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            echo,
            line: Vec::new(),
            max_len,
        }
    }

    /// Read the next complete line
    ///
    /// Returns `Ok(None)` once the peer closes. Bytes of an unterminated
    /// line are discarded at that point.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            let byte = match self.reader.read_u8().await {
                Ok(b) => b,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e),
            };

            match byte {
                IAC => {
                    // Command byte plus option byte
                    for _ in 0..2 {
                        match self.reader.read_u8().await {
                            Ok(_) => {}
                            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
                            Err(e) => return Err(e),
                        }
                    }
                }
                b'\n' => {
                    self.echo.write_all(NEWLINE).await?;
                    let line = String::from_utf8_lossy(&self.line).into_owned();
                    self.line.clear();
                    return Ok(Some(line));
                }
                b'\r' => {}
                BACKSPACE | DELETE => {
                    // Only ASCII was echoed, so only ASCII needs erasing
                    if self.pop_char().is_some_and(|lead| lead.is_ascii()) {
                        self.echo.write_all(ERASE).await?;
                    }
                }
                0x20..=0x7E => {
                    if self.line.len() < self.max_len {
                        self.line.push(byte);
                        self.echo.write_all(&[byte]).await?;
                    }
                }
                // UTF-8 lead and continuation bytes are kept but not echoed
                0x80..=0xFE => {
                    if self.line.len() < self.max_len {
                        self.line.push(byte);
                    }
                }
                _ => {}
            }
        }
    }

    /// Drop the last character, returning its first byte
    fn pop_char(&mut self) -> Option<u8> {
        while let Some(byte) = self.line.pop() {
            if byte & 0xC0 != 0x80 {
                return Some(byte);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    use super::*;

    struct Harness {
        reader: LineReader<DuplexStream, DuplexStream>,
        peer_in: DuplexStream,
        echo_out: DuplexStream,
    }

    fn harness(max_len: usize) -> Harness {
        let (peer_in, server_rd) = duplex(1024);
        let (echo_sink, echo_out) = duplex(1024);
        Harness {
            reader: LineReader::new(server_rd, SharedWriter::new(echo_sink), max_len),
            peer_in,
            echo_out,
        }
    }

    async fn echoed(h: &mut Harness, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        h.echo_out.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_plain_line_with_echo() {
        let mut h = harness(64);
        h.peer_in.write_all(b"hello\r\n").await.unwrap();
        assert_eq!(h.reader.next_line().await.unwrap().as_deref(), Some("hello"));
        assert_eq!(echoed(&mut h, 7).await, b"hello\r\n");
    }

    #[tokio::test]
    async fn test_iac_sequences_stripped() {
        let mut h = harness(64);
        h.peer_in
            .write_all(&[0xFF, 0xFB, 0x1F, b'h', b'i', 0xFF, 0xFD, 0x03, b'\n'])
            .await
            .unwrap();
        assert_eq!(h.reader.next_line().await.unwrap().as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn test_backspace_edits_line() {
        let mut h = harness(64);
        h.peer_in.write_all(b"cat\x7f\x7fow\x08w\n").await.unwrap();
        assert_eq!(h.reader.next_line().await.unwrap().as_deref(), Some("cow"));

        let mut expected = b"cat".to_vec();
        expected.extend_from_slice(ERASE);
        expected.extend_from_slice(ERASE);
        expected.extend_from_slice(b"ow");
        expected.extend_from_slice(ERASE);
        expected.extend_from_slice(b"w\r\n");
        assert_eq!(echoed(&mut h, expected.len()).await, expected);
    }

    #[tokio::test]
    async fn test_backspace_on_empty_line_is_silent() {
        let mut h = harness(64);
        h.peer_in.write_all(b"\x08x\n").await.unwrap();
        assert_eq!(h.reader.next_line().await.unwrap().as_deref(), Some("x"));
        assert_eq!(echoed(&mut h, 3).await, b"x\r\n");
    }

    #[tokio::test]
    async fn test_control_bytes_dropped_and_length_capped() {
        let mut h = harness(3);
        h.peer_in.write_all(b"a\tbcdef\n").await.unwrap();
        assert_eq!(h.reader.next_line().await.unwrap().as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_utf8_kept_without_echo() {
        let mut h = harness(64);
        h.peer_in
            .write_all("café 👋\r\n".as_bytes())
            .await
            .unwrap();
        assert_eq!(h.reader.next_line().await.unwrap().as_deref(), Some("café 👋"));
        assert_eq!(echoed(&mut h, 6).await, b"caf \r\n");
    }

    #[tokio::test]
    async fn test_backspace_removes_whole_utf8_char() {
        let mut h = harness(64);
        h.peer_in.write_all("caf\u{e9}\x7fe!\x7f\n".as_bytes()).await.unwrap();
        assert_eq!(h.reader.next_line().await.unwrap().as_deref(), Some("cafe"));

        let mut expected = b"cafe!".to_vec();
        expected.extend_from_slice(ERASE);
        expected.extend_from_slice(b"\r\n");
        assert_eq!(echoed(&mut h, expected.len()).await, expected);
    }

    #[tokio::test]
    async fn test_eof_ends_reader() {
        let mut h = harness(64);
        h.peer_in.write_all(b"one\npartial").await.unwrap();
        drop(h.peer_in);
        assert_eq!(h.reader.next_line().await.unwrap().as_deref(), Some("one"));
        assert_eq!(h.reader.next_line().await.unwrap(), None);
    }
}
