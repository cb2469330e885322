//! Framing for the service's stdio streams.
//!
//! The service answers with `Content-Length: N\r\n\r\n{json}` frames on
//! stdout and reads one JSON object per line on stdin. [`FrameReader`]
//! decodes the former, [`LineWriter`] produces the latter.

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Maximum frame size (16 MiB); project-wide diagnostics can be large.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Reads `Content-Length` framed JSON messages from an async reader.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: String::new(),
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on EOF between frames (clean shutdown).
    /// Returns `Err` on malformed headers, oversized frames or bad JSON.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>> {
        let Some(length) = self.read_header_block().await? else {
            return Ok(None);
        };
        if length > MAX_FRAME_BYTES {
            bail!("Content-Length {length} exceeds maximum {MAX_FRAME_BYTES}");
        }

        let mut body = vec![0u8; length];
        self.reader
            .read_exact(&mut body)
            .await
            .context("reading frame body")?;

        // The body carries a trailing newline; serde_json accepts trailing whitespace.
        let value = serde_json::from_slice(&body).context("parsing service frame")?;
        Ok(Some(value))
    }

    /// Consume header lines up to the blank separator and return the length.
    async fn read_header_block(&mut self) -> Result<Option<usize>> {
        let mut length = None;
        let mut started = false;

        loop {
            self.line.clear();
            let n = self
                .reader
                .read_line(&mut self.line)
                .await
                .context("reading header line")?;
            if n == 0 {
                if started {
                    bail!("unexpected EOF while reading headers");
                }
                return Ok(None);
            }

            let header = self.line.trim();
            if header.is_empty() {
                // Stray blank lines between frames are not a header block yet.
                if !started {
                    continue;
                }
                break;
            }
            started = true;

            if let Some((name, value)) = header.split_once(':')
                && name.trim().eq_ignore_ascii_case("Content-Length")
            {
                length = Some(
                    value
                        .trim()
                        .parse::<usize>()
                        .context("invalid Content-Length value")?,
                );
            }
        }

        match length {
            Some(len) => Ok(Some(len)),
            None => bail!("missing Content-Length header"),
        }
    }
}

/// Writes one JSON message per line to an async writer.
pub struct LineWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Serialize `msg` as a single line and flush it.
    pub async fn write_message(&mut self, msg: &serde_json::Value) -> Result<()> {
        // serde_json never emits raw newlines inside a compact document.
        let mut line = serde_json::to_string(msg).context("serializing service message")?;
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .await
            .context("writing service message")?;
        self.writer.flush().await.context("flushing service message")?;
        Ok(())
    }
}
