//! Content-Length framing over async byte streams.
//!
//! LSP frames every JSON-RPC message as `Content-Length: <n>\r\n\r\n`
//! followed by exactly `n` bytes of UTF-8 JSON. The codec is reliable and
//! order-preserving; the dispatch layer treats it as a pair of transforms
//! between frames and [`serde_json::Value`]s.

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Cap on a single frame body. Anything larger is a protocol violation.
const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Decodes framed messages from an async byte stream.
pub struct FrameReader<R> {
    input: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input: BufReader::new(input),
            line: String::new(),
        }
    }

    /// Decode the next message. `Ok(None)` means the stream ended cleanly
    /// at a frame boundary; EOF anywhere inside a frame is an error.
    pub async fn read_message(&mut self) -> Result<Option<serde_json::Value>> {
        let Some(len) = self.read_content_length().await? else {
            return Ok(None);
        };

        if len > MAX_FRAME_LEN {
            bail!("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit");
        }

        let mut body = vec![0u8; len];
        self.input
            .read_exact(&mut body)
            .await
            .context("reading frame body")?;

        serde_json::from_slice(&body)
            .context("decoding frame body as JSON")
            .map(Some)
    }

    /// Consume header lines up to the blank separator and return the
    /// announced body length, or `None` on EOF before any header byte.
    async fn read_content_length(&mut self) -> Result<Option<usize>> {
        let mut length = None;
        let mut at_frame_start = true;

        loop {
            self.line.clear();
            let n = self
                .input
                .read_line(&mut self.line)
                .await
                .context("reading frame header")?;
            if n == 0 {
                if at_frame_start {
                    return Ok(None);
                }
                bail!("stream ended inside frame headers");
            }
            at_frame_start = false;

            let header = self.line.trim_ascii();
            if header.is_empty() {
                break;
            }

            // Header names are case-insensitive; anything other than
            // Content-Length (e.g. Content-Type) is skipped.
            if let Some((name, rest)) = header.split_once(':') {
                if name.eq_ignore_ascii_case("Content-Length") {
                    length = Some(
                        rest.trim()
                            .parse::<usize>()
                            .with_context(|| format!("bad Content-Length {:?}", rest.trim()))?,
                    );
                }
            }
        }

        match length {
            Some(len) => Ok(Some(len)),
            None => bail!("frame headers carry no Content-Length"),
        }
    }
}

/// Encodes messages onto an async byte stream.
pub struct FrameWriter<W> {
    output: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(output: W) -> Self {
        Self { output }
    }

    /// Encode one message and flush it. Header and body go out as a
    /// single write so frames from one writer can never interleave.
    pub async fn write_message(&mut self, message: &serde_json::Value) -> Result<()> {
        let body = serde_json::to_vec(message).context("encoding frame body")?;
        let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
        frame.extend_from_slice(&body);

        self.output
            .write_all(&frame)
            .await
            .context("writing frame")?;
        self.output.flush().await.context("flushing frame")?;
        Ok(())
    }
}
