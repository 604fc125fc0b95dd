//! Line-oriented framing over a byte stream.
//!
//! Protocols handled by this daemon differ only in their line delimiter, so
//! the delimiter is a per-port configuration knob and all command/response
//! framing funnels through [`LineFramer::send`]: write the command plus the
//! configured ending, flush, then (optionally) read up to and including the
//! final byte of the ending, under the commander timeout.

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::transport::ByteStream;
use log::debug;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};

/// Per-port line delimiter choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineEnding {
    Cr,
    Lf,
    #[default]
    Crlf,
}

impl LineEnding {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            LineEnding::Cr => b"\r",
            LineEnding::Lf => b"\n",
            LineEnding::Crlf => b"\r\n",
        }
    }

    pub fn last_byte(&self) -> u8 {
        match self {
            LineEnding::Cr => b'\r',
            LineEnding::Lf | LineEnding::Crlf => b'\n',
        }
    }
}

/// Buffered line reader/writer over an opened byte stream.
pub struct LineFramer {
    reader: BufReader<ReadHalf<Box<dyn ByteStream>>>,
    writer: WriteHalf<Box<dyn ByteStream>>,
    ending: LineEnding,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl LineFramer {
    pub fn new(
        stream: Box<dyn ByteStream>,
        ending: LineEnding,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            ending,
            timeout,
            clock,
        }
    }

    /// Writes `command` terminated with the configured line ending and, when
    /// `read_response` is set, reads one response line within the commander
    /// timeout. The returned payload has the line ending stripped.
    pub async fn send(&mut self, command: &str, read_response: bool) -> Result<Vec<u8>> {
        debug!("send: {:?}", command);

        let write = async {
            self.writer.write_all(command.as_bytes()).await?;
            self.writer.write_all(self.ending.as_bytes()).await?;
            self.writer.flush().await
        };
        write.await.map_err(|err| match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Error::Timeout,
            _ => Error::Transport(format!("write error: {}", err)),
        })?;

        if !read_response {
            return Ok(Vec::new());
        }

        let mut line = Vec::new();
        let deadline = self.clock.sleep(self.timeout);
        let read = self.reader.read_until(self.ending.last_byte(), &mut line);
        tokio::select! {
            _ = deadline => return Err(Error::Timeout),
            result = read => {
                result.map_err(|err| match err.kind() {
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Error::Timeout,
                    _ => Error::Transport(format!("failed to read response: {}", err)),
                })?;
            }
        }
        if line.last() != Some(&self.ending.last_byte()) {
            // EOF before the delimiter arrived
            return Err(Error::Transport(
                "failed to read response: connection closed".into(),
            ));
        }

        debug!("send: resp for {:?}: {:?}", command, line);
        if line.ends_with(self.ending.as_bytes()) {
            line.truncate(line.len() - self.ending.as_bytes().len());
        } else {
            // allow responses to cmd + "\r\n" to end with just "\n"
            line.pop();
        }
        Ok(line)
    }
}
