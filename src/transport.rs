//! Content-Length framed JSON messages over a byte stream. Deliberately
//! thin: one reader, one writer function, no dispatch logic.

use std::io::{BufRead, Write};

use anyhow::anyhow;
use serde::Serialize;
use serde_json::Value;

pub struct FramedReader<R> {
    reader: R,
}

impl<R: BufRead> FramedReader<R> {
    pub fn new(reader: R) -> Self {
        FramedReader { reader }
    }

    /// Read one framed message. `Err` means the stream is unusable
    /// (closed or corrupt framing).
    pub fn read_message(&mut self) -> anyhow::Result<Value> {
        let mut content_length: Option<usize> = None;
        loop {
            let mut line = String::new();
            let read_n = self.reader.read_line(&mut line)?;
            if read_n == 0 {
                return Err(anyhow!("connection closed"));
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            if let Some(value) = line.strip_prefix("Content-Length:") {
                content_length = Some(value.trim().parse()?);
            }
        }

        let len = content_length.ok_or_else(|| anyhow!("missing Content-Length header"))?;
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf)?;
        Ok(serde_json::from_slice(&buf)?)
    }
}

pub fn write_message<W: Write>(writer: &mut W, message: &impl Serialize) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(message)?;
    write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}
