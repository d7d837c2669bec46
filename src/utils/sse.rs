//! Bounded server-sent-events decoding: yields the accumulated `data:`
//! payload per event, stopping at `[DONE]`.

use futures_util::stream::{self, BoxStream};
use futures_util::TryStreamExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::io::StreamReader;

use crate::{JanusError, Result};

#[derive(Clone, Copy, Debug)]
pub struct SseLimits {
    pub max_line_bytes: usize,
    pub max_event_bytes: usize,
}

impl Default for SseLimits {
    fn default() -> Self {
        Self {
            max_line_bytes: 256 * 1024,
            max_event_bytes: 4 * 1024 * 1024,
        }
    }
}

async fn read_next_line_bytes_limited<R>(
    reader: &mut R,
    out: &mut Vec<u8>,
    max_bytes: usize,
) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    out.clear();

    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(!out.is_empty());
        }

        let newline_pos = buf.iter().position(|b| *b == b'\n');
        let take_len = newline_pos.map(|pos| pos + 1).unwrap_or(buf.len());

        if out.len().saturating_add(take_len) > max_bytes {
            return Err(JanusError::internal(format!(
                "sse line exceeds max_line_bytes={max_bytes}"
            )));
        }

        out.extend_from_slice(&buf[..take_len]);
        reader.consume(take_len);

        if newline_pos.is_some() {
            return Ok(true);
        }
    }
}

async fn read_next_sse_data<R>(
    reader: &mut R,
    line_bytes: &mut Vec<u8>,
    buffer: &mut String,
    limits: SseLimits,
) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buffer.clear();

    loop {
        let has_line =
            read_next_line_bytes_limited(reader, line_bytes, limits.max_line_bytes).await?;
        if !has_line {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Ok(Some(std::mem::take(buffer)));
        }

        let line = std::str::from_utf8(line_bytes)
            .map_err(|err| JanusError::internal(format!("invalid sse utf-8: {err}")))?;
        let line = line.trim_end_matches(['\r', '\n']);

        if line.is_empty() {
            if buffer.is_empty() {
                continue;
            }
            if buffer == "[DONE]" {
                return Ok(None);
            }
            return Ok(Some(std::mem::take(buffer)));
        }

        if let Some(rest) = line.strip_prefix("data:") {
            let rest = rest.trim_start();
            let separator_bytes = usize::from(!buffer.is_empty());
            if buffer
                .len()
                .saturating_add(separator_bytes)
                .saturating_add(rest.len())
                > limits.max_event_bytes
            {
                return Err(JanusError::internal(format!(
                    "sse event exceeds max_event_bytes={}",
                    limits.max_event_bytes
                )));
            }
            if separator_bytes == 1 {
                buffer.push('\n');
            }
            buffer.push_str(rest);
        }
    }
}

pub fn sse_data_stream_from_reader<R>(reader: R) -> BoxStream<'static, Result<String>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let limits = SseLimits::default();
    Box::pin(stream::try_unfold(
        (reader, Vec::<u8>::new(), String::new(), limits),
        |(mut reader, mut line_bytes, mut buffer, limits)| async move {
            match read_next_sse_data(&mut reader, &mut line_bytes, &mut buffer, limits).await? {
                Some(data) => Ok(Some((data, (reader, line_bytes, buffer, limits)))),
                None => Ok(None),
            }
        },
    ))
}

pub fn sse_data_stream_from_response(
    response: reqwest::Response,
) -> BoxStream<'static, Result<String>> {
    let byte_stream = response.bytes_stream().map_err(std::io::Error::other);
    let reader = StreamReader::new(byte_stream);
    sse_data_stream_from_reader(tokio::io::BufReader::new(reader))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::StreamExt;

    fn stream_of(sse: &str) -> BoxStream<'static, Result<String>> {
        let chunks = stream::iter([Ok::<_, std::io::Error>(Bytes::from(sse.to_owned()))]);
        let reader = StreamReader::new(chunks);
        sse_data_stream_from_reader(tokio::io::BufReader::new(reader))
    }

    #[tokio::test]
    async fn parses_data_lines_and_stops_at_done() -> Result<()> {
        let mut events = stream_of(concat!(
            "event: message\n",
            "data: {\"a\":1}\n\n",
            "data: line1\n",
            "data: line2\n\n",
            "data: [DONE]\n\n",
            "data: after-done\n\n",
        ));

        let mut out = Vec::new();
        while let Some(item) = events.next().await {
            out.push(item?);
        }
        assert_eq!(out, vec!["{\"a\":1}", "line1\nline2"]);
        Ok(())
    }

    #[tokio::test]
    async fn flushes_trailing_event_without_blank_line() -> Result<()> {
        let mut events = stream_of("data: tail");
        assert_eq!(events.next().await.unwrap()?, "tail");
        assert!(events.next().await.is_none());
        Ok(())
    }
}
