//! Newline-delimited JSON framing for the push stream.
//!
//! Wire format: one JSON object per line, `\n` terminated (`\r\n` tolerated).
//! HTTP chunk boundaries are arbitrary, so partial lines are buffered until
//! their terminator arrives.

use crate::error::SyncError;

/// Default maximum frame size (1 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Incremental line splitter over a byte stream.
#[derive(Debug)]
pub struct LineDecoder {
    buf: Vec<u8>,
    max_frame_bytes: usize,
    /// Set after an oversized line was reported; bytes are dropped until the
    /// next newline.
    discarding: bool,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl LineDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_bytes,
            discarding: false,
        }
    }

    /// Feed a chunk and return every line it completed, in order.
    ///
    /// An oversized line yields one `FrameTooLarge` error in its place;
    /// decoding resumes at the following line.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<String, SyncError>> {
        let mut out = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (line, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.discarding {
                self.discarding = false;
                continue;
            }

            self.buf.extend_from_slice(line);
            let frame = std::mem::take(&mut self.buf);
            if frame.len() > self.max_frame_bytes {
                out.push(Err(SyncError::FrameTooLarge {
                    len: frame.len(),
                    max: self.max_frame_bytes,
                }));
                continue;
            }
            out.push(decode_line(frame));
        }

        if !self.discarding {
            self.buf.extend_from_slice(rest);
            if self.buf.len() > self.max_frame_bytes {
                out.push(Err(SyncError::FrameTooLarge {
                    len: self.buf.len(),
                    max: self.max_frame_bytes,
                }));
                self.buf.clear();
                self.discarding = true;
            }
        }

        out
    }

    /// Flush a trailing unterminated line when the stream ends.
    pub fn finish(&mut self) -> Option<Result<String, SyncError>> {
        let discarding = std::mem::take(&mut self.discarding);
        let frame = std::mem::take(&mut self.buf);
        if discarding || frame.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        Some(decode_line(frame))
    }

    /// Bytes currently buffered for an incomplete line.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

fn decode_line(mut frame: Vec<u8>) -> Result<String, SyncError> {
    if frame.last() == Some(&b'\r') {
        frame.pop();
    }
    String::from_utf8(frame).map_err(|e| SyncError::Frame(format!("invalid utf-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_lines(results: Vec<Result<String, SyncError>>) -> Vec<String> {
        results.into_iter().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn splits_complete_lines() {
        let mut dec = LineDecoder::default();
        let lines = ok_lines(dec.push(b"{\"a\":1}\n{\"b\":2}\n"));
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(dec.pending_len(), 0);
    }

    #[test]
    fn buffers_partial_lines_across_chunks() {
        let mut dec = LineDecoder::default();
        assert!(dec.push(b"{\"a\":").is_empty());
        assert_eq!(dec.pending_len(), 5);
        let lines = ok_lines(dec.push(b"1}\n{\"b\""));
        assert_eq!(lines, vec!["{\"a\":1}"]);
        let lines = ok_lines(dec.push(b":2}\n"));
        assert_eq!(lines, vec!["{\"b\":2}"]);
    }

    #[test]
    fn strips_carriage_returns() {
        let mut dec = LineDecoder::default();
        let lines = ok_lines(dec.push(b"one\r\ntwo\r\n"));
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[test]
    fn oversized_line_is_reported_once_and_skipped() {
        let mut dec = LineDecoder::new(8);
        let out = dec.push(b"0123456789abc");
        assert_eq!(out.len(), 1);
        assert!(matches!(
            out[0],
            Err(SyncError::FrameTooLarge { len: 13, max: 8 })
        ));

        // Rest of the oversized line is discarded, next line decodes.
        let lines = ok_lines(dec.push(b"def\nok\n"));
        assert_eq!(lines, vec!["ok"]);
    }

    #[test]
    fn oversized_line_within_one_chunk() {
        let mut dec = LineDecoder::new(4);
        let out = dec.push(b"toolong\nfine\n");
        assert_eq!(out.len(), 2);
        assert!(out[0].is_err());
        assert_eq!(out[1].as_deref().unwrap(), "fine");
    }

    #[test]
    fn invalid_utf8_is_a_frame_error() {
        let mut dec = LineDecoder::default();
        let out = dec.push(&[0xff, 0xfe, b'\n']);
        assert!(matches!(out[0], Err(SyncError::Frame(_))));
    }

    #[test]
    fn finish_flushes_trailing_line() {
        let mut dec = LineDecoder::default();
        assert!(dec.push(b"{\"tail\":true}").is_empty());
        assert_eq!(dec.finish().unwrap().unwrap(), "{\"tail\":true}");
        assert!(dec.finish().is_none());
    }

    #[test]
    fn finish_ignores_whitespace() {
        let mut dec = LineDecoder::default();
        dec.push(b"  ");
        assert!(dec.finish().is_none());
    }
}
