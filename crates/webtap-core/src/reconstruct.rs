//! HTTP/1.1 response reconstruction from raw socket bytes.
//!
//! The MITM session taps the server→client byte stream in whatever pieces the
//! socket hands out. [`ResponseReconstructor`] turns those pieces back into
//! logical body data: it splits the header block from the body, follows
//! `Transfer-Encoding: chunked` framing (or `Content-Length`) and reports
//! every complete body segment as a [`Frame::Data`].
//!
//! Malformed chunk framing does not fail the session. The whole state is
//! dropped and the next bytes are treated as the start of a new response,
//! which tolerates pipelined responses overlapping on one connection.

use tracing::{trace, warn};

/// Longest chunk-size line accepted before the framing is considered broken.
const MAX_CHUNK_SIZE_LINE: usize = 1024;

/// Output of one [`ResponseReconstructor::push`] step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Decoded body bytes, in arrival order.
    Data(Vec<u8>),
    /// The current response is complete; state was reset for the next one.
    End,
    /// Framing was malformed; state was reset and buffered bytes discarded.
    Reset,
}

/// How the body of the current response is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Chunked,
    Length(usize),
    UntilClose,
}

/// What the body drain wants the push loop to do next.
enum Next {
    Wait,
    Response(Vec<u8>),
}

/// Incremental HTTP/1.1 response reconstructor.
#[derive(Debug, Clone)]
pub struct ResponseReconstructor {
    header_complete: bool,
    header: Vec<u8>,
    body: Vec<u8>,
    framing: Option<Framing>,
    gzip: bool,
}

impl Default for ResponseReconstructor {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseReconstructor {
    /// Creates a reconstructor waiting for a response header.
    pub fn new() -> Self {
        Self {
            header_complete: false,
            header: Vec::new(),
            body: Vec::new(),
            framing: None,
            gzip: false,
        }
    }

    /// Returns true once the current response's header block is complete.
    pub fn header_complete(&self) -> bool {
        self.header_complete
    }

    /// Returns true if the chunked framing was detected for the current response.
    pub fn is_chunked(&self) -> bool {
        self.framing == Some(Framing::Chunked)
    }

    /// Returns true if the most recent response header announced gzip content.
    ///
    /// This survives the end-of-response reset so the accumulated body can
    /// still be decompressed when the session closes.
    pub fn is_gzip(&self) -> bool {
        self.gzip
    }

    /// Feeds raw bytes read from the server side of the connection.
    pub fn push(&mut self, data: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut pending = data.to_vec();

        loop {
            if !self.header_complete {
                let search_from = self.header.len().saturating_sub(3);
                self.header.append(&mut pending);

                let Some(idx) = find(&self.header[search_from..], b"\r\n\r\n") else {
                    break;
                };
                let end = search_from + idx;
                pending = self.header.split_off(end + 4);
                self.header.truncate(end);
                self.header_complete = true;
                self.read_header();
                trace!(framing = ?self.framing, gzip = self.gzip, "response header complete");
            }

            self.body.append(&mut pending);
            match self.drain_body(&mut frames) {
                Next::Wait => break,
                Next::Response(rest) if rest.is_empty() => break,
                Next::Response(rest) => pending = rest,
            }
        }

        frames
    }

    /// Drops all per-response state.
    pub fn reset(&mut self) {
        self.header_complete = false;
        self.header.clear();
        self.body.clear();
        self.framing = None;
    }

    fn read_header(&mut self) {
        let text = String::from_utf8_lossy(&self.header);
        let mut lines = text.split("\r\n");

        let status = lines
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|code| code.parse::<u16>().ok());

        let mut chunked = false;
        let mut content_length = None;
        let mut gzip = false;

        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim();
            let value = value.trim();

            if name.eq_ignore_ascii_case("transfer-encoding") {
                chunked = value.to_ascii_lowercase().contains("chunked");
            } else if name.eq_ignore_ascii_case("content-length") {
                content_length = value.parse::<usize>().ok();
            } else if name.eq_ignore_ascii_case("content-encoding") {
                gzip = value.to_ascii_lowercase().contains("gzip");
            }
        }

        let bodiless = matches!(status, Some(100..=199 | 204 | 304));
        self.framing = Some(if bodiless {
            Framing::Length(0)
        } else if chunked {
            Framing::Chunked
        } else if let Some(len) = content_length {
            Framing::Length(len)
        } else {
            Framing::UntilClose
        });
        self.gzip = gzip;
    }

    fn drain_body(&mut self, frames: &mut Vec<Frame>) -> Next {
        match self.framing {
            Some(Framing::Chunked) => self.drain_chunks(frames),
            Some(Framing::Length(remaining)) => {
                let take = remaining.min(self.body.len());
                if take > 0 {
                    let rest = self.body.split_off(take);
                    frames.push(Frame::Data(std::mem::replace(&mut self.body, rest)));
                }
                let remaining = remaining - take;
                if remaining > 0 {
                    self.framing = Some(Framing::Length(remaining));
                    return Next::Wait;
                }
                self.finish_response(frames)
            }
            Some(Framing::UntilClose) | None => {
                if !self.body.is_empty() {
                    frames.push(Frame::Data(std::mem::take(&mut self.body)));
                }
                Next::Wait
            }
        }
    }

    fn drain_chunks(&mut self, frames: &mut Vec<Frame>) -> Next {
        loop {
            let Some(line_end) = find(&self.body, b"\r\n") else {
                if self.body.len() > MAX_CHUNK_SIZE_LINE {
                    warn!("chunk size line too long, resetting response state");
                    return self.malformed(frames);
                }
                return Next::Wait;
            };

            let Some(size) = parse_chunk_size(&self.body[..line_end]) else {
                warn!(
                    "parsing chunked length failed: {:?}",
                    String::from_utf8_lossy(&self.body[..line_end.min(32)])
                );
                return self.malformed(frames);
            };

            let data_start = line_end + 2;

            if size == 0 {
                let tail = &self.body[data_start..];
                let end = if tail.starts_with(b"\r\n") {
                    data_start + 2
                } else {
                    match find(tail, b"\r\n\r\n") {
                        Some(idx) => data_start + idx + 4,
                        None => return Next::Wait,
                    }
                };
                self.body.drain(..end);
                return self.finish_response(frames);
            }

            let Some(frame_end) = data_start
                .checked_add(size)
                .and_then(|end| end.checked_add(2))
            else {
                warn!("chunk length {size:#x} overflows, resetting response state");
                return self.malformed(frames);
            };
            let data_end = frame_end - 2;
            if self.body.len() < frame_end {
                return Next::Wait;
            }
            if &self.body[data_end..frame_end] != b"\r\n" {
                warn!("chunk of {size} bytes not followed by CRLF, resetting response state");
                return self.malformed(frames);
            }

            let chunk = self.body[data_start..data_end].to_vec();
            self.body.drain(..frame_end);
            frames.push(Frame::Data(chunk));
        }
    }

    fn finish_response(&mut self, frames: &mut Vec<Frame>) -> Next {
        let rest = std::mem::take(&mut self.body);
        self.reset();
        frames.push(Frame::End);
        Next::Response(rest)
    }

    fn malformed(&mut self, frames: &mut Vec<Frame>) -> Next {
        self.reset();
        frames.push(Frame::Reset);
        Next::Wait
    }
}

/// Parses a chunk-size line, ignoring chunk extensions.
fn parse_chunk_size(line: &[u8]) -> Option<usize> {
    let line = std::str::from_utf8(line).ok()?;
    let size = line.split(';').next()?.trim();
    if size.is_empty() || !size.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    usize::from_str_radix(size, 16).ok()
}

/// Finds the first occurrence of `needle` in `haystack`.
pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNKED_HEADER: &str =
        "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nTransfer-Encoding: chunked\r\n\r\n";

    fn chunked_response(segments: &[&str]) -> Vec<u8> {
        let mut raw = CHUNKED_HEADER.as_bytes().to_vec();
        for segment in segments {
            raw.extend_from_slice(format!("{:x}\r\n{}\r\n", segment.len(), segment).as_bytes());
        }
        raw.extend_from_slice(b"0\r\n\r\n");
        raw
    }

    fn body_of(frames: &[Frame]) -> Vec<u8> {
        frames
            .iter()
            .filter_map(|frame| match frame {
                Frame::Data(data) => Some(data.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn decodes_chunked_body_in_one_write() {
        let raw = chunked_response(&["data: a\n\n", "data: bc\n\n"]);
        let mut reconstructor = ResponseReconstructor::new();
        let frames = reconstructor.push(&raw);

        assert_eq!(body_of(&frames), b"data: a\n\ndata: bc\n\n");
        assert_eq!(frames.last(), Some(&Frame::End));
        assert!(!reconstructor.header_complete());
    }

    #[test]
    fn byte_by_byte_matches_contiguous_write() {
        let raw = chunked_response(&["hello ", "chunked ", "world"]);

        let mut whole = ResponseReconstructor::new();
        let expected = body_of(&whole.push(&raw));

        let mut split = ResponseReconstructor::new();
        let mut frames = Vec::new();
        for byte in &raw {
            frames.extend(split.push(std::slice::from_ref(byte)));
        }

        assert_eq!(body_of(&frames), expected);
        assert_eq!(expected, b"hello chunked world");
        assert_eq!(frames.iter().filter(|f| **f == Frame::End).count(), 1);
    }

    #[test]
    fn every_two_way_split_matches_contiguous_write() {
        let raw = chunked_response(&["abc", "defghijklmnop", "q"]);
        let expected = b"abcdefghijklmnopq".to_vec();

        for split_at in 0..=raw.len() {
            let mut reconstructor = ResponseReconstructor::new();
            let mut frames = reconstructor.push(&raw[..split_at]);
            frames.extend(reconstructor.push(&raw[split_at..]));
            assert_eq!(body_of(&frames), expected, "split at {split_at}");
        }
    }

    #[test]
    fn chunk_is_held_until_trailing_crlf_arrives() {
        let mut reconstructor = ResponseReconstructor::new();
        let mut raw = CHUNKED_HEADER.as_bytes().to_vec();
        raw.extend_from_slice(b"5\r\nhello");

        assert!(reconstructor.push(&raw).is_empty());
        assert_eq!(
            reconstructor.push(b"\r\n"),
            vec![Frame::Data(b"hello".to_vec())]
        );
    }

    #[test]
    fn non_hex_length_resets_state() {
        let mut reconstructor = ResponseReconstructor::new();
        let mut raw = CHUNKED_HEADER.as_bytes().to_vec();
        raw.extend_from_slice(b"zz\r\ngarbage\r\n");

        let frames = reconstructor.push(&raw);
        assert_eq!(frames, vec![Frame::Reset]);
        assert!(!reconstructor.header_complete());
        assert!(!reconstructor.is_chunked());

        // The connection keeps working for the next response.
        let frames = reconstructor.push(&chunked_response(&["ok"]));
        assert_eq!(body_of(&frames), b"ok");
    }

    #[test]
    fn oversized_length_resets_state() {
        for size in [usize::MAX - 19, usize::MAX - 1, usize::MAX] {
            let mut reconstructor = ResponseReconstructor::new();
            let mut raw = CHUNKED_HEADER.as_bytes().to_vec();
            raw.extend_from_slice(format!("{size:x}\r\nabc").as_bytes());

            let frames = reconstructor.push(&raw);
            assert_eq!(frames, vec![Frame::Reset], "size {size:#x}");
            assert!(!reconstructor.header_complete());

            let frames = reconstructor.push(&chunked_response(&["ok"]));
            assert_eq!(body_of(&frames), b"ok");
        }
    }

    #[test]
    fn chunk_extensions_are_ignored() {
        let mut reconstructor = ResponseReconstructor::new();
        let mut raw = CHUNKED_HEADER.as_bytes().to_vec();
        raw.extend_from_slice(b"3;name=value\r\nabc\r\n0\r\n\r\n");

        let frames = reconstructor.push(&raw);
        assert_eq!(frames, vec![Frame::Data(b"abc".to_vec()), Frame::End]);
    }

    #[test]
    fn terminator_with_trailers_ends_response() {
        let mut reconstructor = ResponseReconstructor::new();
        let mut raw = CHUNKED_HEADER.as_bytes().to_vec();
        raw.extend_from_slice(b"1\r\nx\r\n0\r\nX-Trailer: 1\r\n");

        assert_eq!(reconstructor.push(&raw), vec![Frame::Data(b"x".to_vec())]);
        assert_eq!(reconstructor.push(b"\r\n"), vec![Frame::End]);
    }

    #[test]
    fn pipelined_responses_are_both_decoded() {
        let mut raw = chunked_response(&["first"]);
        raw.extend(chunked_response(&["second"]));

        let mut reconstructor = ResponseReconstructor::new();
        let frames = reconstructor.push(&raw);

        assert_eq!(
            frames,
            vec![
                Frame::Data(b"first".to_vec()),
                Frame::End,
                Frame::Data(b"second".to_vec()),
                Frame::End,
            ]
        );
    }

    #[test]
    fn content_length_body_is_delivered_and_ends() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhel";
        let mut reconstructor = ResponseReconstructor::new();

        assert_eq!(reconstructor.push(raw), vec![Frame::Data(b"hel".to_vec())]);
        assert_eq!(
            reconstructor.push(b"loHTTP/1.1 204 No Content\r\n\r\n"),
            vec![Frame::Data(b"lo".to_vec()), Frame::End, Frame::End]
        );
    }

    #[test]
    fn header_names_are_case_insensitive() {
        let mut reconstructor = ResponseReconstructor::new();
        reconstructor.push(
            b"HTTP/1.1 200 OK\r\ntransfer-encoding: Chunked\r\ncontent-encoding: gzip\r\n\r\n",
        );

        assert!(reconstructor.is_chunked());
        assert!(reconstructor.is_gzip());
    }

    #[test]
    fn header_split_across_pushes_is_found() {
        let raw = chunked_response(&["split"]);
        let header_len = CHUNKED_HEADER.len();
        let mut reconstructor = ResponseReconstructor::new();

        assert!(reconstructor.push(&raw[..header_len - 2]).is_empty());
        assert!(!reconstructor.header_complete());

        let frames = reconstructor.push(&raw[header_len - 2..]);
        assert_eq!(body_of(&frames), b"split");
    }

    #[test]
    fn parse_chunk_size_rejects_garbage() {
        assert_eq!(parse_chunk_size(b"1a"), Some(26));
        assert_eq!(parse_chunk_size(b"A;ext"), Some(10));
        assert_eq!(parse_chunk_size(b""), None);
        assert_eq!(parse_chunk_size(b"+1"), None);
        assert_eq!(parse_chunk_size(b"xyz"), None);
    }
}
