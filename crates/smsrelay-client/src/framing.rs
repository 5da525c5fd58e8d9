//! Cutting an XMPP byte stream into stanzas.
//!
//! An XMPP session is one long XML document: `<stream:stream>` opens it and
//! every stanza is a direct child. The codec tracks element depth below the
//! stream root and yields each top-level element as soon as it closes.

use bytes::{Buf, Bytes, BytesMut};
use quick_xml::errors::{Error as XmlError, IllFormedError, SyntaxError};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Largest stanza accepted before the buffer is discarded.
pub const MAX_FRAME_LEN: usize = 1 << 20;

const STREAM_TAG: &[u8] = b"stream:stream";

/// One unit cut from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    /// The `<stream:stream ...>` header (also sent again after SASL).
    StreamOpen(Bytes),
    /// One complete top-level stanza.
    Stanza(Bytes),
    /// `</stream:stream>`: the peer ended the session.
    StreamClose,
    /// Bytes that could not be framed. They have been dropped.
    Malformed(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StanzaCodec;

enum Scan {
    Incomplete { skip: usize },
    Frame { start: usize, end: usize, kind: FrameKind },
    Malformed { consumed: usize, reason: String },
}

enum FrameKind {
    Open,
    Stanza,
    Close,
}

fn scan(buf: &[u8]) -> Scan {
    let mut reader = Reader::from_reader(buf);
    let mut depth = 0usize;
    let mut start = 0usize;
    // Whitespace keepalives, declarations and comments between stanzas.
    let mut skip = 0usize;

    loop {
        let before = reader.buffer_position() as usize;
        let event = match reader.read_event() {
            Ok(event) => event,
            // `<!` followed by anything but a comment, CDATA or doctype
            // stays invalid however many bytes follow.
            Err(XmlError::Syntax(SyntaxError::InvalidBangMarkup)) => {
                return Scan::Malformed {
                    consumed: (reader.buffer_position() as usize).max(before + 1),
                    reason: SyntaxError::InvalidBangMarkup.to_string(),
                };
            }
            // The other syntax errors are unclosed markup: wait for more.
            Err(XmlError::Syntax(_)) => return Scan::Incomplete { skip },
            Err(XmlError::IllFormed(IllFormedError::UnmatchedEndTag(name)))
                if depth == 0 && name.as_bytes() == STREAM_TAG =>
            {
                return Scan::Frame {
                    start: before,
                    end: reader.buffer_position() as usize,
                    kind: FrameKind::Close,
                };
            }
            Err(err) => {
                return Scan::Malformed {
                    consumed: reader.buffer_position() as usize,
                    reason: err.to_string(),
                };
            }
        };
        let after = reader.buffer_position() as usize;

        match event {
            Event::Eof => return Scan::Incomplete { skip },
            Event::Start(tag) => {
                if depth == 0 {
                    if tag.name().as_ref() == STREAM_TAG {
                        return Scan::Frame {
                            start: before,
                            end: after,
                            kind: FrameKind::Open,
                        };
                    }
                    start = before;
                }
                depth += 1;
            }
            Event::Empty(_) if depth == 0 => {
                return Scan::Frame {
                    start: before,
                    end: after,
                    kind: FrameKind::Stanza,
                };
            }
            Event::End(tag) => {
                if depth == 0 {
                    if tag.name().as_ref() == STREAM_TAG {
                        return Scan::Frame {
                            start: before,
                            end: after,
                            kind: FrameKind::Close,
                        };
                    }
                    return Scan::Malformed {
                        consumed: after,
                        reason: "end tag without a matching start".into(),
                    };
                }
                depth -= 1;
                if depth == 0 {
                    return Scan::Frame {
                        start,
                        end: after,
                        kind: FrameKind::Stanza,
                    };
                }
            }
            _ if depth == 0 => skip = after,
            _ => {}
        }
    }
}

impl Decoder for StanzaCodec {
    type Item = RawFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>, io::Error> {
        match scan(&src[..]) {
            Scan::Incomplete { skip } => {
                src.advance(skip);
                if src.len() > MAX_FRAME_LEN {
                    src.clear();
                    return Ok(Some(RawFrame::Malformed(format!(
                        "stanza exceeds {MAX_FRAME_LEN} bytes"
                    ))));
                }
                Ok(None)
            }
            Scan::Frame { start, end, kind } => {
                let mut chunk = src.split_to(end);
                chunk.advance(start);
                Ok(Some(match kind {
                    FrameKind::Open => RawFrame::StreamOpen(chunk.freeze()),
                    FrameKind::Stanza => RawFrame::Stanza(chunk.freeze()),
                    FrameKind::Close => RawFrame::StreamClose,
                }))
            }
            Scan::Malformed { consumed, reason } => {
                // Always make progress so a bad byte cannot wedge the stream.
                let consumed = consumed.max(1).min(src.len());
                src.advance(consumed);
                Ok(Some(RawFrame::Malformed(reason)))
            }
        }
    }
}

impl Encoder<Bytes> for StanzaCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), io::Error> {
        dst.extend_from_slice(&frame);
        Ok(())
    }
}
