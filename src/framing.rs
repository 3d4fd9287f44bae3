//! Line framing for the echo protocol.
//!
//! Input lines end at `\n`, `\r\n`, or a lone `\r`. A `\r\n` pair split
//! across two reads still counts as a single terminator. Lines are kept as
//! raw bytes so non-UTF-8 input is echoed back untouched.
//!
//! Output lines are re-terminated with the server's own [`LineEnding`].

use serde::Deserialize;
use std::io::{self, BufRead};

/// Terminator appended to every echoed line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LineEnding {
    /// `\n`
    #[default]
    Lf,
    /// `\r\n`
    Crlf,
}

impl LineEnding {
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            LineEnding::Lf => b"\n",
            LineEnding::Crlf => b"\r\n",
        }
    }
}

/// Outcome of a single [`LineFramer::read_line`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// A complete line was appended to the output buffer.
    Line,
    /// The peer closed its sending side and no partial line was pending.
    EndOfStream,
}

/// Splits a buffered byte stream into lines.
///
/// Carries the one bit of state needed across reads: whether the previous
/// line ended in `\r`, in which case a leading `\n` belongs to it.
#[derive(Debug, Default)]
pub struct LineFramer {
    skip_lf: bool,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the next line from `reader` into `line`, without its terminator.
    ///
    /// `line` must be empty on entry. A trailing unterminated line is
    /// returned as [`Frame::Line`]; the following call reports
    /// [`Frame::EndOfStream`].
    ///
    /// On error, bytes of a partially read line may already be in `line`.
    pub fn read_line<R: BufRead>(&mut self, reader: &mut R, line: &mut Vec<u8>) -> io::Result<Frame> {
        loop {
            let (done, used) = {
                let available = match reader.fill_buf() {
                    Ok(buf) => buf,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                };

                if available.is_empty() {
                    return Ok(if line.is_empty() {
                        Frame::EndOfStream
                    } else {
                        Frame::Line
                    });
                }

                let mut start = 0;
                if self.skip_lf {
                    self.skip_lf = false;
                    if available[0] == b'\n' {
                        start = 1;
                    }
                }

                match find_terminator(&available[start..]) {
                    Some(pos) => {
                        let end = start + pos;
                        line.extend_from_slice(&available[start..end]);

                        let mut used = end + 1;
                        if available[end] == b'\r' {
                            match available.get(used) {
                                Some(b'\n') => used += 1,
                                Some(_) => {}
                                None => self.skip_lf = true,
                            }
                        }
                        (true, used)
                    }
                    None => {
                        line.extend_from_slice(&available[start..]);
                        (false, available.len())
                    }
                }
            };

            reader.consume(used);
            if done {
                return Ok(Frame::Line);
            }
        }
    }
}

/// Find the first `\r` or `\n` in `buffer`.
fn find_terminator(buffer: &[u8]) -> Option<usize> {
    buffer.iter().position(|&b| b == b'\n' || b == b'\r')
}
