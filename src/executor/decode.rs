//! Incremental text decoding of child output.
//!
//! Reads from a pipe arrive in arbitrary slices, so a multi-byte UTF-8
//! sequence can be split across two reads. `ChunkDecoder` carries the
//! incomplete tail over to the next read instead of mangling it, and decodes
//! genuinely malformed bytes permissively (U+FFFD) while flagging the chunk.

use serde::{Deserialize, Serialize};

/// Longest incomplete UTF-8 prefix that can be pending between reads
const MAX_UTF8_CARRY: usize = 3;

/// Text encoding of the child's output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TextEncoding {
    #[default]
    Utf8,
    /// ISO-8859-1: every byte maps to the code point of the same value
    Latin1,
    /// 7-bit ASCII; bytes above 0x7F are malformed
    Ascii,
}

/// One decoded unit of output, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub text: String,
    /// Some bytes in this chunk could not be decoded and were replaced
    pub malformed: bool,
}

/// Stateful decoder for one output stream
#[derive(Debug)]
pub struct ChunkDecoder {
    encoding: TextEncoding,
    carry: Vec<u8>,
}

impl ChunkDecoder {
    pub fn new(encoding: TextEncoding) -> Self {
        Self {
            encoding,
            carry: Vec::with_capacity(MAX_UTF8_CARRY),
        }
    }

    /// Decode the next slice of bytes. Returns `None` when nothing displayable
    /// came out of it (e.g. only the first byte of a multi-byte character).
    pub fn decode(&mut self, bytes: &[u8]) -> Option<OutputChunk> {
        let chunk = match self.encoding {
            TextEncoding::Utf8 => self.decode_utf8(bytes, false),
            TextEncoding::Latin1 => OutputChunk {
                text: bytes.iter().map(|&b| b as char).collect(),
                malformed: false,
            },
            TextEncoding::Ascii => {
                let mut malformed = false;
                let text = bytes
                    .iter()
                    .map(|&b| {
                        if b.is_ascii() {
                            b as char
                        } else {
                            malformed = true;
                            char::REPLACEMENT_CHARACTER
                        }
                    })
                    .collect();
                OutputChunk { text, malformed }
            }
        };
        (!chunk.text.is_empty() || chunk.malformed).then_some(chunk)
    }

    /// Flush whatever is still pending at end of stream. A dangling partial
    /// sequence is malformed by definition.
    pub fn finish(&mut self) -> Option<OutputChunk> {
        if self.carry.is_empty() {
            return None;
        }
        let chunk = self.decode_utf8(&[], true);
        Some(chunk)
    }

    fn decode_utf8(&mut self, bytes: &[u8], at_eof: bool) -> OutputChunk {
        let mut input = std::mem::take(&mut self.carry);
        input.extend_from_slice(bytes);

        let mut text = String::with_capacity(input.len());
        let mut malformed = false;
        let mut rest: &[u8] = &input;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // valid_up_to guarantees this prefix is UTF-8
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            malformed = true;
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None if !at_eof => {
                            // Incomplete sequence at the end: wait for more bytes
                            self.carry.extend_from_slice(after);
                            break;
                        }
                        None => {
                            malformed = true;
                            text.push(char::REPLACEMENT_CHARACTER);
                            break;
                        }
                    }
                }
            }
        }

        OutputChunk { text, malformed }
    }
}
