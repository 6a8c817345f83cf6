//! Newline-delimited JSON framing for [`Message`].
//!
//! Each message travels as one JSON document terminated by `\n`. Anything
//! heavier (reliability, encryption, compression) belongs to the transport
//! layer, not here.

use crate::Message;

/// Encodes a message as one framed line.
pub fn encode(message: &Message) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decodes one framed line (with or without its terminator).
pub fn decode(line: &[u8]) -> Result<Message, serde_json::Error> {
    serde_json::from_slice(line)
}

/// Accumulates raw socket bytes and yields complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a freshly read chunk.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    /// Removes and returns the next complete line, without its terminator.
    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        let newline = self.bytes.iter().position(|byte| *byte == b'\n')?;
        let mut line: Vec<u8> = self.bytes.drain(..=newline).collect();
        let _ = line.pop();
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_messages_decode_from_a_split_stream() {
        let first = encode(&Message::Ping).expect("encode");
        let second = encode(&Message::Pong).expect("encode");
        let stream: Vec<u8> = first.iter().chain(second.iter()).copied().collect();

        let mut buffer = LineBuffer::new();
        // Feed the stream a few bytes at a time, as a socket would.
        for chunk in stream.chunks(3) {
            buffer.extend(chunk);
        }

        let line = buffer.next_line().expect("first line");
        assert_eq!(decode(&line).expect("decode"), Message::Ping);
        let line = buffer.next_line().expect("second line");
        assert_eq!(decode(&line).expect("decode"), Message::Pong);
        assert!(buffer.next_line().is_none());
    }

    #[test]
    fn malformed_lines_are_a_decode_error() {
        assert!(decode(b"{\"NotAMessage\":{}}").is_err());
        assert!(decode(b"garbage").is_err());
    }
}
