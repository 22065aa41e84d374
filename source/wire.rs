// Adapter over the wire parser/serializer collaborator (SPEC_FULL.md §6): frames bytes off a
// stream, decodes them into imap-codec/imap-types ASTs, and encodes responses/commands back onto
// the wire. Everything above this module (server, fetcher, up, dn, sfpair) talks in terms of
// imap_types::command::Command / imap_types::response::{Greeting, Response}, never raw bytes.

use crate::error::{self, Kind};
use imap_codec::{
  decode::{CommandDecodeError, Decoder, GreetingDecodeError, ResponseDecodeError},
  encode::Encoder,
  CommandCodec, GreetingCodec, ResponseCodec,
};
use base64::Engine as _;
use imap_types::{command::Command, response::Greeting, response::Response};
use std::io::{self, Read as _, Write as _};

/// The teacher's read/write seam for a byte stream, kept so TCP and TLS streams (downward server
/// role and upward client role alike) can sit behind the same trait object.
pub trait ReadWrite: Send {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
  fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
}

impl ReadWrite for std::net::TcpStream {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    io::Read::read(self, buf)
  }

  fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
    io::Write::write_all(self, buf)
  }
}

impl<T: ReadWrite + ?Sized> ReadWrite for Box<T> {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    (**self).read(buf)
  }

  fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
    (**self).write_all(buf)
  }
}

const READ_CHUNK: usize = 4096;

/// Buffers raw bytes off an underlying stream and decodes them into greetings/commands/responses
/// as literals complete. imap-codec reports `Incomplete`/`LiteralFound` when more bytes are
/// needed; this loop keeps reading until a full message parses or the peer hangs up.
pub struct Stream<RW> {
  inner: RW,
  buffer: Vec<u8>,
}

impl<RW: ReadWrite> Stream<RW> {
  pub fn new(inner: RW) -> Self {
    Self {
      inner,
      buffer: Vec::new(),
    }
  }

  fn fill(&mut self) -> error::Result<usize> {
    let mut chunk = [0u8; READ_CHUNK];
    let n = self.inner.read(&mut chunk).map_err(error::Error::from)?;
    if n == 0 {
      return Err(error::Error::msg(Kind::Break, "peer closed the connection"));
    }
    self.buffer.extend_from_slice(&chunk[..n]);
    Ok(n)
  }

  pub fn read_greeting(&mut self) -> error::Result<Greeting<'static>> {
    loop {
      match GreetingCodec::default().decode(&self.buffer) {
        Ok((remaining, greeting)) => {
          let consumed = self.buffer.len() - remaining.len();
          let greeting = greeting.to_owned();
          self.buffer.drain(..consumed);
          return Ok(greeting);
        }
        Err(GreetingDecodeError::Incomplete) => {
          self.fill()?;
        }
        Err(GreetingDecodeError::Failed) => {
          return Err(error::Error::msg(Kind::Parse, "malformed greeting"));
        }
      }
    }
  }

  pub fn read_command(&mut self) -> error::Result<Command<'static>> {
    loop {
      match CommandCodec::default().decode(&self.buffer) {
        Ok((remaining, command)) => {
          let consumed = self.buffer.len() - remaining.len();
          let command = command.to_owned();
          self.buffer.drain(..consumed);
          return Ok(command);
        }
        Err(CommandDecodeError::Incomplete) => {
          self.fill()?;
        }
        Err(CommandDecodeError::LiteralFound { length, .. }) => {
          // Acknowledge a non-synchronizing literal by reading up to `length` more bytes; the
          // client is already streaming them, no "+ OK" round trip is required for non-sync
          // literals, and for synchronizing ones the caller already wrote a continuation above us.
          while (self.buffer.len() as u64) < length.into() {
            self.fill()?;
          }
        }
        Err(CommandDecodeError::Failed) => {
          return Err(error::Error::msg(Kind::Parse, "malformed command"));
        }
      }
    }
  }

  pub fn read_response(&mut self) -> error::Result<Response<'static>> {
    loop {
      match ResponseCodec::default().decode(&self.buffer) {
        Ok((remaining, response)) => {
          let consumed = self.buffer.len() - remaining.len();
          let response = response.to_owned();
          self.buffer.drain(..consumed);
          return Ok(response);
        }
        Err(ResponseDecodeError::Incomplete) => {
          self.fill()?;
        }
        Err(ResponseDecodeError::LiteralFound { length, .. }) => {
          while (self.buffer.len() as u64) < length.into() {
            self.fill()?;
          }
        }
        Err(ResponseDecodeError::Failed) => {
          return Err(error::Error::msg(Kind::Parse, "malformed response"));
        }
      }
    }
  }

  /// Reads one CRLF (or bare LF)-terminated line without decoding it as a command, for IDLE's
  /// DONE token which isn't a command in its own right.
  pub fn read_raw_line(&mut self) -> error::Result<String> {
    loop {
      if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = self.buffer.drain(..=pos).collect();
        let line = line.strip_suffix(b"\n").unwrap_or(&line);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        return Ok(String::from_utf8_lossy(line).into_owned());
      }
      self.fill()?;
    }
  }

  pub fn write_command(&mut self, command: &Command<'_>) -> error::Result<()> {
    let encoded = CommandCodec::default().encode(command);
    self.write_encoded(encoded)
  }

  pub fn write_response(&mut self, response: &Response<'_>) -> error::Result<()> {
    let encoded = ResponseCodec::default().encode(response);
    self.write_encoded(encoded)
  }

  fn write_encoded(&mut self, encoded: impl IntoIterator<Item = imap_codec::encode::Fragment>) -> error::Result<()> {
    for fragment in encoded {
      let data = match fragment {
        imap_codec::encode::Fragment::Line { data } => data,
        imap_codec::encode::Fragment::Literal { data, .. } => data,
      };
      self.inner.write_all(&data).map_err(error::Error::from)?;
    }
    Ok(())
  }
}

/// `AUTH=PLAIN` credential framing: NUL, user, NUL, password, base64-encoded as a single string.
pub fn plain(user: &str, password: &str) -> String {
  use base64::Engine as _;
  let mut raw = Vec::with_capacity(user.len() + password.len() + 2);
  raw.push(0u8);
  raw.extend_from_slice(user.as_bytes());
  raw.push(0u8);
  raw.extend_from_slice(password.as_bytes());
  base64::engine::general_purpose::STANDARD.encode(raw)
}

/// Decodes a modified UTF-7 mailbox name (RFC 3501 §5.1.3) into UTF-8.
pub fn utf7_to_utf8(name: &str) -> error::Result<String> {
  let mut out = String::new();
  let mut chars = name.chars().peekable();
  while let Some(c) = chars.next() {
    if c != '&' {
      out.push(c);
      continue;
    }
    if chars.peek() == Some(&'-') {
      chars.next();
      out.push('&');
      continue;
    }
    let mut encoded = String::new();
    for c in chars.by_ref() {
      if c == '-' {
        break;
      }
      encoded.push(if c == ',' { '/' } else { c });
    }
    let bytes = base64::engine::general_purpose::STANDARD_NO_PAD
      .decode(encoded.as_bytes())
      .map_err(|e| error::Error::new(Kind::Parse, e))?;
    if bytes.len() % 2 != 0 {
      return Err(error::Error::msg(Kind::Parse, "odd-length modified UTF-7 run"));
    }
    for pair in bytes.chunks_exact(2) {
      let code = u16::from_be_bytes([pair[0], pair[1]]);
      out.push(char::from_u32(code as u32).unwrap_or('\u{fffd}'));
    }
  }
  Ok(out)
}

/// Encodes UTF-8 into modified UTF-7, escaping any character outside printable ASCII.
pub fn utf8_to_utf7(name: &str) -> String {
  let mut out = String::new();
  let mut run: Vec<u16> = Vec::new();
  let flush = |run: &mut Vec<u16>, out: &mut String| {
    if run.is_empty() {
      return;
    }
    let mut bytes = Vec::with_capacity(run.len() * 2);
    for unit in run.drain(..) {
      bytes.extend_from_slice(&unit.to_be_bytes());
    }
    out.push('&');
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(bytes);
    out.push_str(&encoded.replace('/', ","));
    out.push('-');
  };
  for c in name.chars() {
    if c == '&' {
      flush(&mut run, &mut out);
      out.push_str("&-");
    } else if (0x20..=0x7e).contains(&(c as u32)) {
      flush(&mut run, &mut out);
      out.push(c);
    } else {
      run.extend(c.encode_utf16(&mut [0u16; 2]).iter().copied());
    }
  }
  flush(&mut run, &mut out);
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn plain_auth_framing() {
    use base64::Engine as _;
    let encoded = plain("user", "pass");
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
    assert_eq!(b"\0user\0pass", decoded.as_slice());
  }

  #[test]
  fn utf7_round_trip_ascii() {
    assert_eq!("INBOX", utf7_to_utf8("INBOX").unwrap());
    assert_eq!("INBOX", utf8_to_utf7("INBOX"));
  }

  #[test]
  fn utf7_escapes_ampersand() {
    assert_eq!("Q&A", utf7_to_utf8("Q&-A").unwrap());
    assert_eq!("Q&-A", utf8_to_utf7("Q&A"));
  }
}
