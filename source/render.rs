// FETCH item rendering: turns one message's on-disk bytes plus its Dn-tracked metadata into the
// imap_types::fetch::MessageDataItem values a FETCH response actually puts on the wire. ENVELOPE
// and the HEADER/TEXT/HEADER.FIELDS sections are built by hand from the raw header lines;
// BODYSTRUCTURE's content-type/subtype/charset detection is the one place this proxy leans on
// mail_parser, since hand-rolling MIME parameter parsing isn't worth it for a single lookup.

use crate::{
  error::{self, Kind},
  model::Flags,
};
use imap_types::{
  body::{BasicFields, Body, BodyStructure, SpecificFields},
  core::{AString, IString, NString},
  envelope::{Address, Envelope},
  fetch::{MessageDataItem, MessageDataItemName, Section},
  flag::{Flag, FlagFetch},
};
use std::num::NonZeroU32;

pub fn flags_item(flags: Flags) -> MessageDataItem<'static> {
  let mut out = Vec::new();
  if flags.answered {
    out.push(FlagFetch::Flag(Flag::Answered));
  }
  if flags.flagged {
    out.push(FlagFetch::Flag(Flag::Flagged));
  }
  if flags.seen {
    out.push(FlagFetch::Flag(Flag::Seen));
  }
  if flags.draft {
    out.push(FlagFetch::Flag(Flag::Draft));
  }
  if flags.deleted {
    out.push(FlagFetch::Flag(Flag::Deleted));
  }
  MessageDataItem::Flags(out)
}

pub fn uid_item(uid_dn: u32) -> error::Result<MessageDataItem<'static>> {
  let uid = NonZeroU32::try_from(uid_dn).map_err(|_| error::Error::msg(Kind::Value, "uid_dn is zero"))?;
  Ok(MessageDataItem::Uid(uid))
}

/// Builds every requested item for one message. `raw` is the full on-disk message (header and
/// body) if it's been downloaded yet, None if the message is still an unfilled stub - content
/// items resolve to NIL/empty rather than failing, the same way a real server answers a FETCH for
/// a message it hasn't finished synchronizing.
pub fn build_items(
  names: &[MessageDataItemName<'static>],
  raw: Option<&[u8]>,
  uid_dn: u32,
  flags: Flags,
  length: Option<u64>,
) -> error::Result<Vec<MessageDataItem<'static>>> {
  let raw = raw.unwrap_or(&[]);
  let mut items = Vec::with_capacity(names.len());
  for name in names {
    let item = match name {
      MessageDataItemName::Flags => flags_item(flags),
      MessageDataItemName::Uid => uid_item(uid_dn)?,
      MessageDataItemName::Rfc822Size => {
        MessageDataItem::Rfc822Size(length.unwrap_or(raw.len() as u64) as u32)
      }
      MessageDataItemName::Rfc822 => MessageDataItem::Rfc822(bytes_to_nstring(raw)?),
      MessageDataItemName::Rfc822Header => MessageDataItem::Rfc822Header(bytes_to_nstring(header_bytes(raw))?),
      MessageDataItemName::Rfc822Text => MessageDataItem::Rfc822Text(bytes_to_nstring(body_bytes(raw))?),
      MessageDataItemName::Envelope => MessageDataItem::Envelope(build_envelope(raw)),
      MessageDataItemName::Body => MessageDataItem::Body(build_bodystructure(raw)?),
      MessageDataItemName::BodyStructure => MessageDataItem::BodyStructure(build_bodystructure(raw)?),
      MessageDataItemName::BodyExt { section, partial, .. } => {
        let data = section_bytes(raw, section.as_ref())?;
        let (data, origin) = apply_partial(data, *partial);
        MessageDataItem::BodyExt {
          section: section.clone(),
          origin,
          data: bytes_to_nstring(&data)?,
        }
      }
      MessageDataItemName::InternalDate | MessageDataItemName::Binary { .. } | MessageDataItemName::BinarySize { .. } => {
        return Err(error::Error::msg(Kind::Param, "unsupported FETCH item"));
      }
    };
    items.push(item);
  }
  Ok(items)
}

fn section_bytes(raw: &[u8], section: Option<&Section<'static>>) -> error::Result<Vec<u8>> {
  match section {
    None => Ok(raw.to_vec()),
    Some(Section::Header(None)) => Ok(header_bytes(raw).to_vec()),
    Some(Section::Text(None)) => Ok(body_bytes(raw).to_vec()),
    Some(Section::HeaderFields(None, names)) => Ok(header_fields(raw, names.as_ref(), false)),
    Some(Section::HeaderFieldsNot(None, names)) => Ok(header_fields(raw, names.as_ref(), true)),
    Some(_) => Err(error::Error::msg(Kind::Param, "nested MIME part sections are not supported")),
  }
}

fn apply_partial(data: Vec<u8>, partial: Option<(u32, NonZeroU32)>) -> (Vec<u8>, Option<u32>) {
  let Some((start, len)) = partial else {
    return (data, None);
  };
  let start_idx = start as usize;
  if start_idx >= data.len() {
    return (Vec::new(), Some(start));
  }
  let end = start_idx.saturating_add(u32::from(len) as usize).min(data.len());
  (data[start_idx..end].to_vec(), Some(start))
}

fn header_fields(raw: &[u8], names: &[AString<'static>], exclude: bool) -> Vec<u8> {
  let wanted: Vec<String> = names
    .iter()
    .map(|n| String::from_utf8_lossy(n.as_ref()).to_ascii_lowercase())
    .collect();
  let mut out = Vec::new();
  for line in unfold_header_lines(header_bytes(raw)) {
    let name = line.split_once(':').map(|(n, _)| n.trim().to_ascii_lowercase()).unwrap_or_default();
    let matches = wanted.iter().any(|w| *w == name);
    if matches != exclude {
      out.extend_from_slice(line.as_bytes());
      out.extend_from_slice(b"\r\n");
    }
  }
  out.extend_from_slice(b"\r\n");
  out
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
  haystack.windows(needle.len()).position(|window| window == needle)
}

fn header_end(raw: &[u8]) -> usize {
  if let Some(pos) = find_subslice(raw, b"\r\n\r\n") {
    return pos + 4;
  }
  if let Some(pos) = find_subslice(raw, b"\n\n") {
    return pos + 2;
  }
  raw.len()
}

fn header_bytes(raw: &[u8]) -> &[u8] {
  &raw[..header_end(raw)]
}

fn body_bytes(raw: &[u8]) -> &[u8] {
  &raw[header_end(raw)..]
}

fn unfold_header_lines(header: &[u8]) -> Vec<String> {
  let text = String::from_utf8_lossy(header);
  let mut lines: Vec<String> = Vec::new();
  for raw_line in text.split("\r\n") {
    if raw_line.is_empty() {
      continue;
    }
    if (raw_line.starts_with(' ') || raw_line.starts_with('\t')) && !lines.is_empty() {
      let last = lines.last_mut().expect("checked non-empty above");
      last.push(' ');
      last.push_str(raw_line.trim_start());
    } else {
      lines.push(raw_line.to_string());
    }
  }
  lines
}

fn header_value(raw: &[u8], wanted: &str) -> Option<String> {
  unfold_header_lines(header_bytes(raw)).into_iter().find_map(|line| {
    let (name, value) = line.split_once(':')?;
    if name.trim().eq_ignore_ascii_case(wanted) {
      Some(value.trim().to_string())
    } else {
      None
    }
  })
}

fn bytes_to_nstring(bytes: &[u8]) -> error::Result<NString<'static>> {
  if bytes.is_empty() {
    return Ok(NString(None));
  }
  let istring = IString::try_from(bytes.to_vec())
    .map_err(|_| error::Error::msg(Kind::Value, "message bytes aren't a valid IMAP string"))?;
  Ok(NString(Some(istring)))
}

fn nstring_opt(value: Option<String>) -> NString<'static> {
  match value {
    Some(v) if !v.is_empty() => NString(IString::try_from(v).ok()),
    _ => NString(None),
  }
}

fn istring_or_fallback(s: &str) -> IString<'static> {
  IString::try_from(s.to_string()).unwrap_or_else(|_| IString::try_from("unknown".to_string()).expect("'unknown' is a valid istring"))
}

/// Hand-rolled ENVELOPE: scans the unfolded header lines for each envelope field directly,
/// defaulting Sender/Reply-To to From per RFC 3501 when absent, same as a real server does.
pub fn build_envelope(raw: &[u8]) -> Envelope<'static> {
  let lines = unfold_header_lines(header_bytes(raw));
  let get = |wanted: &str| -> Option<String> {
    lines.iter().find_map(|line| {
      let (name, value) = line.split_once(':')?;
      if name.trim().eq_ignore_ascii_case(wanted) {
        Some(value.trim().to_string())
      } else {
        None
      }
    })
  };
  let from = get("From").map(|v| parse_addresses(&v)).unwrap_or_default();
  let sender = get("Sender").map(|v| parse_addresses(&v)).filter(|a| !a.is_empty()).unwrap_or_else(|| from.clone());
  let reply_to = get("Reply-To")
    .map(|v| parse_addresses(&v))
    .filter(|a| !a.is_empty())
    .unwrap_or_else(|| from.clone());
  Envelope {
    date: nstring_opt(get("Date")),
    subject: nstring_opt(get("Subject")),
    from,
    sender,
    reply_to,
    to: get("To").map(|v| parse_addresses(&v)).unwrap_or_default(),
    cc: get("Cc").map(|v| parse_addresses(&v)).unwrap_or_default(),
    bcc: get("Bcc").map(|v| parse_addresses(&v)).unwrap_or_default(),
    in_reply_to: nstring_opt(get("In-Reply-To")),
    message_id: nstring_opt(get("Message-ID")),
  }
}

fn parse_addresses(value: &str) -> Vec<Address<'static>> {
  split_address_list(value).iter().filter_map(|part| parse_one_address(part.trim())).collect()
}

fn split_address_list(value: &str) -> Vec<String> {
  let mut parts = Vec::new();
  let mut current = String::new();
  let mut depth_angle = 0i32;
  let mut depth_paren = 0i32;
  let mut in_quotes = false;
  for c in value.chars() {
    match c {
      '"' => {
        in_quotes = !in_quotes;
        current.push(c);
      }
      '<' if !in_quotes => {
        depth_angle += 1;
        current.push(c);
      }
      '>' if !in_quotes => {
        depth_angle -= 1;
        current.push(c);
      }
      '(' if !in_quotes => {
        depth_paren += 1;
        current.push(c);
      }
      ')' if !in_quotes => {
        depth_paren -= 1;
        current.push(c);
      }
      ',' if !in_quotes && depth_angle == 0 && depth_paren == 0 => {
        parts.push(std::mem::take(&mut current));
      }
      _ => current.push(c),
    }
  }
  if !current.trim().is_empty() {
    parts.push(current);
  }
  parts
}

fn parse_one_address(part: &str) -> Option<Address<'static>> {
  if part.is_empty() {
    return None;
  }
  let (display, spec) = match part.rfind('<') {
    Some(start) if part.ends_with('>') => {
      let display = part[..start].trim().trim_matches('"').to_string();
      let spec = part[start + 1..part.len() - 1].to_string();
      (if display.is_empty() { None } else { Some(display) }, spec)
    }
    _ => (None, part.to_string()),
  };
  let (mailbox, host) = match spec.split_once('@') {
    Some((m, h)) => (m.trim().to_string(), h.trim().to_string()),
    None => (spec.trim().to_string(), String::new()),
  };
  if mailbox.is_empty() {
    return None;
  }
  Some(Address {
    name: nstring_opt(display),
    adl: NString(None),
    mailbox: nstring_opt(Some(mailbox)),
    host: nstring_opt(if host.is_empty() { None } else { Some(host) }),
  })
}

/// BODYSTRUCTURE is scoped to single-part messages: no multipart nesting, no extension data.
/// Content-type/subtype/charset come from a single mail_parser lookup; everything else is a raw
/// header scan.
pub fn build_bodystructure(raw: &[u8]) -> error::Result<BodyStructure<'static>> {
  let body = body_bytes(raw);
  let (type_, subtype, charset) = detect_content_type(raw);
  let cte = header_value(raw, "Content-Transfer-Encoding").unwrap_or_else(|| "7bit".to_string());
  let lines = body.iter().filter(|&&b| b == b'\n').count() as u32;
  let mut parameter_list = Vec::new();
  if let Some(charset) = charset {
    parameter_list.push((istring_or_fallback("charset"), istring_or_fallback(&charset)));
  }
  let basic = BasicFields {
    parameter_list,
    id: NString(None),
    description: NString(None),
    content_transfer_encoding: istring_or_fallback(&cte),
    size: body.len() as u32,
  };
  let specific = if type_.eq_ignore_ascii_case("text") {
    SpecificFields::Text {
      subtype: istring_or_fallback(&subtype),
      number_of_lines: lines,
    }
  } else {
    SpecificFields::Basic {
      type_: istring_or_fallback(&type_),
      subtype: istring_or_fallback(&subtype),
    }
  };
  Ok(BodyStructure::Single {
    body: Body { basic, specific },
    extension: None,
  })
}

fn detect_content_type(raw: &[u8]) -> (String, String, Option<String>) {
  if let Some(message) = mail_parser::MessageParser::default().parse(raw) {
    if let Some(content_type) = message.content_type() {
      let type_ = content_type.ctype().to_string();
      let subtype = content_type.subtype().map(|s| s.to_string()).unwrap_or_else(|| "plain".to_string());
      let charset = content_type.attribute("charset").map(|s| s.to_string());
      return (type_, subtype, charset);
    }
  }
  ("text".to_string(), "plain".to_string(), Some("us-ascii".to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;

  const MESSAGE: &[u8] = b"From: a@example.com\r\nTo: b@example.com, \"C D\" <c@example.com>\r\nSubject: hi\r\n\r\nbody text\r\n";

  #[test]
  fn header_and_body_split_on_blank_line() {
    assert_eq!(b"From: a@example.com\r\nTo: b@example.com, \"C D\" <c@example.com>\r\nSubject: hi\r\n\r\n", header_bytes(MESSAGE));
    assert_eq!(b"body text\r\n", body_bytes(MESSAGE));
  }

  #[test]
  fn envelope_parses_addresses_and_subject() {
    let envelope = build_envelope(MESSAGE);
    assert_eq!(1, envelope.from.len());
    assert_eq!(2, envelope.to.len());
    assert_eq!(Some(b"hi".as_slice()), envelope.subject.0.as_ref().map(|s| s.as_ref()));
  }

  #[test]
  fn flags_item_lists_only_set_flags() {
    let item = flags_item(Flags {
      seen: true,
      deleted: true,
      ..Flags::default()
    });
    match item {
      MessageDataItem::Flags(flags) => assert_eq!(2, flags.len()),
      _ => panic!("expected Flags item"),
    }
  }

  #[test]
  fn header_fields_extracts_named_fields_only() {
    let names: Vec<AString<'static>> = vec!["subject".try_into().unwrap()];
    let extracted = header_fields(MESSAGE, &names, false);
    let text = String::from_utf8_lossy(&extracted);
    assert!(text.contains("Subject: hi"));
    assert!(!text.contains("From:"));
  }
}
