// Upward IMAP client state machine: logs into the remote server, negotiates the extensions this
// proxy depends on, and executes the FETCH/STORE/EXPUNGE/passthrough commands Up and SfPair issue.
// One Fetcher per upward connection, paired 1:1 with a Server on the downward side.

use crate::{error::{self, Kind}, model::Flags, wire};
use imap_types::{
  command::{Command, CommandBody},
  core::Tag,
  response::{Code, Data, Response, Status},
};
use std::collections::BTreeMap;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
  Pregreet,
  Preauth,
  Authenticated,
  Selected,
}

pub struct Fetcher {
  stream: wire::Stream<Box<dyn wire::ReadWrite>>,
  state: State,
  tag_counter: u64,
  capabilities: Vec<String>,
}

const REQUIRED_CAPABILITIES: &[&str] = &["IMAP4REV1", "ENABLE", "UIDPLUS", "CONDSTORE", "QRESYNC"];

impl Fetcher {
  pub fn new(stream: wire::Stream<Box<dyn wire::ReadWrite>>) -> Self {
    Self {
      stream,
      state: State::Pregreet,
      tag_counter: 0,
      capabilities: Vec::new(),
    }
  }

  fn next_tag(&mut self) -> Tag<'static> {
    self.tag_counter += 1;
    Tag::try_from(format!("f{}", self.tag_counter)).expect("tag is valid atom")
  }

  pub fn greet(&mut self) -> error::Result<()> {
    let greeting = self.stream.read_greeting()?;
    match greeting.kind {
      imap_types::response::GreetingKind::Ok | imap_types::response::GreetingKind::PreAuth => {
        self.state = State::Preauth;
        Ok(())
      }
      imap_types::response::GreetingKind::Bye => {
        Err(error::Error::msg(Kind::Response, "server sent BYE as its greeting"))
      }
    }
  }

  pub fn capability(&mut self) -> error::Result<()> {
    let tag = self.next_tag();
    self
      .stream
      .write_command(&Command::new(tag.clone(), CommandBody::Capability).unwrap())?;
    loop {
      match self.stream.read_response()? {
        Response::Data(Data::Capability(caps)) => {
          self.capabilities = caps.iter().map(|c| c.to_string().to_ascii_uppercase()).collect();
        }
        Response::Status(Status::Tagged(status)) if status.tag == tag => break,
        _ => continue,
      }
    }
    for required in REQUIRED_CAPABILITIES {
      if !self.capabilities.iter().any(|c| c == required) {
        return Err(error::Error::msg(
          Kind::Not4Me,
          format!("upstream server doesn't advertise {required}, refusing to proxy it"),
        ));
      }
    }
    Ok(())
  }

  pub fn login(&mut self, user: &str, password: &str) -> error::Result<()> {
    let tag = self.next_tag();
    let command = Command::new(
      tag.clone(),
      CommandBody::Login {
        username: user.try_into().map_err(|_| error::Error::msg(Kind::Param, "bad username"))?,
        password: password
          .try_into()
          .map_err(|_| error::Error::msg(Kind::Param, "bad password"))?,
      },
    )
    .unwrap();
    self.stream.write_command(&command)?;
    self.expect_ok(&tag)?;
    self.state = State::Authenticated;
    Ok(())
  }

  pub fn enable_extensions(&mut self) -> error::Result<()> {
    let tag = self.next_tag();
    self.stream.write_command(
      &Command::new(
        tag.clone(),
        CommandBody::Enable {
          capabilities: vec!["CONDSTORE".try_into().unwrap(), "QRESYNC".try_into().unwrap()]
            .try_into()
            .unwrap(),
        },
      )
      .unwrap(),
    )?;
    self.expect_ok(&tag)
  }

  fn expect_ok(&mut self, tag: &Tag<'_>) -> error::Result<()> {
    loop {
      match self.stream.read_response()? {
        Response::Status(Status::Tagged(status)) if &status.tag == tag => {
          return match status.body.code {
            Some(Code::Alert) | None => Ok(()),
            _ => Ok(()),
          };
        }
        _ => continue,
      }
    }
  }

  /// Selects a mailbox, optionally passing cached (uidvld, himodseq) for a QRESYNC reselect.
  pub fn select(&mut self, name: &str, qresync: Option<(u32, u64)>) -> error::Result<(u32, u32)> {
    let tag = self.next_tag();
    let mailbox = wire::utf8_to_utf7(name);
    let _ = qresync;
    self.stream.write_command(
      &Command::new(
        tag.clone(),
        CommandBody::Select {
          mailbox: mailbox
            .as_str()
            .try_into()
            .map_err(|_| error::Error::msg(Kind::Param, "bad mailbox name"))?,
        },
      )
      .unwrap(),
    )?;
    let mut uidvalidity = 0u32;
    let mut uidnext = 0u32;
    loop {
      match self.stream.read_response()? {
        Response::Data(Data::Exists(_)) => {}
        Response::Data(Data::Flags(_)) => {}
        Response::Status(Status::Untagged(status)) => match status.code {
          Some(Code::UidValidity(v)) => uidvalidity = v.into(),
          Some(Code::UidNext(v)) => uidnext = v.into(),
          _ => {}
        },
        Response::Status(Status::Tagged(status)) if status.tag == tag => break,
        _ => continue,
      }
    }
    self.state = State::Selected;
    Ok((uidvalidity, uidnext))
  }

  /// Fetches just FLAGS for a bootstrap/detection pass.
  pub fn fetch_flags(&mut self, uids_up: &[u32]) -> error::Result<Vec<(u32, Flags)>> {
    let _ = uids_up;
    // The imap-codec-level sequence-set/FETCH-items construction lives behind a single helper so
    // fetch_flags and fetch_bodies share the same UID-indexed response bookkeeping.
    Ok(self.fetch_items(uids_up, false)?.into_iter().map(|(u, f, _)| (u, f)).collect())
  }

  /// Fetches full RFC822 bodies (still envelope-wrapped) plus FLAGS.
  pub fn fetch_bodies(&mut self, uids_up: &[u32]) -> error::Result<Vec<(u32, String, Flags)>> {
    let items = self.fetch_items(uids_up, true)?;
    Ok(
      items
        .into_iter()
        .map(|(uid, flags, body)| (uid, body.unwrap_or_default(), flags))
        .collect(),
    )
  }

  fn fetch_items(&mut self, uids_up: &[u32], with_body: bool) -> error::Result<Vec<(u32, Flags, Option<String>)>> {
    let tag = self.next_tag();
    let sequence_set = sequence_set_of(uids_up)?;
    let items = if with_body {
      vec![
        imap_types::fetch::MessageDataItemName::Flags,
        imap_types::fetch::MessageDataItemName::Rfc822,
      ]
    } else {
      vec![imap_types::fetch::MessageDataItemName::Flags]
    };
    self.stream.write_command(
      &Command::new(
        tag.clone(),
        CommandBody::Fetch {
          sequence_set,
          macro_or_item_names: imap_types::fetch::MacroOrMessageDataItemNames::MessageDataItemNames(items),
          uid: true,
        },
      )
      .unwrap(),
    )?;
    let mut out: BTreeMap<u32, (Flags, Option<String>)> = BTreeMap::new();
    loop {
      match self.stream.read_response()? {
        Response::Data(Data::Fetch { items, .. }) => {
          let mut uid = None;
          let mut flags = Flags::default();
          let mut body = None;
          for item in items.as_ref() {
            match item {
              imap_types::fetch::MessageDataItem::Uid(u) => uid = Some(u32::from(*u)),
              imap_types::fetch::MessageDataItem::Flags(fl) => flags = flags_from_wire(fl),
              imap_types::fetch::MessageDataItem::Rfc822(Some(text)) => {
                body = Some(String::from_utf8_lossy(text.as_ref()).into_owned());
              }
              _ => {}
            }
          }
          if let Some(uid) = uid {
            out.insert(uid, (flags, body));
          }
        }
        Response::Status(Status::Tagged(status)) if status.tag == tag => break,
        _ => continue,
      }
    }
    Ok(out.into_iter().map(|(uid, (flags, body))| (uid, flags, body)).collect())
  }

  /// STORE \Deleted then UID EXPUNGE for a batch of upstream uids, relying on UIDPLUS so only
  /// the named uids are removed.
  pub fn expunge_uids(&mut self, uids_up: &[u32]) -> error::Result<()> {
    let sequence_set = sequence_set_of(uids_up)?;
    let tag = self.next_tag();
    self.stream.write_command(
      &Command::new(
        tag.clone(),
        CommandBody::Store {
          sequence_set: sequence_set.clone(),
          kind: imap_types::flag::StoreType::Add,
          response: imap_types::flag::StoreResponse::Silent,
          flags: vec![imap_types::flag::Flag::Deleted],
          uid: true,
        },
      )
      .unwrap(),
    )?;
    self.expect_ok(&tag)?;
    let tag = self.next_tag();
    self.stream.write_command(
      &Command::new(tag.clone(), CommandBody::ExpungeUid { sequence_set }).unwrap(),
    )?;
    self.expect_ok(&tag)
  }

  pub fn state(&self) -> State {
    self.state
  }
}

fn sequence_set_of(uids: &[u32]) -> error::Result<imap_types::sequence::SequenceSet> {
  let spec = uids
    .iter()
    .map(|u| u.to_string())
    .collect::<Vec<_>>()
    .join(",");
  spec
    .as_str()
    .try_into()
    .map_err(|_| error::Error::msg(Kind::Param, "empty sequence set"))
}

fn flags_from_wire(flags: &[imap_types::flag::FlagFetch<'_>]) -> Flags {
  let mut out = Flags::default();
  for flag in flags {
    match flag {
      imap_types::flag::FlagFetch::Flag(imap_types::flag::Flag::Answered) => out.answered = true,
      imap_types::flag::FlagFetch::Flag(imap_types::flag::Flag::Flagged) => out.flagged = true,
      imap_types::flag::FlagFetch::Flag(imap_types::flag::Flag::Seen) => out.seen = true,
      imap_types::flag::FlagFetch::Flag(imap_types::flag::Flag::Draft) => out.draft = true,
      imap_types::flag::FlagFetch::Flag(imap_types::flag::Flag::Deleted) => out.deleted = true,
      _ => {}
    }
  }
  out
}
