// SF-Pair: owns one Server (downward) and one Fetcher (upward) for a single client connection,
// and is the only thing that drives commands between the two. Threads the client's LOGIN
// credentials through to the Fetcher, routes passthrough commands, and attaches a Dn/Up pair once
// a mailbox is selected. Once selected, FETCH/STORE/EXPUNGE/COPY/SEARCH are answered entirely
// downward, against the Dn's view of the Mailbox - they never round-trip to the Fetcher.

use crate::{
  dirmgr::DirMgr,
  dn::{self, Dn},
  error::{self, Kind},
  fetcher::Fetcher,
  mailbox::StoreDiff,
  render,
  server::{Pause, Server},
  up::Up,
  wire,
};
use imap_types::{
  command::{Command, CommandBody},
  core::Tag,
  fetch::MessageDataItem,
  flag::{StoreResponse, StoreType},
  response::{Code, Data, Response, Status, StatusKind},
  sequence::SequenceSet,
};
use std::sync::Arc;

pub struct SfPair {
  server: Server,
  fetcher: Fetcher,
  dirmgr: Arc<DirMgr>,
  keypair: Arc<crate::crypto::Keypair>,
  selected: Option<(Dn, Up)>,
  user: Option<String>,
}

impl SfPair {
  pub fn new(fetcher: Fetcher, dirmgr: Arc<DirMgr>, keypair: Arc<crate::crypto::Keypair>) -> Self {
    Self {
      server: Server::new(),
      fetcher,
      dirmgr,
      keypair,
      selected: None,
      user: None,
    }
  }

  pub fn server(&self) -> &Server {
    &self.server
  }

  /// Runs the upward preamble (greeting/capability/enable) before any downward command is
  /// accepted, so a LOGIN can be rejected immediately if the upstream server doesn't support the
  /// extensions this proxy requires.
  pub fn handshake(&mut self) -> error::Result<()> {
    self.fetcher.greet()?;
    self.fetcher.capability()?;
    self.server.greeted();
    Ok(())
  }

  /// Runs one command to completion and returns the untagged data it produced; the caller writes
  /// those followed by a tagged OK, or a tagged NO/BAD built from the error it got instead.
  pub fn handle(&mut self, command: &Command<'static>, password: Option<&str>) -> error::Result<Vec<Response<'static>>> {
    self.server.on_command(command);
    let mut out = Vec::new();
    match &command.body {
      CommandBody::Login { username, .. } => {
        let user = username.to_string();
        let password = password.ok_or_else(|| error::Error::msg(Kind::Param, "missing password"))?;
        match self.fetcher.login(&user, password).and_then(|_| self.fetcher.enable_extensions()) {
          Ok(()) => {
            self.user = Some(user);
            self.server.login_accepted();
          }
          Err(e) => {
            self.server.login_rejected();
            return Err(e);
          }
        }
      }
      CommandBody::Select { mailbox } | CommandBody::Examine { mailbox } => {
        let name = wire::utf7_to_utf8(&mailbox.to_string())?;
        match self.select(&name) {
          Ok(()) => {
            self.server.selected(name);
            out = self.select_responses()?;
          }
          Err(e) => {
            self.server.select_failed();
            return Err(e);
          }
        }
      }
      CommandBody::Close => {
        if let Some((mut dn, _)) = self.selected.take() {
          let uid_dns: Vec<u32> = dn.view().iter().map(|(u, _)| u).collect();
          let deleted = dn.deleted_among(&uid_dns);
          dn.expunge(&deleted)?;
          dn.close();
        }
        self.server.closed();
      }
      CommandBody::Logout => {
        if let Some((mut dn, _)) = self.selected.take() {
          dn.close();
        }
        self.server.logged_out();
        out.push(Response::Status(
          Status::bye(None, "logging out").map_err(|e| error::Error::msg(Kind::Response, format!("{e:?}")))?,
        ));
      }
      CommandBody::Fetch {
        sequence_set,
        macro_or_item_names,
        uid,
      } => {
        out = self.fetch_cmd(sequence_set, macro_or_item_names, *uid)?;
      }
      CommandBody::Store {
        sequence_set,
        kind,
        response,
        flags,
        uid,
      } => {
        out = self.store_cmd(sequence_set, *kind, *response, flags, *uid)?;
      }
      CommandBody::Copy { sequence_set, mailbox, uid } => {
        self.copy_cmd(sequence_set, &mailbox.to_string(), *uid)?;
      }
      CommandBody::Expunge => {
        out = self.expunge_cmd(None)?;
      }
      CommandBody::ExpungeUid { sequence_set } => {
        out = self.expunge_cmd(Some(sequence_set))?;
      }
      CommandBody::Search { criteria, uid, .. } => {
        out = self.search_cmd(criteria.as_ref(), *uid)?;
      }
      _ if self.server.pause() == &Pause::AwaitingPassthru => {
        self.server.passthru_done();
      }
      _ => {}
    }
    Ok(out)
  }

  fn select(&mut self, name: &str) -> error::Result<()> {
    let handle = self.dirmgr.open_dn(name)?;
    let qresync = {
      let mailbox = handle.lock().unwrap();
      if mailbox.uidvld_up() != 0 {
        Some((mailbox.uidvld_dn(), mailbox.himodseq_up()))
      } else {
        None
      }
    };
    let (uidvld_up, uidnext_up) = self.fetcher.select(name, qresync)?;
    let mut up = Up::new(handle.clone(), self.keypair.clone(), qresync.is_some());
    up.boot(&mut self.fetcher, uidvld_up, uidnext_up)?;
    let dn = Dn::open(handle);
    self.selected = Some((dn, up));
    Ok(())
  }

  /// The untagged FLAGS/EXISTS/RECENT/UIDVALIDITY/UIDNEXT block a SELECT must emit before its
  /// tagged OK, built from the freshly-opened Dn's view.
  fn select_responses(&self) -> error::Result<Vec<Response<'static>>> {
    let Some((dn, _)) = &self.selected else {
      return Ok(Vec::new());
    };
    let exists = dn.view().len() as u32;
    let uidvld = dn.uidvld_dn().try_into().map_err(|_| error::Error::msg(Kind::Value, "uidvalidity is zero"))?;
    let uidnext = dn.uid_dn_next().try_into().map_err(|_| error::Error::msg(Kind::Value, "uidnext is zero"))?;
    Ok(vec![
      Response::Data(Data::Flags(vec![
        imap_types::flag::Flag::Answered,
        imap_types::flag::Flag::Flagged,
        imap_types::flag::Flag::Seen,
        imap_types::flag::Flag::Draft,
        imap_types::flag::Flag::Deleted,
      ])),
      Response::Data(Data::Exists(exists)),
      Response::Data(Data::Recent(0)),
      Response::Status(
        Status::new(None, StatusKind::Ok, Some(Code::UidValidity(uidvld)), "UIDVALIDITY")
          .map_err(|e| error::Error::msg(Kind::Response, format!("{e:?}")))?,
      ),
      Response::Status(
        Status::new(None, StatusKind::Ok, Some(Code::UidNext(uidnext)), "UIDNEXT")
          .map_err(|e| error::Error::msg(Kind::Response, format!("{e:?}")))?,
      ),
    ])
  }

  fn selected_dn(&mut self) -> error::Result<&mut Dn> {
    self.dn_mut().ok_or_else(|| error::Error::msg(Kind::Param, "no mailbox selected"))
  }

  fn fetch_cmd(
    &mut self,
    sequence_set: &SequenceSet,
    names: &imap_types::fetch::MacroOrMessageDataItemNames<'static>,
    uid: bool,
  ) -> error::Result<Vec<Response<'static>>> {
    let item_names: Vec<imap_types::fetch::MessageDataItemName<'static>> = match names {
      imap_types::fetch::MacroOrMessageDataItemNames::Macro(m) => m.expand(),
      imap_types::fetch::MacroOrMessageDataItemNames::MessageDataItemNames(names) => names.clone(),
    };
    let set_seen = item_names.iter().any(|name| {
      matches!(
        name,
        imap_types::fetch::MessageDataItemName::Rfc822 | imap_types::fetch::MessageDataItemName::Rfc822Text
      ) || matches!(
        name,
        imap_types::fetch::MessageDataItemName::BodyExt { peek: false, .. }
      )
    });
    let dn = self.selected_dn()?;
    let max = if uid { dn.view().max_uid_dn() } else { dn.view().len() as u32 };
    let raw = dn::canon::resolve_sequence_set(sequence_set, max);
    let target = if uid { dn::Target::Uid(raw) } else { dn::Target::Sequence(raw) };
    let uid_dns = dn.resolve(&target);
    let entries = dn.fetch(&uid_dns, set_seen)?;
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
      let bytes = entry.path.as_ref().and_then(|path| std::fs::read(path).ok());
      let mut items = render::build_items(&item_names, bytes.as_deref(), entry.uid_dn, entry.flags, entry.length)?;
      if uid && !items.iter().any(|item| matches!(item, MessageDataItem::Uid(_))) {
        items.push(render::uid_item(entry.uid_dn)?);
      }
      let seq = entry.seq.try_into().map_err(|_| error::Error::msg(Kind::Value, "sequence number is zero"))?;
      let items = items.try_into().map_err(|_| error::Error::msg(Kind::Value, "FETCH produced no items"))?;
      out.push(Response::Data(Data::Fetch { seq, items }));
    }
    Ok(out)
  }

  fn store_cmd(
    &mut self,
    sequence_set: &SequenceSet,
    kind: StoreType,
    response: StoreResponse,
    flags: &[imap_types::flag::Flag<'static>],
    uid: bool,
  ) -> error::Result<Vec<Response<'static>>> {
    let dn = self.selected_dn()?;
    let max = if uid { dn.view().max_uid_dn() } else { dn.view().len() as u32 };
    let raw = dn::canon::resolve_sequence_set(sequence_set, max);
    let target = if uid { dn::Target::Uid(raw) } else { dn::Target::Sequence(raw) };
    let uid_dns = dn.resolve(&target);
    let wanted = dn::canon::flags_from_list(flags);
    let diff = StoreDiff {
      add: if matches!(kind, StoreType::Add | StoreType::Replace) { wanted } else { Default::default() },
      remove: if matches!(kind, StoreType::Remove) { wanted } else { Default::default() },
      set: matches!(kind, StoreType::Replace),
    };
    let silent = matches!(response, StoreResponse::Silent);
    let results = dn.store(&uid_dns, diff, silent)?;
    let mut out = Vec::with_capacity(results.len());
    for result in results {
      let mut items = vec![render::flags_item(result.flags)];
      if uid {
        items.push(render::uid_item(result.uid_dn)?);
      }
      let seq = result.seq.try_into().map_err(|_| error::Error::msg(Kind::Value, "sequence number is zero"))?;
      let items = items.try_into().map_err(|_| error::Error::msg(Kind::Value, "STORE produced no items"))?;
      out.push(Response::Data(Data::Fetch { seq, items }));
    }
    Ok(out)
  }

  fn copy_cmd(&mut self, sequence_set: &SequenceSet, mailbox: &str, uid: bool) -> error::Result<()> {
    let name = wire::utf7_to_utf8(mailbox)?;
    if Some(name.as_str()) != self.server.mailbox_name() {
      return Err(error::Error::msg(Kind::Param, "COPY to a different mailbox is not supported"));
    }
    let dn = self.selected_dn()?;
    let max = if uid { dn.view().max_uid_dn() } else { dn.view().len() as u32 };
    let raw = dn::canon::resolve_sequence_set(sequence_set, max);
    let target = if uid { dn::Target::Uid(raw) } else { dn::Target::Sequence(raw) };
    let uid_dns = dn.resolve(&target);
    dn.copy(&uid_dns)
  }

  fn expunge_cmd(&mut self, sequence_set: Option<&SequenceSet>) -> error::Result<Vec<Response<'static>>> {
    let dn = self.selected_dn()?;
    let candidates: Vec<u32> = match sequence_set {
      Some(set) => {
        let max = dn.view().max_uid_dn();
        let raw = dn::canon::resolve_sequence_set(set, max);
        dn.resolve(&dn::Target::Uid(raw))
      }
      None => dn.view().iter().map(|(u, _)| u).collect(),
    };
    let deleted = dn.deleted_among(&candidates);
    let removed = dn.expunge(&deleted)?;
    removed
      .into_iter()
      .map(|(seq, _)| {
        let seq = seq.try_into().map_err(|_| error::Error::msg(Kind::Value, "sequence number is zero"))?;
        Ok(Response::Data(Data::Expunge(seq)))
      })
      .collect()
  }

  fn search_cmd(&mut self, criteria: &[imap_types::search::SearchKey<'static>], uid: bool) -> error::Result<Vec<Response<'static>>> {
    let dn = self.selected_dn()?;
    let matches = dn.search(criteria, uid)?;
    let numbers: Vec<_> = matches.into_iter().filter_map(|n| n.try_into().ok()).collect();
    Ok(vec![Response::Data(Data::Search(numbers))])
  }

  /// Background maintenance tick: drains any unsolicited updates for the selected Dn and keeps
  /// the Up side's unfilled/unpushed work progressing between client commands (the equivalent of
  /// the remote connection's IDLE loop noticing new mail).
  pub fn tick(&mut self) -> error::Result<Vec<crate::dn::Unsolicited>> {
    let Some((dn, up)) = &mut self.selected else {
      return Ok(Vec::new());
    };
    up.fill_unfilled(&mut self.fetcher)?;
    up.push_expunges(&mut self.fetcher)?;
    Ok(dn.poll())
  }

  pub fn dn_mut(&mut self) -> Option<&mut Dn> {
    self.selected.as_mut().map(|(dn, _)| dn)
  }
}

/// Builds the tagged OK that closes out a successfully handled command.
pub fn tagged_ok(tag: Tag<'static>, text: &str) -> error::Result<Response<'static>> {
  Ok(Response::Status(
    Status::new(Some(tag), StatusKind::Ok, None, text).map_err(|e| error::Error::msg(Kind::Response, format!("{e:?}")))?,
  ))
}

/// Builds the tagged NO/BAD that closes out a failed command: malformed/unsupported requests are
/// BAD, everything else (login rejected, mailbox not found, ...) is NO.
pub fn tagged_error(tag: Tag<'static>, error: &error::Error) -> error::Result<Response<'static>> {
  let kind = match error.kind() {
    Kind::Param | Kind::Parse => StatusKind::Bad,
    _ => StatusKind::No,
  };
  Ok(Response::Status(
    Status::new(Some(tag), kind, None, format!("{error}")).map_err(|e| error::Error::msg(Kind::Response, format!("{e:?}")))?,
  ))
}
