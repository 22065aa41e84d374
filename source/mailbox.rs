// Per-mailbox state: msgs/expunges/mods trees, on-disk maildir layout, the update fan-out to
// registered Dns, and the update-request queue. One Mailbox per logical mailbox name, owned by
// DirMgr and shared (via Mutex) across its Up and Dns.

use crate::{
  error::{self, Kind},
  log::{Log, Tables},
  maildir,
  model::{Expunge, ExpungeState, Flags, Modseq, Msg, MsgKey, MsgState, Subdir, View},
};
use std::{
  collections::{BTreeMap, VecDeque},
  path::{Path, PathBuf},
};

/// One event delivered to a Dn's update queue. See SPEC_FULL.md §4.6.
#[derive(Clone, Debug)]
pub enum Update {
  New(MsgKey, u32),
  Meta(MsgKey, u32, Flags),
  Expunge(MsgKey, u32),
  Sync { ok: bool, text: Option<String> },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateReqKind {
  Store,
  Expunge,
  Copy,
}

#[derive(Clone, Debug)]
pub struct StoreDiff {
  pub add: Flags,
  pub remove: Flags,
  pub set: bool,
}

#[derive(Clone, Debug)]
pub struct UpdateReq {
  pub dn_id: u64,
  pub kind: UpdateReqKind,
  pub uid_dns: Vec<u32>,
  pub diff: Option<StoreDiff>,
}

pub struct Registrant {
  pub id: u64,
  pub queue: VecDeque<Update>,
}

pub struct Mailbox {
  pub name: String,
  dir: PathBuf,
  maildir: maildir::Maildir,
  log: Log,
  tables: Tables,
  uid_dn_next: u32,
  tmp_count: u64,
  hostname: String,
  registrants: Vec<Registrant>,
  next_registrant_id: u64,
  holds: u32,
  pub rm_on_close: bool,
}

impl Mailbox {
  pub fn open(root: &maildir::Builder, name: &str) -> error::Result<Self> {
    let maildir = root
      .mailbox(name)
      .map_err(|e| error::Error::new(Kind::Fs, e))?;
    let dir = maildir.path().to_path_buf();

    if dir.join(".invalid").exists() {
      Self::wipe(&dir)?;
    }

    let (log, tables) = Log::open(&dir)?;
    let mut mailbox = Self {
      name: name.to_string(),
      dir: dir.clone(),
      maildir,
      log,
      tables,
      uid_dn_next: 1,
      tmp_count: 0,
      hostname: hostname(),
      registrants: Vec::new(),
      next_registrant_id: 0,
      holds: 0,
      rm_on_close: false,
    };
    mailbox.uid_dn_next = mailbox
      .tables
      .msgs
      .values()
      .map(|m| m.uid_dn)
      .chain(mailbox.tables.expunges.values().map(|e| e.uid_dn))
      .max()
      .unwrap_or(0)
      + 1;
    mailbox.reconcile()?;
    Ok(mailbox)
  }

  fn wipe(dir: &Path) -> error::Result<()> {
    crate::log::remove(dir)?;
    if dir.join("cur").is_dir() {
      for entry in std::fs::read_dir(dir.join("cur"))? {
        std::fs::remove_file(entry?.path())?;
      }
    }
    let _ = std::fs::remove_file(dir.join(".invalid"));
    Ok(())
  }

  /// UIDVALIDITY changed upstream: wipe and start a fresh cache under a new uidvld_dn.
  pub fn invalidate(&mut self, new_uidvld_up: u32) -> error::Result<()> {
    std::fs::write(self.dir.join(".invalid"), b"")?;
    Self::wipe(&self.dir)?;
    let _ = std::fs::remove_file(self.dir.join(".invalid"));
    let (log, tables) = Log::open(&self.dir)?;
    self.log = log;
    self.tables = tables;
    self.uid_dn_next = 1;
    let new_uidvld_dn = new_uidvld_up ^ 0x5a5a_5a5a;
    self.log.set_uidvlds(new_uidvld_up, new_uidvld_dn)?;
    Ok(())
  }

  pub fn uidvld_up(&self) -> u32 {
    self.log.uidvld_up()
  }

  pub fn uidvld_dn(&self) -> u32 {
    self.log.uidvld_dn()
  }

  pub fn himodseq_up(&self) -> u64 {
    self.log.himodseq_up()
  }

  pub fn himodseq_dn(&self) -> Modseq {
    self.tables.himodseq_dn
  }

  pub fn uid_dn_next(&self) -> u32 {
    self.uid_dn_next
  }

  fn next_uid_dn(&mut self) -> u32 {
    let uid = self.uid_dn_next;
    self.uid_dn_next += 1;
    uid
  }

  fn next_modseq(&mut self) -> Modseq {
    self.tables.himodseq_dn + 1
  }

  /// Startup reconcile: cross-reference cur/new against the log's msgs/expunges trees.
  fn reconcile(&mut self) -> error::Result<()> {
    let mut on_disk: BTreeMap<MsgKey, (String, u64, Subdir)> = BTreeMap::new();
    for (subdir, label) in [(Subdir::Cur, "cur"), (Subdir::New, "new")] {
      let dir = self.dir.join(label);
      if !dir.is_dir() {
        continue;
      }
      for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let filename = entry.file_name().to_string_lossy().into_owned();
        let parsed = match maildir::Name::parse(&filename) {
          Ok(parsed) => parsed,
          Err(_) => continue,
        };
        on_disk.insert(MsgKey::up(parsed.uid_up), (filename, parsed.len, subdir));
      }
    }

    for (key, (filename, len, subdir)) in &on_disk {
      if let Some(msg) = self.tables.msgs.get_mut(key) {
        if msg.state == MsgState::Unfilled {
          msg.state = MsgState::Filled;
          msg.filename = Some(filename.clone());
          msg.length = Some(*len);
          msg.subdir = *subdir;
        }
      } else if self.tables.expunges.contains_key(key) {
        let _ = std::fs::remove_file(self.dir.join(match subdir {
          Subdir::Cur => "cur",
          Subdir::New => "new",
          Subdir::Tmp => "tmp",
        }).join(filename));
      } else {
        return Err(error::Error::msg(
          Kind::Fs,
          format!("on-disk message {filename:?} is in neither msgs nor expunges"),
        ));
      }
    }

    let stale: Vec<MsgKey> = self
      .tables
      .msgs
      .iter()
      .filter(|(key, msg)| msg.state == MsgState::Filled && !on_disk.contains_key(key))
      .map(|(key, _)| *key)
      .collect();
    for key in stale {
      let msg = self.tables.msgs.remove(&key).unwrap();
      let modseq = self.next_modseq();
      let expunge = Expunge {
        key,
        uid_dn: msg.uid_dn,
        state: ExpungeState::Unpushed,
        modseq,
      };
      self.tables.mods.insert(modseq, key);
      self.tables.himodseq_dn = modseq;
      self.log.update_expunge(&expunge)?;
      self.tables.expunges.insert(key, expunge);
    }

    self.maildir.wipe_tmp()?;
    Ok(())
  }

  pub fn register(&mut self) -> u64 {
    let id = self.next_registrant_id;
    self.next_registrant_id += 1;
    self.registrants.push(Registrant {
      id,
      queue: VecDeque::new(),
    });
    id
  }

  pub fn unregister(&mut self, id: u64) {
    self.registrants.retain(|r| r.id != id);
  }

  pub fn drain_updates(&mut self, id: u64) -> Vec<Update> {
    match self.registrants.iter_mut().find(|r| r.id == id) {
      Some(r) => r.queue.drain(..).collect(),
      None => Vec::new(),
    }
  }

  fn broadcast(&mut self, update: Update) {
    for registrant in &mut self.registrants {
      registrant.queue.push_back(update.clone());
    }
  }

  pub fn allow_download(&self) -> bool {
    self.holds == 0
  }

  pub fn hold(&mut self) {
    self.holds += 1;
  }

  pub fn unhold(&mut self) {
    self.holds = self.holds.saturating_sub(1);
  }

  pub fn snapshot_view(&self) -> View {
    let mut view = View::new();
    for msg in self.tables.msgs.values() {
      if msg.is_visible() {
        view.insert(msg.uid_dn, msg.key);
      }
    }
    view
  }

  pub fn msg(&self, key: &MsgKey) -> Option<&Msg> {
    self.tables.msgs.get(key)
  }

  pub fn msg_by_uid_dn(&self, uid_dn: u32) -> Option<&Msg> {
    self.tables.msgs.values().find(|m| m.uid_dn == uid_dn)
  }

  pub fn unfilled_uids_up(&self) -> Vec<u32> {
    self
      .tables
      .msgs
      .values()
      .filter(|m| m.state == MsgState::Unfilled && !m.key.is_local())
      .map(|m| m.key.uid_up)
      .collect()
  }

  pub fn unpushed_expunge_uids_up(&self) -> Vec<u32> {
    self
      .tables
      .expunges
      .values()
      .filter(|e| e.state == ExpungeState::Unpushed && !e.key.is_local())
      .map(|e| e.key.uid_up)
      .collect()
  }

  /// Record metadata for a UID the bootstrap/detection fetch discovered but hasn't downloaded yet.
  pub fn note_unfilled(&mut self, uid_up: u32, flags: Flags) -> error::Result<()> {
    let key = MsgKey::up(uid_up);
    if self.tables.msgs.contains_key(&key) || self.tables.expunges.contains_key(&key) {
      return Ok(());
    }
    let uid_dn = self.next_uid_dn();
    let msg = Msg {
      key,
      uid_dn,
      state: MsgState::Unfilled,
      internaldate: None,
      flags,
      modseq: 0,
      filename: None,
      length: None,
      subdir: Subdir::New,
    };
    self.log.update_msg(&msg)?;
    self.tables.msgs.insert(key, msg);
    self.broadcast(Update::New(key, uid_dn));
    Ok(())
  }

  pub fn note_vanished(&mut self, uid_up: u32) -> error::Result<()> {
    let key = MsgKey::up(uid_up);
    if let Some(msg) = self.tables.msgs.remove(&key) {
      let modseq = self.next_modseq();
      let expunge = Expunge {
        key,
        uid_dn: msg.uid_dn,
        state: ExpungeState::Pushed,
        modseq,
      };
      self.tables.mods.insert(modseq, key);
      self.tables.himodseq_dn = modseq;
      self.log.update_expunge(&expunge)?;
      self.broadcast(Update::Expunge(key, msg.uid_dn));
      self.tables.expunges.insert(key, expunge);
    }
    Ok(())
  }

  /// Complete an Unfilled message's body download: write plaintext under cur/, mark Filled.
  pub fn fill(&mut self, uid_up: u32, plaintext: &[u8], flags: Flags) -> error::Result<()> {
    let key = MsgKey::up(uid_up);
    let uid_dn = match self.tables.msgs.get(&key) {
      Some(msg) => msg.uid_dn,
      None => return Ok(()),
    };
    self.tmp_count += 1;
    let scratch = self.maildir.tmp_scratch(self.tmp_count, plaintext)?;
    let name = maildir::Name {
      epoch: epoch_now(),
      uid_up,
      len: plaintext.len() as u64,
      info: None,
    };
    let dest = self.maildir.commit(&scratch, &name, &self.hostname)?;
    let modseq = self.next_modseq();
    let msg = Msg {
      key,
      uid_dn,
      state: MsgState::Filled,
      internaldate: Some(epoch_now()),
      flags,
      modseq,
      filename: Some(dest.file_name().unwrap().to_string_lossy().into_owned()),
      length: Some(plaintext.len() as u64),
      subdir: Subdir::Cur,
    };
    self.tables.mods.insert(modseq, key);
    self.tables.himodseq_dn = modseq;
    self.log.update_msg(&msg)?;
    self.broadcast(Update::Meta(key, uid_dn, msg.flags));
    self.tables.msgs.insert(key, msg);
    Ok(())
  }

  pub fn message_path(&self, key: &MsgKey) -> Option<PathBuf> {
    let msg = self.tables.msgs.get(key)?;
    let filename = msg.filename.as_ref()?;
    let subdir = match msg.subdir {
      Subdir::Cur => "cur",
      Subdir::New => "new",
      Subdir::Tmp => "tmp",
    };
    Some(self.dir.join(subdir).join(filename))
  }

  /// Apply an UpdateReq from a Dn: produce Meta/Expunge events for the requester and all other
  /// registrants, in submission order, ending with a Sync marker for the requester.
  pub fn apply(&mut self, req: UpdateReq) -> error::Result<()> {
    match req.kind {
      UpdateReqKind::Store => {
        let diff = req.diff.expect("store request without a diff");
        for uid_dn in &req.uid_dns {
          let key = match self.tables.msgs.iter().find(|(_, m)| m.uid_dn == *uid_dn) {
            Some((key, _)) => *key,
            None => continue,
          };
          let modseq = self.next_modseq();
          let msg = self.tables.msgs.get_mut(&key).unwrap();
          msg.flags = apply_diff(msg.flags, &diff);
          msg.modseq = modseq;
          let snapshot = msg.clone();
          self.tables.mods.insert(modseq, key);
          self.tables.himodseq_dn = modseq;
          self.log.update_msg(&snapshot)?;
          self.broadcast(Update::Meta(key, *uid_dn, snapshot.flags));
        }
      }
      UpdateReqKind::Expunge => {
        for uid_dn in &req.uid_dns {
          let key = match self.tables.msgs.iter().find(|(_, m)| m.uid_dn == *uid_dn) {
            Some((key, _)) => *key,
            None => continue,
          };
          let msg = self.tables.msgs.remove(&key).unwrap();
          let modseq = self.next_modseq();
          let expunge = Expunge {
            key,
            uid_dn: msg.uid_dn,
            state: ExpungeState::Unpushed,
            modseq,
          };
          self.tables.mods.insert(modseq, key);
          self.tables.himodseq_dn = modseq;
          self.log.update_expunge(&expunge)?;
          self.broadcast(Update::Expunge(key, *uid_dn));
          if let Some(filename) = &msg.filename {
            let _ = std::fs::remove_file(self.dir.join("cur").join(filename));
          }
          self.tables.expunges.insert(key, expunge);
        }
      }
      UpdateReqKind::Copy => {
        for uid_dn in &req.uid_dns {
          let source = match self.tables.msgs.values().find(|m| m.uid_dn == *uid_dn) {
            Some(m) => m.clone(),
            None => continue,
          };
          let local_uid = self.tmp_count + 1;
          self.tmp_count += 1;
          let key = MsgKey::local(local_uid as u32);
          let new_uid_dn = self.next_uid_dn();
          let modseq = self.next_modseq();
          let mut copy = source;
          copy.key = key;
          copy.uid_dn = new_uid_dn;
          copy.modseq = modseq;
          self.tables.mods.insert(modseq, key);
          self.tables.himodseq_dn = modseq;
          self.log.update_msg(&copy)?;
          self.broadcast(Update::New(key, new_uid_dn));
          self.tables.msgs.insert(key, copy);
        }
      }
    }
    if let Some(registrant) = self.registrants.iter_mut().find(|r| r.id == req.dn_id) {
      registrant.queue.push_back(Update::Sync {
        ok: true,
        text: None,
      });
    }
    Ok(())
  }
}

fn apply_diff(flags: Flags, diff: &StoreDiff) -> Flags {
  if diff.set {
    return diff.add;
  }
  let mut out = flags;
  if diff.add.answered {
    out.answered = true;
  }
  if diff.add.flagged {
    out.flagged = true;
  }
  if diff.add.seen {
    out.seen = true;
  }
  if diff.add.draft {
    out.draft = true;
  }
  if diff.add.deleted {
    out.deleted = true;
  }
  if diff.remove.answered {
    out.answered = false;
  }
  if diff.remove.flagged {
    out.flagged = false;
  }
  if diff.remove.seen {
    out.seen = false;
  }
  if diff.remove.draft {
    out.draft = false;
  }
  if diff.remove.deleted {
    out.deleted = false;
  }
  out
}

fn hostname() -> String {
  std::env::var("HOSTNAME").unwrap_or_else(|_| "citm".to_string())
}

fn epoch_now() -> u64 {
  std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn open(dir: &Path) -> Mailbox {
    let builder = maildir::Builder::new(dir).unwrap();
    Mailbox::open(&builder, "INBOX").unwrap()
  }

  #[test]
  fn empty_mailbox_has_no_visible_messages() {
    let dir = tempfile::tempdir().unwrap();
    let mailbox = open(dir.path());
    assert_eq!(0, mailbox.snapshot_view().len());
    assert_eq!(1, mailbox.uid_dn_next());
  }

  #[test]
  fn note_unfilled_then_fill_assigns_modseq() {
    let dir = tempfile::tempdir().unwrap();
    let mut mailbox = open(dir.path());
    mailbox.note_unfilled(7, Flags::default()).unwrap();
    assert_eq!(vec![7], mailbox.unfilled_uids_up());
    mailbox.fill(7, b"hello", Flags::default()).unwrap();
    assert!(mailbox.unfilled_uids_up().is_empty());
    let view = mailbox.snapshot_view();
    assert_eq!(1, view.len());
    assert!(mailbox.himodseq_dn() > 0);
  }

  #[test]
  fn expunge_ordering_reverse_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let mut mailbox = open(dir.path());
    for uid in [1u32, 2, 3] {
      mailbox.note_unfilled(uid, Flags::default()).unwrap();
      mailbox.fill(uid, b"x", Flags::default()).unwrap();
    }
    let id = mailbox.register();
    let view = mailbox.snapshot_view();
    let uid_dns: Vec<u32> = view.iter().map(|(u, _)| u).collect();
    mailbox
      .apply(UpdateReq {
        dn_id: id,
        kind: UpdateReqKind::Expunge,
        uid_dns: uid_dns.clone(),
        diff: None,
      })
      .unwrap();
    let updates = mailbox.drain_updates(id);
    let expunged: Vec<u32> = updates
      .iter()
      .filter_map(|u| match u {
        Update::Expunge(_, uid_dn) => Some(*uid_dn),
        _ => None,
      })
      .collect();
    assert_eq!(uid_dns, expunged);
  }
}
