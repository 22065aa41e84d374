// Downward view: translates a client's SELECT/SEARCH/FETCH/STORE/EXPUNGE/COPY against a Mailbox's
// shared state into IMAP responses, and drains the Mailbox's broadcast queue into unsolicited
// untagged responses (EXISTS/EXPUNGE/FETCH) between commands, the way a real server interleaves
// them. One Dn per selected mailbox per SfPair.

use crate::{
  error::{self, Kind},
  mailbox::{Mailbox, StoreDiff, Update, UpdateReq, UpdateReqKind},
  model::{Flags, MsgKey, View},
};
use std::sync::{Arc, Mutex};

pub struct Dn {
  mailbox: Arc<Mutex<Mailbox>>,
  registrant_id: u64,
  view: View,
}

/// A subset of sequence numbers or UIDs, already resolved against a snapshot View so a
/// FETCH/STORE/COPY always sees a fixed set of targets for the duration of the command even if
/// the mailbox mutates concurrently (another Dn's STORE, or Up filling a message) mid-command.
pub enum Target {
  Sequence(Vec<u32>),
  Uid(Vec<u32>),
}

impl Dn {
  pub fn open(mailbox: Arc<Mutex<Mailbox>>) -> Self {
    let registrant_id = mailbox.lock().unwrap().register();
    let view = mailbox.lock().unwrap().snapshot_view();
    Self {
      mailbox,
      registrant_id,
      view,
    }
  }

  pub fn view(&self) -> &View {
    &self.view
  }

  pub fn close(&mut self) {
    self.mailbox.lock().unwrap().unregister(self.registrant_id);
  }

  /// Resolves a sequence-set string (already validated by the wire layer) against either sequence
  /// numbers or UIDs in the current view.
  pub fn resolve(&self, target: &Target) -> Vec<u32> {
    match target {
      Target::Sequence(seqs) => seqs
        .iter()
        .filter_map(|&seq| self.view.uid_dn_at_seq(seq))
        .collect(),
      Target::Uid(uids) => uids
        .iter()
        .filter(|&&uid| self.view.iter().any(|(u, _)| u == uid))
        .copied()
        .collect(),
    }
  }

  /// Two-phase FETCH: phase one (here) locates the message bodies on disk and marks \Seen unless
  /// the client asked for a .PEEK item; phase two (the caller, in render.rs/sfpair.rs) reads the
  /// bytes off disk and renders the requested items.
  pub fn fetch(&mut self, uid_dns: &[u32], set_seen: bool) -> error::Result<Vec<FetchEntry>> {
    let mut entries = Vec::with_capacity(uid_dns.len());
    let mailbox = self.mailbox.lock().unwrap();
    for &uid_dn in uid_dns {
      let Some(msg) = mailbox.msg_by_uid_dn(uid_dn) else {
        continue;
      };
      let Some(seq) = self.view.seq_of(uid_dn) else {
        continue;
      };
      entries.push(FetchEntry {
        seq,
        uid_dn,
        key: msg.key,
        flags: msg.flags,
        modseq: msg.modseq,
        path: mailbox.message_path(&msg.key),
        length: msg.length,
      });
    }
    drop(mailbox);
    if set_seen {
      let unseen: Vec<u32> = entries.iter().filter(|e| !e.flags.seen).map(|e| e.uid_dn).collect();
      if !unseen.is_empty() {
        self.store(
          &unseen,
          StoreDiff {
            add: Flags {
              seen: true,
              ..Flags::default()
            },
            remove: Flags::default(),
            set: false,
          },
          true,
        )?;
        for entry in &mut entries {
          if unseen.contains(&entry.uid_dn) {
            entry.flags.seen = true;
          }
        }
      }
    }
    Ok(entries)
  }

  /// STORE: applies the diff, then reports the post-store (seq, uid_dn, flags) of every affected
  /// message so the caller can echo them back to the requester as untagged FETCH responses. When
  /// `silent` is set (STORE ... .SILENT, or the implicit \Seen-set from fetch above) the caller
  /// gets nothing back for its own command; other registrants still see the change on their own
  /// next `poll`, since `Mailbox::apply` broadcasts to every registrant unconditionally.
  pub fn store(&mut self, uid_dns: &[u32], diff: StoreDiff, silent: bool) -> error::Result<Vec<StoreResult>> {
    let mut mailbox = self.mailbox.lock().unwrap();
    mailbox.apply(UpdateReq {
      dn_id: self.registrant_id,
      kind: UpdateReqKind::Store,
      uid_dns: uid_dns.to_vec(),
      diff: Some(diff),
    })?;
    drop(mailbox);
    let mut results = Vec::new();
    for update in self.mailbox.lock().unwrap().drain_updates(self.registrant_id) {
      match update {
        Update::Meta(_, uid_dn, flags) => {
          if !silent {
            if let Some(seq) = self.view.seq_of(uid_dn) {
              results.push(StoreResult { seq, uid_dn, flags });
            }
          }
        }
        Update::Sync { ok, text } => {
          if !ok {
            return Err(error::Error::msg(Kind::Response, text.unwrap_or_default()));
          }
        }
        _ => {}
      }
    }
    Ok(results)
  }

  /// Messages among `uid_dns` currently marked \Deleted, the set EXPUNGE/CLOSE actually remove.
  pub fn deleted_among(&self, uid_dns: &[u32]) -> Vec<u32> {
    let mailbox = self.mailbox.lock().unwrap();
    uid_dns
      .iter()
      .copied()
      .filter(|&uid_dn| mailbox.msg_by_uid_dn(uid_dn).map(|m| m.flags.deleted).unwrap_or(false))
      .collect()
  }

  /// EXPUNGE / UID EXPUNGE / CLOSE: removes the given messages and reports them back in reverse
  /// sequence order, the order a real IMAP server must use so sequence numbers named by an
  /// earlier EXPUNGE response remain valid for a later one in the same batch.
  pub fn expunge(&mut self, uid_dns: &[u32]) -> error::Result<Vec<(u32, u32)>> {
    let mut mailbox = self.mailbox.lock().unwrap();
    mailbox.apply(UpdateReq {
      dn_id: self.registrant_id,
      kind: UpdateReqKind::Expunge,
      uid_dns: uid_dns.to_vec(),
      diff: None,
    })?;
    drop(mailbox);
    let mut removed: Vec<(u32, u32)> = Vec::new();
    for &uid_dn in uid_dns {
      if let Some(seq) = self.view.seq_of(uid_dn) {
        removed.push((seq, uid_dn));
        self.view.remove(uid_dn);
      }
    }
    self.drain_sync()?;
    removed.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(removed)
  }

  pub fn copy(&mut self, uid_dns: &[u32]) -> error::Result<()> {
    let mut mailbox = self.mailbox.lock().unwrap();
    mailbox.apply(UpdateReq {
      dn_id: self.registrant_id,
      kind: UpdateReqKind::Copy,
      uid_dns: uid_dns.to_vec(),
      diff: None,
    })?;
    drop(mailbox);
    self.drain_sync()
  }

  /// SEARCH: evaluates `criteria` (implicitly ANDed, per RFC 3501's parenthesized-list syntax)
  /// against this view's current flags and position, returning sequence numbers or UIDs.
  pub fn search(&self, criteria: &[imap_types::search::SearchKey], uid: bool) -> error::Result<Vec<u32>> {
    let mailbox = self.mailbox.lock().unwrap();
    let max_seq = self.view.len() as u32;
    let max_uid = self.view.max_uid_dn();
    let mut matches = Vec::new();
    for (uid_dn, key) in self.view.iter() {
      let Some(msg) = mailbox.msg(&key) else {
        continue;
      };
      let Some(seq) = self.view.seq_of(uid_dn) else {
        continue;
      };
      let mut hit = true;
      for criterion in criteria {
        if !eval_search_key(criterion, seq, uid_dn, msg.flags, max_seq, max_uid)? {
          hit = false;
          break;
        }
      }
      if hit {
        matches.push(if uid { uid_dn } else { seq });
      }
    }
    Ok(matches)
  }

  fn drain_sync(&mut self) -> error::Result<()> {
    for update in self.mailbox.lock().unwrap().drain_updates(self.registrant_id) {
      if let Update::Sync { ok, text } = update {
        if !ok {
          return Err(error::Error::msg(Kind::Response, text.unwrap_or_default()));
        }
      }
    }
    Ok(())
  }

  /// Pulls whatever New/Meta/Expunge events arrived since the last poll and folds them into this
  /// Dn's view, returning the untagged responses the caller should emit (in submission order,
  /// except expunges which the caller reverses per-batch as `expunge` does for its own calls).
  pub fn poll(&mut self) -> Vec<Unsolicited> {
    let updates = self.mailbox.lock().unwrap().drain_updates(self.registrant_id);
    let mut out = Vec::new();
    for update in updates {
      match update {
        Update::New(key, uid_dn) => {
          self.view.insert(uid_dn, key);
          out.push(Unsolicited::Exists(self.view.len() as u32));
        }
        Update::Meta(_, uid_dn, flags) => {
          if let Some(seq) = self.view.seq_of(uid_dn) {
            out.push(Unsolicited::Fetch(seq, uid_dn, flags));
          }
        }
        Update::Expunge(_, uid_dn) => {
          if let Some(seq) = self.view.seq_of(uid_dn) {
            self.view.remove(uid_dn);
            out.push(Unsolicited::Expunge(seq));
          }
        }
        Update::Sync { .. } => {}
      }
    }
    out
  }

  pub fn himodseq_dn(&self) -> u64 {
    self.mailbox.lock().unwrap().himodseq_dn()
  }

  pub fn uidvld_dn(&self) -> u32 {
    self.mailbox.lock().unwrap().uidvld_dn()
  }

  pub fn uid_dn_next(&self) -> u32 {
    self.mailbox.lock().unwrap().uid_dn_next()
  }
}

pub struct FetchEntry {
  pub seq: u32,
  pub uid_dn: u32,
  pub key: MsgKey,
  pub flags: Flags,
  pub modseq: u64,
  pub path: Option<std::path::PathBuf>,
  pub length: Option<u64>,
}

pub struct StoreResult {
  pub seq: u32,
  pub uid_dn: u32,
  pub flags: Flags,
}

#[derive(Clone, Debug)]
pub enum Unsolicited {
  Exists(u32),
  Expunge(u32),
  Fetch(u32, u32, Flags),
}

/// Matches a SEARCH key against one message's position/flags. Structural and flag-based keys
/// only: content and date keys (HEADER, SUBJECT, SINCE, ...) aren't implemented, since nothing
/// here keeps a parsed date or indexed header text around to test them against.
fn eval_search_key(
  key: &imap_types::search::SearchKey,
  seq: u32,
  uid_dn: u32,
  flags: Flags,
  max_seq: u32,
  max_uid: u32,
) -> error::Result<bool> {
  use imap_types::search::SearchKey;
  Ok(match key {
    SearchKey::All => true,
    SearchKey::Answered => flags.answered,
    SearchKey::Unanswered => !flags.answered,
    SearchKey::Flagged => flags.flagged,
    SearchKey::Unflagged => !flags.flagged,
    SearchKey::Seen => flags.seen,
    SearchKey::Unseen => !flags.seen,
    SearchKey::Draft => flags.draft,
    SearchKey::Undraft => !flags.draft,
    SearchKey::Deleted => flags.deleted,
    SearchKey::Undeleted => !flags.deleted,
    SearchKey::New => !flags.seen,
    SearchKey::Old => flags.seen,
    SearchKey::Recent => false,
    SearchKey::SequenceSet(set) => canon::resolve_sequence_set(set, max_seq).contains(&seq),
    SearchKey::Uid(set) => canon::resolve_sequence_set(set, max_uid).contains(&uid_dn),
    SearchKey::And(keys) => {
      for inner in keys.as_ref() {
        if !eval_search_key(inner, seq, uid_dn, flags, max_seq, max_uid)? {
          return Ok(false);
        }
      }
      true
    }
    SearchKey::Or(a, b) => {
      eval_search_key(a, seq, uid_dn, flags, max_seq, max_uid)?
        || eval_search_key(b, seq, uid_dn, flags, max_seq, max_uid)?
    }
    SearchKey::Not(inner) => !eval_search_key(inner, seq, uid_dn, flags, max_seq, max_uid)?,
    _ => return Err(error::Error::msg(Kind::Param, "unsupported SEARCH key")),
  })
}

/// Shared sequence-set/flag canonicalization used by FETCH, STORE and SEARCH alike so the three
/// commands resolve "1:*,5" and flag lists the same way.
pub mod canon {
  use crate::model::Flags;
  use imap_types::{
    flag::Flag,
    sequence::{SeqOrUid, Sequence, SequenceSet},
  };

  /// Expands a sequence-set into concrete numbers (sequence numbers or UIDs depending on the
  /// caller), resolving "*" against `max`.
  pub fn resolve_sequence_set(set: &SequenceSet, max: u32) -> Vec<u32> {
    let mut out = Vec::new();
    for sequence in set.0.as_ref() {
      match sequence {
        Sequence::Single(value) => out.push(resolve_value(value, max)),
        Sequence::Range(lo, hi) => {
          let lo = resolve_value(lo, max);
          let hi = resolve_value(hi, max);
          let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
          out.extend(lo..=hi);
        }
      }
    }
    out
  }

  fn resolve_value(value: &SeqOrUid, max: u32) -> u32 {
    match value {
      SeqOrUid::Value(v) => u32::from(*v),
      SeqOrUid::Asterisk => max,
    }
  }

  pub fn flags_from_list(flags: &[Flag]) -> Flags {
    let mut out = Flags::default();
    for flag in flags {
      match flag {
        Flag::Answered => out.answered = true,
        Flag::Flagged => out.flagged = true,
        Flag::Seen => out.seen = true,
        Flag::Draft => out.draft = true,
        Flag::Deleted => out.deleted = true,
        _ => {}
      }
    }
    out
  }
}

#[cfg(test)]
mod tests {
  use super::canon::*;
  use imap_types::{flag::Flag, sequence::SequenceSet};

  #[test]
  fn sequence_set_parses_ranges_and_star() {
    let set: SequenceSet = "1:3,10".try_into().unwrap();
    assert_eq!(vec![1, 2, 3, 10], resolve_sequence_set(&set, 10));
    let set: SequenceSet = "7:*".try_into().unwrap();
    assert_eq!(vec![7, 8, 9, 10], resolve_sequence_set(&set, 10));
  }

  #[test]
  fn flag_list_maps_known_flags() {
    let flags = flags_from_list(&[Flag::Seen, Flag::Deleted]);
    assert!(flags.seen);
    assert!(flags.deleted);
    assert!(!flags.answered);
  }
}
