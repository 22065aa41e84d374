// The message model: MsgKey, Msg, Expunge, View and the orderings between them. See source/log.rs
// for the on-disk marshaling of these types.

use crate::error::{self, Kind};
use std::{cmp, collections::BTreeMap, fmt};

pub type Modseq = u64;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MsgKey {
  pub uid_up: u32,
  pub uid_local: u32,
}

impl MsgKey {
  pub fn up(uid_up: u32) -> Self {
    Self {
      uid_up,
      uid_local: 0,
    }
  }

  pub fn local(uid_local: u32) -> Self {
    Self {
      uid_up: 0,
      uid_local,
    }
  }

  pub fn is_local(&self) -> bool {
    self.uid_up == 0
  }
}

impl fmt::Display for MsgKey {
  fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
    write!(formatter, "m.{}.{}", self.uid_up, self.uid_local)
  }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct Flags {
  pub answered: bool,
  pub flagged: bool,
  pub seen: bool,
  pub draft: bool,
  pub deleted: bool,
}

impl Flags {
  // The log's flag column is an unordered subset of the letters ADFSX.
  pub fn to_letters(&self) -> String {
    let mut s = String::new();
    if self.answered {
      s.push('A');
    }
    if self.draft {
      s.push('D');
    }
    if self.flagged {
      s.push('F');
    }
    if self.seen {
      s.push('S');
    }
    if self.deleted {
      s.push('X');
    }
    s
  }

  pub fn from_letters(letters: &str) -> error::Result<Self> {
    let mut flags = Flags::default();
    for letter in letters.chars() {
      match letter {
        'A' => flags.answered = true,
        'D' => flags.draft = true,
        'F' => flags.flagged = true,
        'S' => flags.seen = true,
        'X' => flags.deleted = true,
        _ => {
          return Err(error::Error::msg(
            Kind::Parse,
            format!("invalid flag letter {letter:?}"),
          ))
        }
      }
    }
    Ok(flags)
  }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MsgState {
  Unfilled,
  Filled,
  Expunged,
  Not4Me,
}

impl MsgState {
  pub fn tag(&self) -> char {
    match self {
      MsgState::Unfilled => 'u',
      MsgState::Filled => 'f',
      MsgState::Not4Me => 'n',
      // Expunged messages are recorded in the expunges tree, never as a Msg tag; msg.rs never
      // serializes this variant directly.
      MsgState::Expunged => 'f',
    }
  }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Subdir {
  Cur,
  Tmp,
  New,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Msg {
  pub key: MsgKey,
  pub uid_dn: u32,
  pub state: MsgState,
  pub internaldate: Option<crate::maildir::Epoch>,
  pub flags: Flags,
  pub modseq: Modseq,
  pub filename: Option<String>,
  pub length: Option<u64>,
  pub subdir: Subdir,
}

impl Msg {
  pub fn unfilled(key: MsgKey, uid_dn: u32) -> Self {
    Self {
      key,
      uid_dn,
      state: MsgState::Unfilled,
      internaldate: None,
      flags: Flags::default(),
      modseq: 0,
      filename: None,
      length: None,
      subdir: Subdir::New,
    }
  }

  pub fn is_visible(&self) -> bool {
    matches!(self.state, MsgState::Filled) && self.uid_dn != 0
  }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExpungeState {
  Unpushed,
  Pushed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expunge {
  pub key: MsgKey,
  pub uid_dn: u32,
  pub state: ExpungeState,
  pub modseq: Modseq,
}

/// A downstream client's ordered snapshot of visible messages. Sequence number is index+1 in
/// `by_uid_dn` order.
#[derive(Clone, Debug, Default)]
pub struct View {
  by_uid_dn: BTreeMap<u32, MsgKey>,
}

impl View {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, uid_dn: u32, key: MsgKey) {
    self.by_uid_dn.insert(uid_dn, key);
  }

  pub fn remove(&mut self, uid_dn: u32) -> Option<MsgKey> {
    self.by_uid_dn.remove(&uid_dn)
  }

  pub fn len(&self) -> usize {
    self.by_uid_dn.len()
  }

  pub fn is_empty(&self) -> bool {
    self.by_uid_dn.is_empty()
  }

  pub fn max_uid_dn(&self) -> u32 {
    self.by_uid_dn.keys().next_back().copied().unwrap_or(0)
  }

  /// Sequence number (1-based) of a uid_dn, if present in this view.
  pub fn seq_of(&self, uid_dn: u32) -> Option<u32> {
    self
      .by_uid_dn
      .keys()
      .position(|&u| u == uid_dn)
      .map(|i| (i + 1) as u32)
  }

  pub fn uid_dn_at_seq(&self, seq: u32) -> Option<u32> {
    if seq == 0 {
      return None;
    }
    self.by_uid_dn.keys().nth((seq - 1) as usize).copied()
  }

  pub fn key_at_seq(&self, seq: u32) -> Option<MsgKey> {
    self
      .by_uid_dn
      .values()
      .nth((seq - 1) as usize)
      .copied()
  }

  pub fn iter(&self) -> impl DoubleEndedIterator<Item = (u32, MsgKey)> + '_ {
    self.by_uid_dn.iter().map(|(&u, &k)| (u, k))
  }
}

pub fn cmp_key(a: &MsgKey, b: &MsgKey) -> cmp::Ordering {
  a.uid_up.cmp(&b.uid_up).then(a.uid_local.cmp(&b.uid_local))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn flags_round_trip() {
    let flags = Flags {
      answered: true,
      flagged: false,
      seen: true,
      draft: false,
      deleted: true,
    };
    let letters = flags.to_letters();
    assert_eq!("ASX", letters);
    assert_eq!(flags, Flags::from_letters(&letters).unwrap());
  }

  #[test]
  fn view_seq_numbers() {
    let mut view = View::new();
    view.insert(5, MsgKey::up(5));
    view.insert(2, MsgKey::up(2));
    view.insert(9, MsgKey::up(9));
    assert_eq!(Some(1), view.seq_of(2));
    assert_eq!(Some(2), view.seq_of(5));
    assert_eq!(Some(3), view.seq_of(9));
    assert_eq!(3, view.len());
    assert_eq!(9, view.max_uid_dn());
  }

  #[test]
  fn key_ordering() {
    let mut keys = vec![MsgKey::up(3), MsgKey::local(1), MsgKey::up(1)];
    keys.sort_by(cmp_key);
    assert_eq!(
      vec![MsgKey::local(1), MsgKey::up(1), MsgKey::up(3)],
      keys
    );
  }
}
