// The append-only, self-compacting journal backing one mailbox's cache. One line per record:
// `key|value\n`. See SPEC_FULL.md §4.1 for the exact key/value grammar this mirrors.

use crate::{
  error::{self, Kind},
  model::{Expunge, ExpungeState, Flags, Modseq, Msg, MsgKey, MsgState, Subdir},
};
use std::{
  collections::BTreeMap,
  fs, io,
  io::{BufRead, Write as _},
  path::{Path, PathBuf},
};

const COMPACT_MIN_LINES: u64 = 1000;

/// `Y.M.D.h.m.s.tzh.tzm`, stored verbatim; this proxy treats internaldate as an opaque stamp it
/// received from the upstream server (or generated for local APPENDs) and only needs to echo back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stamp(pub String);

impl Stamp {
  pub fn now() -> Self {
    // SystemTime has no calendar breakdown in std; the fields are opaque to us (see above), so a
    // monotonic placeholder keyed off epoch seconds is sufficient for locally-originated records.
    let epoch = std::time::SystemTime::now()
      .duration_since(std::time::UNIX_EPOCH)
      .unwrap_or_default()
      .as_secs();
    Self(format!("{epoch}.0.0.0.0.0.0.0"))
  }
}

#[derive(Default)]
pub struct Tables {
  pub msgs: BTreeMap<MsgKey, Msg>,
  pub expunges: BTreeMap<MsgKey, Expunge>,
  pub mods: BTreeMap<Modseq, MsgKey>,
  pub himodseq_dn: Modseq,
}

pub struct Log {
  path: PathBuf,
  file: fs::File,
  lines: u64,
  updates: u64,
  uidvld_up: u32,
  uidvld_dn: u32,
  himodseq_up: u64,
}

fn marshal_msg(msg: &Msg) -> String {
  let tag = msg.state.tag();
  let mut s = format!("1:{}:{}:{}", msg.uid_dn, msg.modseq, tag);
  if matches!(msg.state, MsgState::Filled | MsgState::Not4Me) {
    s.push(':');
    s.push_str(&msg.flags.to_letters());
    s.push(':');
    s.push_str(
      &msg
        .internaldate
        .map(|e| e.to_string())
        .unwrap_or_else(|| "0".to_string()),
    );
  }
  s
}

fn marshal_expunge(expunge: &Expunge) -> String {
  let tag = match expunge.state {
    ExpungeState::Unpushed => 'e',
    ExpungeState::Pushed => 'x',
  };
  format!("1:{}:{}:{}", expunge.uid_dn, expunge.modseq, tag)
}

enum Parsed {
  Msg(Msg),
  Expunge(Expunge),
}

fn parse_value(key: MsgKey, value: &str) -> error::Result<Parsed> {
  let fields: Vec<&str> = value.splitn(6, ':').collect();
  if fields.len() < 4 || fields[0] != "1" {
    return Err(error::Error::msg(Kind::Parse, format!("bad log value {value:?}")));
  }
  let uid_dn: u32 = fields[1]
    .parse()
    .map_err(|_| error::Error::msg(Kind::Parse, "bad uid_dn"))?;
  let modseq: Modseq = fields[2]
    .parse()
    .map_err(|_| error::Error::msg(Kind::Parse, "bad modseq"))?;
  let tag = fields[3]
    .chars()
    .next()
    .ok_or_else(|| error::Error::msg(Kind::Parse, "empty tag"))?;

  match tag {
    'u' | 'f' | 'n' => {
      let state = match tag {
        'u' => MsgState::Unfilled,
        'f' => MsgState::Filled,
        'n' => MsgState::Not4Me,
        _ => unreachable!(),
      };
      if modseq > 0 && state == MsgState::Unfilled {
        return Err(error::Error::msg(
          Kind::Parse,
          "invalid nonzero modseq on non-FILLED message",
        ));
      }
      if modseq == 0 && state == MsgState::Filled {
        return Err(error::Error::msg(
          Kind::Parse,
          "invalid zero modseq on FILLED message",
        ));
      }
      let flags = fields.get(4).copied().unwrap_or("");
      Ok(Parsed::Msg(Msg {
        key,
        uid_dn,
        state,
        internaldate: fields.get(5).and_then(|s| s.split('.').next()).and_then(|s| s.parse().ok()),
        flags: Flags::from_letters(flags)?,
        modseq,
        filename: None,
        length: None,
        subdir: Subdir::Cur,
      }))
    }
    'e' | 'x' => {
      let state = if tag == 'e' {
        ExpungeState::Unpushed
      } else {
        ExpungeState::Pushed
      };
      Ok(Parsed::Expunge(Expunge {
        key,
        uid_dn,
        state,
        modseq,
      }))
    }
    _ => Err(error::Error::msg(Kind::Parse, format!("unknown tag {tag:?}"))),
  }
}

fn is_tombstone(value: &str) -> bool {
  value == "1:0:0:x"
}

fn key_for_line(key: &str) -> Option<MsgKey> {
  let rest = key.strip_prefix("m.")?;
  let (uid_up, uid_local) = rest.split_once('.')?;
  Some(MsgKey {
    uid_up: uid_up.parse().ok()?,
    uid_local: uid_local.parse().ok()?,
  })
}

impl Log {
  pub fn open(dir: &Path) -> error::Result<(Self, Tables)> {
    let path = dir.join(".cache");
    let tmppath = dir.join(".cache.tmp");
    if !path.exists() {
      fs::File::create(&path)?;
    }

    let mut log = Self {
      path: path.clone(),
      file: fs::OpenOptions::new().append(true).open(&path)?,
      lines: 0,
      updates: 0,
      uidvld_up: 0,
      uidvld_dn: 0,
      himodseq_up: 0,
    };

    let mut tables = Tables::default();
    tables.himodseq_dn = 1;

    let read_file = fs::File::open(&path)?;
    let mut reader = io::BufReader::new(read_file);
    let mut valid_len: u64 = 0;
    let mut want_trunc = false;
    let mut buf = String::new();
    loop {
      buf.clear();
      let n = reader.read_line(&mut buf)?;
      if n == 0 {
        break;
      }
      if !buf.ends_with('\n') {
        log::warn!("detected incomplete logfile line, discarding: {buf:?}");
        want_trunc = true;
        break;
      }
      valid_len += n as u64;
      log.lines += 1;
      let line = buf.trim_end_matches('\n');
      let (key, value) = line
        .split_once('|')
        .ok_or_else(|| error::Error::msg(Kind::Parse, "missing '|' in logfile line"))?;

      match key {
        "v" => {
          if log.uidvld_up > 0 {
            log.updates += 1;
          }
          let (up, dn) = value
            .split_once(':')
            .ok_or_else(|| error::Error::msg(Kind::Parse, "bad uidvlds value"))?;
          log.uidvld_up = up
            .parse()
            .map_err(|_| error::Error::msg(Kind::Parse, "bad uidvld_up"))?;
          log.uidvld_dn = dn
            .parse()
            .map_err(|_| error::Error::msg(Kind::Parse, "bad uidvld_dn"))?;
        }
        "h" => {
          if log.himodseq_up > 0 {
            log.updates += 1;
          }
          log.himodseq_up = value
            .parse()
            .map_err(|_| error::Error::msg(Kind::Parse, "bad himodseq_up"))?;
        }
        "d" => {
          if log.himodseq_up > 0 {
            log.updates += 1;
          }
          let explicit: Modseq = value
            .parse()
            .map_err(|_| error::Error::msg(Kind::Parse, "bad explicit modseq_dn"))?;
          tables.himodseq_dn = tables.himodseq_dn.max(explicit);
        }
        _ => {
          let msg_key = key_for_line(key)
            .ok_or_else(|| error::Error::msg(Kind::Parse, format!("unknown log key {key:?}")))?;
          if tables.msgs.remove(&msg_key).is_some() {
            log.updates += 1;
          }
          if let Some(old) = tables.expunges.remove(&msg_key) {
            tables.mods.remove(&old.modseq);
            log.updates += 1;
          }
          if is_tombstone(value) {
            log.updates += 1;
            continue;
          }
          match parse_value(msg_key, value)? {
            Parsed::Msg(msg) => {
              if msg.modseq > 0 {
                tables.mods.insert(msg.modseq, msg_key);
              }
              tables.msgs.insert(msg_key, msg);
            }
            Parsed::Expunge(expunge) => {
              if expunge.uid_dn == 0 && expunge.modseq == 0 {
                continue;
              }
              if expunge.modseq > 0 {
                tables.mods.insert(expunge.modseq, msg_key);
              }
              tables.expunges.insert(msg_key, expunge);
            }
          }
        }
      }
    }

    if let Some((&highest, _)) = tables.mods.iter().next_back() {
      tables.himodseq_dn = tables.himodseq_dn.max(highest);
    }

    if want_trunc {
      use io::{Read, Seek, SeekFrom};
      let mut truncate_src = fs::File::open(&path)?;
      truncate_src.seek(SeekFrom::Start(0))?;
      let mut limited = truncate_src.take(valid_len);
      let mut tmp = fs::File::create(&tmppath)?;
      io::copy(&mut limited, &mut tmp)?;
      tmp.sync_all()?;
      drop(tmp);
      fs::rename(&tmppath, &path)?;
    }

    log.file = fs::OpenOptions::new().append(true).open(&path)?;
    Ok((log, tables))
  }

  pub fn uidvld_up(&self) -> u32 {
    self.uidvld_up
  }

  pub fn uidvld_dn(&self) -> u32 {
    self.uidvld_dn
  }

  pub fn himodseq_up(&self) -> u64 {
    self.himodseq_up
  }

  fn append(&mut self, line: &str) -> error::Result<()> {
    self.file.write_all(line.as_bytes())?;
    self.file.sync_all()?;
    self.lines += 1;
    self.updates += 1;
    self.maybe_compact()
  }

  pub fn set_uidvlds(&mut self, uidvld_up: u32, uidvld_dn: u32) -> error::Result<()> {
    self.uidvld_up = uidvld_up;
    self.uidvld_dn = uidvld_dn;
    self.append(&format!("v|{uidvld_up}:{uidvld_dn}\n"))
  }

  pub fn set_himodseq_up(&mut self, himodseq_up: u64) -> error::Result<()> {
    self.himodseq_up = himodseq_up;
    self.append(&format!("h|{himodseq_up}\n"))
  }

  pub fn set_explicit_modseq_dn(&mut self, modseq_dn: Modseq) -> error::Result<()> {
    self.append(&format!("d|{modseq_dn}\n"))
  }

  pub fn update_msg(&mut self, msg: &Msg) -> error::Result<()> {
    self.append(&format!("{}|{}\n", msg.key, marshal_msg(msg)))
  }

  pub fn update_expunge(&mut self, expunge: &Expunge) -> error::Result<()> {
    self.append(&format!("{}|{}\n", expunge.key, marshal_expunge(expunge)))
  }

  fn maybe_compact(&mut self) -> error::Result<()> {
    if self.lines < COMPACT_MIN_LINES {
      return Ok(());
    }
    if self.lines * 3 > self.updates * 4 {
      return Ok(());
    }

    let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
    let tmppath = dir.join(".cache.tmp");

    let mut latest: BTreeMap<String, String> = BTreeMap::new();
    let read = fs::File::open(&self.path)?;
    for line in io::BufReader::new(read).lines() {
      let line = line?;
      let (key, value) = line
        .split_once('|')
        .ok_or_else(|| error::Error::msg(Kind::Parse, "missing '|' during compaction"))?;
      if is_tombstone(value) {
        latest.remove(key);
        continue;
      }
      latest.insert(key.to_string(), value.to_string());
    }

    let mut tmp = fs::File::create(&tmppath)?;
    let mut lines = 0u64;
    for (key, value) in &latest {
      writeln!(tmp, "{key}|{value}")?;
      lines += 1;
    }
    tmp.sync_all()?;
    drop(tmp);
    fs::rename(&tmppath, &self.path)?;

    self.lines = lines;
    self.updates = 0;
    self.file = fs::OpenOptions::new().append(true).open(&self.path)?;
    Ok(())
  }
}

pub fn remove(dir: &Path) -> io::Result<()> {
  let path = dir.join(".cache");
  match fs::remove_file(path) {
    Ok(()) => Ok(()),
    Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(error) => Err(error),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::MsgState;

  #[test]
  fn marshal_parse_round_trip() {
    let msg = Msg {
      key: MsgKey::up(7),
      uid_dn: 3,
      state: MsgState::Filled,
      internaldate: Some(100),
      flags: Flags {
        seen: true,
        ..Flags::default()
      },
      modseq: 5,
      filename: None,
      length: None,
      subdir: Subdir::Cur,
    };
    let marshaled = marshal_msg(&msg);
    match parse_value(msg.key, &marshaled).unwrap() {
      Parsed::Msg(parsed) => {
        assert_eq!(parsed.uid_dn, msg.uid_dn);
        assert_eq!(parsed.state, msg.state);
        assert_eq!(parsed.modseq, msg.modseq);
        assert_eq!(parsed.flags, msg.flags);
      }
      Parsed::Expunge(_) => panic!("expected msg"),
    }
  }

  #[test]
  fn open_empty_creates_cache() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (log, tables) = Log::open(dir.path())?;
    assert_eq!(0, log.uidvld_up());
    assert!(tables.msgs.is_empty());
    assert!(dir.path().join(".cache").exists());
    Ok(())
  }

  #[test]
  fn append_and_reopen_replays() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    {
      let (mut log, _) = Log::open(dir.path())?;
      log.set_uidvlds(100, 1)?;
      log.set_himodseq_up(5)?;
      let msg = Msg {
        key: MsgKey::up(7),
        uid_dn: 1,
        state: MsgState::Filled,
        internaldate: Some(42),
        flags: Flags::default(),
        modseq: 2,
        filename: None,
        length: None,
        subdir: Subdir::Cur,
      };
      log.update_msg(&msg)?;
    }
    let (log, tables) = Log::open(dir.path())?;
    assert_eq!(100, log.uidvld_up());
    assert_eq!(1, log.uidvld_dn());
    assert_eq!(5, log.himodseq_up());
    assert_eq!(1, tables.msgs.len());
    assert_eq!(2, tables.himodseq_dn);
    Ok(())
  }

  #[test]
  fn tombstones_are_dropped_on_compaction() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (mut log, _) = Log::open(dir.path())?;
    log.lines = COMPACT_MIN_LINES;
    log.updates = COMPACT_MIN_LINES;
    // force a tombstone line directly, then trigger compaction via another append
    writeln!(log.file, "m.1.0|1:0:0:x")?;
    log.file.sync_all()?;
    log.maybe_compact()?;
    let contents = fs::read_to_string(dir.path().join(".cache"))?;
    assert!(!contents.contains("1:0:0:x"));
    Ok(())
  }
}
