// Process-wide registry of open mailboxes. Provides open_up/open_dn, Hold (refcounted download
// suppression) and Freeze (exclusive access lock for DELETE/RENAME).

use crate::{
  error::{self, Kind},
  maildir,
  mailbox::Mailbox,
};
use std::{
  collections::{HashMap, HashSet},
  sync::{Arc, Mutex},
};

pub struct DirMgr {
  root: maildir::Builder,
  state: Mutex<State>,
}

#[derive(Default)]
struct State {
  open: HashMap<String, Arc<Mutex<Mailbox>>>,
  holds: HashMap<String, u32>,
  frozen: HashSet<String>,
}

/// Segments split on '/'; empty segment, '.', '..', 'cur', 'tmp', 'new', length > 255, or NUL
/// bytes are invalid.
pub fn validate_name(name: &str) -> error::Result<()> {
  if name.is_empty() || name.contains('\0') {
    return Err(error::Error::msg(Kind::Value, "empty or NUL mailbox name"));
  }
  for segment in name.split('/') {
    if segment.is_empty()
      || segment == "."
      || segment == ".."
      || segment == "cur"
      || segment == "tmp"
      || segment == "new"
      || segment.len() > 255
    {
      return Err(error::Error::msg(
        Kind::Value,
        format!("invalid mailbox name segment {segment:?}"),
      ));
    }
  }
  Ok(())
}

impl DirMgr {
  pub fn new(root: maildir::Builder) -> Self {
    Self {
      root,
      state: Mutex::new(State::default()),
    }
  }

  fn get_or_open(&self, name: &str) -> error::Result<Arc<Mutex<Mailbox>>> {
    validate_name(name)?;
    let mut state = self.state.lock().unwrap();
    if state.frozen.contains(name) {
      return Err(error::Error::msg(Kind::Frozen, format!("{name} is frozen")));
    }
    if let Some(existing) = state.open.get(name) {
      return Ok(existing.clone());
    }
    let mailbox = Mailbox::open(&self.root, name)?;
    let handle = Arc::new(Mutex::new(mailbox));
    state.open.insert(name.to_string(), handle.clone());
    Ok(handle)
  }

  pub fn open_up(&self, name: &str) -> error::Result<Arc<Mutex<Mailbox>>> {
    self.get_or_open(name)
  }

  pub fn open_dn(&self, name: &str) -> error::Result<Arc<Mutex<Mailbox>>> {
    self.get_or_open(name)
  }

  /// Releases a mailbox's slot in the registry if it has no registrants left. Callers unregister
  /// from the Mailbox itself before calling this.
  pub fn maybe_close(&self, name: &str, handle: &Arc<Mutex<Mailbox>>) {
    let mut state = self.state.lock().unwrap();
    // Only dirmgr's map entry and this caller's clone remain.
    if Arc::strong_count(handle) <= 2 {
      state.open.remove(name);
    }
  }

  pub fn hold(&self, name: &str) -> error::Result<Hold<'_>> {
    validate_name(name)?;
    let mut state = self.state.lock().unwrap();
    *state.holds.entry(name.to_string()).or_insert(0) += 1;
    if let Some(mailbox) = state.open.get(name) {
      mailbox.lock().unwrap().hold();
    }
    Ok(Hold {
      dirmgr: self,
      name: name.to_string(),
    })
  }

  fn release_hold(&self, name: &str) {
    let mut state = self.state.lock().unwrap();
    if let Some(count) = state.holds.get_mut(name) {
      *count = count.saturating_sub(1);
      if *count == 0 {
        state.holds.remove(name);
      }
    }
    if let Some(mailbox) = state.open.get(name) {
      mailbox.lock().unwrap().unhold();
    }
  }

  /// Exclusive: fails if the name is already frozen. Does not force-close current registrants
  /// itself; callers (DELETE/RENAME handlers) are expected to drain registrants first.
  pub fn freeze(&self, name: &str) -> error::Result<Freeze<'_>> {
    validate_name(name)?;
    let mut state = self.state.lock().unwrap();
    if !state.frozen.insert(name.to_string()) {
      return Err(error::Error::msg(Kind::Frozen, format!("{name} already frozen")));
    }
    Ok(Freeze {
      dirmgr: self,
      name: name.to_string(),
    })
  }

  fn release_freeze(&self, name: &str) {
    let mut state = self.state.lock().unwrap();
    state.frozen.remove(name);
  }

  /// Recursively removes any subdirectory whose cur/ and new/ are both empty (tmp is always
  /// wiped). Skipped if the name is currently open or held.
  pub fn prune_empty_dirs(&self) -> std::io::Result<()> {
    let state = self.state.lock().unwrap();
    prune_dir(self.root.path(), &state)
  }
}

fn prune_dir(dir: &std::path::Path, state: &State) -> std::io::Result<()> {
  if !dir.is_dir() {
    return Ok(());
  }
  for entry in std::fs::read_dir(dir)? {
    let entry = entry?;
    let path = entry.path();
    if !path.is_dir() {
      continue;
    }
    let name = entry.file_name();
    if name == "cur" || name == "new" || name == "tmp" {
      continue;
    }
    prune_dir(&path, state)?;
    let cur_empty = is_empty_dir(&path.join("cur")).unwrap_or(true);
    let new_empty = is_empty_dir(&path.join("new")).unwrap_or(true);
    if let Some(tmp) = Some(path.join("tmp")) {
      if tmp.is_dir() {
        for entry in std::fs::read_dir(&tmp)? {
          std::fs::remove_file(entry?.path())?;
        }
      }
    }
    if cur_empty && new_empty {
      let _ = std::fs::remove_dir_all(&path);
    }
  }
  Ok(())
}

fn is_empty_dir(path: &std::path::Path) -> std::io::Result<bool> {
  if !path.is_dir() {
    return Ok(true);
  }
  Ok(std::fs::read_dir(path)?.next().is_none())
}

pub struct Hold<'a> {
  dirmgr: &'a DirMgr,
  name: String,
}

impl Drop for Hold<'_> {
  fn drop(&mut self) {
    self.dirmgr.release_hold(&self.name);
  }
}

pub struct Freeze<'a> {
  dirmgr: &'a DirMgr,
  name: String,
}

impl Drop for Freeze<'_> {
  fn drop(&mut self) {
    self.dirmgr.release_freeze(&self.name);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn name_validation() {
    assert!(validate_name("INBOX").is_ok());
    assert!(validate_name("Archive/2024").is_ok());
    assert!(validate_name("").is_err());
    assert!(validate_name("a/../b").is_err());
    assert!(validate_name("a/cur/b").is_err());
    assert!(validate_name(&"x".repeat(300)).is_err());
  }

  #[test]
  fn open_twice_returns_same_handle() {
    let dir = tempfile::tempdir().unwrap();
    let dirmgr = DirMgr::new(maildir::Builder::new(dir.path()).unwrap());
    let a = dirmgr.open_up("INBOX").unwrap();
    let b = dirmgr.open_dn("INBOX").unwrap();
    assert!(Arc::ptr_eq(&a, &b));
  }

  #[test]
  fn freeze_denies_open() {
    let dir = tempfile::tempdir().unwrap();
    let dirmgr = DirMgr::new(maildir::Builder::new(dir.path()).unwrap());
    let _freeze = dirmgr.freeze("INBOX").unwrap();
    let err = dirmgr.open_up("INBOX").unwrap_err();
    assert_eq!(Kind::Frozen, err.kind());
  }

  #[test]
  fn hold_suppresses_download() {
    let dir = tempfile::tempdir().unwrap();
    let dirmgr = DirMgr::new(maildir::Builder::new(dir.path()).unwrap());
    let handle = dirmgr.open_up("INBOX").unwrap();
    assert!(handle.lock().unwrap().allow_download());
    let hold = dirmgr.hold("INBOX").unwrap();
    assert!(!handle.lock().unwrap().allow_download());
    drop(hold);
    assert!(handle.lock().unwrap().allow_download());
  }
}
