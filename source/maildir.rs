// https://cr.yp.to/proto/maildir.html - Maildir
// https://doc.dovecot.org/admin_manual/mailbox_formats/maildir/ - Maildir Mailbox Format
//
// Filenames under cur/ carry extra fields the plain maildir spec leaves opaque to us: the
// upstream UID and the plaintext length, so the mailbox can reconcile cur/ against its log without
// re-reading every file. See DESIGN.md for where this format comes from.

use crate::error::{self, Kind};
use anyhow::Context as _;
use std::{
  fs,
  io::{self, Write as _},
  path,
};

pub type Epoch = u64;

const DELIV_ID_VER: u32 = 1;

#[derive(Debug)]
pub struct Builder {
  path: path::PathBuf,
}

#[derive(Debug)]
pub struct Maildir {
  path: path::PathBuf,
}

impl Builder {
  pub fn new(path: &path::Path) -> io::Result<Self> {
    fs::create_dir_all(path)?;
    Ok(Self {
      path: path.to_path_buf(),
    })
  }

  pub fn path(&self) -> &path::Path {
    self.path.as_path()
  }

  /// Resolve a logical mailbox name (a '/'-separated path, already validated by dirmgr::name) to
  /// its on-disk maildir.
  pub fn mailbox(&self, name: &str) -> io::Result<Maildir> {
    let path = if name == "INBOX" {
      self.path.clone()
    } else {
      self.path.join(name.replace('/', "."))
    };
    Maildir::new(path)
  }
}

impl Maildir {
  fn new(path: path::PathBuf) -> io::Result<Self> {
    fs::create_dir_all(&path)?;
    let path = path.canonicalize()?;
    for directory in &["cur", "new", "tmp"] {
      fs::create_dir_all(path.join(directory))?;
    }
    Ok(Self { path })
  }

  pub fn remove(self) -> io::Result<()> {
    fs::remove_dir_all(self.path)
  }

  pub fn path(&self) -> &path::Path {
    self.path.as_path()
  }

  pub fn cur(&self) -> path::PathBuf {
    self.path.join("cur")
  }

  pub fn new_dir(&self) -> path::PathBuf {
    self.path.join("new")
  }

  pub fn tmp(&self) -> path::PathBuf {
    self.path.join("tmp")
  }

  /// Wipe tmp/ on open, per the startup reconcile.
  pub fn wipe_tmp(&self) -> io::Result<()> {
    for entry in fs::read_dir(self.tmp())? {
      let entry = entry?;
      fs::remove_file(entry.path())?;
    }
    Ok(())
  }

  pub fn tmp_scratch(&self, tmp_count: u64, buffer: &[u8]) -> io::Result<path::PathBuf> {
    let path = self.tmp().join(format!("scratch.{tmp_count}"));
    let mut file = fs::File::create(&path)?;
    file.write_all(buffer)?;
    file.sync_all()?;
    Ok(path)
  }

  /// Rename a scratch tmp/ file into cur/ under its final maildir name.
  pub fn commit(&self, scratch: &path::Path, name: &Name, host: &str) -> io::Result<path::PathBuf> {
    let filename = name.write(host);
    let dest = self.cur().join(filename);
    fs::rename(scratch, &dest)?;
    Ok(dest)
  }
}

/// The extended maildir unique name: `<epoch>.1,<uid_up>,<len>.<host>[:<info>]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Name {
  pub epoch: Epoch,
  pub uid_up: u32,
  pub len: u64,
  pub info: Option<String>,
}

/// '/' and ':' would otherwise break the maildir grammar (major/minor token split); the original
/// deliberately avoids the backslash-prefixed \057/\072 the standard suggests, since that breaks
/// on Windows.
fn mod_hostname(host: &str) -> String {
  let mut out = String::with_capacity(host.len());
  for c in host.chars() {
    match c {
      '/' => out.push_str("057"),
      ':' => out.push_str("072"),
      c => out.push(c),
    }
  }
  out
}

impl Name {
  pub fn write(&self, host: &str) -> String {
    let mut out = format!(
      "{}.{},{},{}.{}",
      self.epoch,
      DELIV_ID_VER,
      self.uid_up,
      self.len,
      mod_hostname(host)
    );
    if let Some(info) = &self.info {
      if !info.is_empty() {
        out.push(':');
        out.push_str(info);
      }
    }
    out
  }

  pub fn parse(filename: &str) -> error::Result<Self> {
    if filename.len() < 16 {
      return Err(error::Error::msg(
        Kind::Parse,
        format!("{filename:?} is too short to be a maildir name"),
      ));
    }
    let mut major = filename.splitn(2, ':');
    let unique = major.next().unwrap();
    let info = major.next().filter(|s| !s.is_empty()).map(str::to_owned);

    let mut minor = unique.splitn(3, '.');
    let epoch_str = minor
      .next()
      .ok_or_else(|| error::Error::msg(Kind::Parse, "missing epoch field"))?;
    let deliv_str = minor
      .next()
      .ok_or_else(|| error::Error::msg(Kind::Parse, "missing delivery-id field"))?;
    let _host = minor
      .next()
      .ok_or_else(|| error::Error::msg(Kind::Parse, "missing host field"))?;

    let epoch: Epoch = epoch_str
      .parse()
      .map_err(|_| error::Error::msg(Kind::Parse, format!("bad epoch {epoch_str:?}")))?;

    let fields: Vec<&str> = deliv_str.splitn(3, ',').collect();
    if fields.len() != 3 {
      return Err(error::Error::msg(
        Kind::Parse,
        "wrong number of fields in delivery id",
      ));
    }
    let version: u32 = fields[0]
      .parse()
      .map_err(|_| error::Error::msg(Kind::Parse, "bad delivery-id version"))?;
    if version != DELIV_ID_VER {
      return Err(error::Error::msg(
        Kind::Parse,
        format!("unsupported delivery-id version {version}"),
      ));
    }
    let uid_up: u32 = fields[1]
      .parse()
      .map_err(|_| error::Error::msg(Kind::Parse, "bad uid_up field"))?;
    let len: u64 = fields[2]
      .parse()
      .map_err(|_| error::Error::msg(Kind::Parse, "bad length field"))?;

    Ok(Self {
      epoch,
      uid_up,
      len,
      info,
    })
  }
}

pub fn components(path: &path::Path) -> anyhow::Result<[&path::Path; 3]> {
  let parent = path
    .parent()
    .with_context(|| format!("{path:?} is without a parent"))?;
  let grandparent = parent
    .parent()
    .with_context(|| format!("{path:?} is without a grandparent"))?;
  Ok([grandparent, parent, path])
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn name_round_trip() {
    let name = Name {
      epoch: 1_700_000_000,
      uid_up: 522,
      len: 3,
      info: Some("2,".to_string()),
    };
    let written = name.write("my.computer");
    assert_eq!("1700000000.1,522,3.my.computer:2,", written);
    let parsed = Name::parse(&written).unwrap();
    assert_eq!(name, parsed);
  }

  #[test]
  fn name_round_trip_no_info() {
    let name = Name {
      epoch: 42,
      uid_up: 7,
      len: 100,
      info: None,
    };
    let written = name.write("host");
    let parsed = Name::parse(&written).unwrap();
    assert_eq!(name, parsed);
  }

  #[test]
  fn hostname_escaping() {
    assert_eq!("a057b072c", mod_hostname("a/b:c"));
  }

  #[test]
  fn too_short_is_parse_error() {
    assert!(Name::parse("short").is_err());
  }

  #[test]
  fn mailbox_layout() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let builder = Builder::new(directory.path())?;
    let maildir = builder.mailbox("INBOX")?;
    assert!(maildir.cur().is_dir());
    assert!(maildir.new_dir().is_dir());
    assert!(maildir.tmp().is_dir());

    let nested = builder.mailbox("Archive/2024")?;
    assert!(nested.path().ends_with("Archive.2024"));
    Ok(())
  }
}
