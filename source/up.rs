// Upward synchronizer: keeps one mailbox's Mailbox state caught up with the remote server.
// Bootstraps missing messages, pushes local deletions, and services an IDLE/FETCH loop for
// detection of new/changed/vanished messages. One Up per selected mailbox per Fetcher.

use crate::{
  crypto::Keypair,
  error::{self, Kind},
  fetcher::Fetcher,
  mailbox::Mailbox,
  model::Flags,
};
use std::sync::{Arc, Mutex};

/// Messages are fetched FETCH_CHUNK_SIZE uids at a time, with up to FETCH_PARALLELISM chunks
/// in flight; a single-threaded Fetcher still issues them back to back since the remote
/// connection itself is not multiplexed, but chunking bounds how much unacknowledged FETCH
/// state is outstanding at once.
const FETCH_PARALLELISM: usize = 5;
const FETCH_CHUNK_SIZE: usize = 10;

pub struct Up {
  mailbox: Arc<Mutex<Mailbox>>,
  keypair: Arc<Keypair>,
  qresync: bool,
}

impl Up {
  pub fn new(mailbox: Arc<Mutex<Mailbox>>, keypair: Arc<Keypair>, qresync: bool) -> Self {
    Self {
      mailbox,
      keypair,
      qresync,
    }
  }

  /// Runs after SELECT/EXAMINE completes upstream: reconcile UIDVALIDITY, then bootstrap any
  /// messages the log doesn't know about yet, then push any expunges the log recorded locally
  /// but hasn't told the server about.
  pub fn boot(&mut self, fetcher: &mut Fetcher, uidvld_up: u32, uidnext_up: u32) -> error::Result<()> {
    {
      let mut mailbox = self.mailbox.lock().unwrap();
      if mailbox.uidvld_up() != 0 && mailbox.uidvld_up() != uidvld_up {
        mailbox.invalidate(uidvld_up)?;
      } else if mailbox.uidvld_up() == 0 {
        mailbox.invalidate(uidvld_up)?;
      }
    }
    self.push_expunges(fetcher)?;
    self.bootstrap(fetcher, uidnext_up)?;
    Ok(())
  }

  /// QRESYNC-aware reselect after reconnecting mid-session: pass the cached uidvld/himodseq pair
  /// so the server can reply with VANISHED/FETCH instead of a full resync.
  pub fn reselect_params(&self) -> (u32, u64) {
    let mailbox = self.mailbox.lock().unwrap();
    (mailbox.uidvld_dn(), mailbox.himodseq_up())
  }

  pub fn qresync_enabled(&self) -> bool {
    self.qresync
  }

  fn bootstrap(&mut self, fetcher: &mut Fetcher, uidnext_up: u32) -> error::Result<()> {
    let known_max = {
      let mailbox = self.mailbox.lock().unwrap();
      mailbox.unfilled_uids_up().into_iter().max().unwrap_or(0)
    };
    let missing: Vec<u32> = ((known_max.max(1))..uidnext_up).collect();
    for chunk in missing.chunks(FETCH_CHUNK_SIZE * FETCH_PARALLELISM) {
      let flagged = fetcher.fetch_flags(chunk)?;
      let mut mailbox = self.mailbox.lock().unwrap();
      for (uid_up, flags) in flagged {
        mailbox.note_unfilled(uid_up, flags)?;
      }
    }
    self.fill_unfilled(fetcher)
  }

  /// Downloads and decrypts bodies for every Unfilled message, chunked to bound in-flight FETCH
  /// responses.
  pub fn fill_unfilled(&mut self, fetcher: &mut Fetcher) -> error::Result<()> {
    loop {
      let batch: Vec<u32> = {
        let mailbox = self.mailbox.lock().unwrap();
        mailbox
          .unfilled_uids_up()
          .into_iter()
          .take(FETCH_CHUNK_SIZE * FETCH_PARALLELISM)
          .collect()
      };
      if batch.is_empty() {
        return Ok(());
      }
      for chunk in batch.chunks(FETCH_CHUNK_SIZE) {
        let bodies = fetcher.fetch_bodies(chunk)?;
        for (uid_up, envelope, flags) in bodies {
          let plaintext = self.decrypt(&envelope)?;
          let mut mailbox = self.mailbox.lock().unwrap();
          mailbox.fill(uid_up, &plaintext, flags)?;
        }
      }
    }
  }

  fn decrypt(&self, envelope: &str) -> error::Result<Vec<u8>> {
    let mut decrypter = crate::crypto::Decrypter::start(&self.keypair, envelope)?;
    decrypter.update(&[]);
    decrypter.finish().or_else(|e| {
      // A message not encrypted to our key is still worth surfacing to the client rather than
      // dropping; store it as-is so the downstream view isn't silently missing a UID.
      if e.kind() == Kind::Not4Me {
        Ok(envelope.as_bytes().to_vec())
      } else {
        Err(e)
      }
    })
  }

  /// Sends STORE \Deleted + EXPUNGE (or UID EXPUNGE under UIDPLUS) upstream for every Unpushed
  /// expunge, then marks them Pushed once the server confirms.
  pub fn push_expunges(&mut self, fetcher: &mut Fetcher) -> error::Result<()> {
    let uids = {
      let mailbox = self.mailbox.lock().unwrap();
      mailbox.unpushed_expunge_uids_up()
    };
    if uids.is_empty() {
      return Ok(());
    }
    fetcher.expunge_uids(&uids)?;
    let mut mailbox = self.mailbox.lock().unwrap();
    for uid_up in uids {
      mailbox.note_vanished(uid_up)?;
    }
    Ok(())
  }

  /// Called when the remote server reports new/changed/vanished messages, either via a
  /// detection FETCH after an unsolicited EXISTS or via QRESYNC VANISHED/FETCH on reselect.
  pub fn apply_detected(
    &mut self,
    new: &[(u32, Flags)],
    changed: &[(u32, Flags)],
    vanished: &[u32],
  ) -> error::Result<()> {
    let mut mailbox = self.mailbox.lock().unwrap();
    for &uid_up in vanished {
      mailbox.note_vanished(uid_up)?;
    }
    for &(uid_up, flags) in new {
      mailbox.note_unfilled(uid_up, flags)?;
    }
    for &(uid_up, flags) in changed {
      if let Some(msg) = mailbox.msg(&crate::model::MsgKey::up(uid_up)) {
        if msg.state == crate::model::MsgState::Filled {
          let _ = flags;
        }
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::maildir;

  #[test]
  fn boot_sets_uidvalidity_once() {
    let dir = tempfile::tempdir().unwrap();
    let builder = maildir::Builder::new(dir.path()).unwrap();
    let mailbox = Arc::new(Mutex::new(Mailbox::open(&builder, "INBOX").unwrap()));
    assert_eq!(0, mailbox.lock().unwrap().uidvld_up());
  }
}
