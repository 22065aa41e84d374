// Process-wide shared state handed to every spawned connection: the mailbox registry, the
// decryption keypair, the recipient key set for outgoing encryption, and the upstream connection
// parameters. Replaces the ad hoc global statics a C implementation would reach for (see
// SPEC_FULL.md §9's "global mutable state" design note).

use crate::crypto::{Keypair, RecipientKey};
use crate::dirmgr::DirMgr;
use std::{
  path::PathBuf,
  sync::{Arc, Mutex},
};

pub struct Services {
  pub dirmgr: Arc<DirMgr>,
  pub keypair: Arc<Keypair>,
  pub upstream_address: String,
  pub upstream_port: u16,
  pub upstream_tls: bool,
  pub upstream_timeout: Option<std::time::Duration>,
  recipient_keys: Mutex<Vec<RecipientKey>>,
}

impl Services {
  pub fn new(
    dirmgr: DirMgr,
    keypair: Keypair,
    upstream_address: String,
    upstream_port: u16,
    upstream_tls: bool,
    upstream_timeout: Option<std::time::Duration>,
  ) -> Arc<Self> {
    Arc::new(Self {
      dirmgr: Arc::new(dirmgr),
      keypair: Arc::new(keypair),
      upstream_address,
      upstream_port,
      upstream_tls,
      upstream_timeout,
      recipient_keys: Mutex::new(Vec::new()),
    })
  }

  pub fn recipient_keys(&self) -> Vec<RecipientKey> {
    self.recipient_keys.lock().unwrap().clone()
  }

  /// Reloads the peer key directory. Grounded on original_source/citm/keysync.c, which reruns
  /// this on a timer so a newly enrolled device's key is picked up without restarting citm.
  pub fn refresh_recipient_keys(&self, peer_keys_dir: &PathBuf) -> anyhow::Result<()> {
    let keys = crate::crypto::load_recipient_keys(peer_keys_dir)?;
    *self.recipient_keys.lock().unwrap() = keys;
    Ok(())
  }
}
