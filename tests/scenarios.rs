// End-to-end scenarios against the shared mailbox state, exercising the seed scenarios in
// SPEC_FULL.md §8 without standing up a real remote IMAP server: Up's half is driven directly
// against Mailbox (note_unfilled/fill/note_vanished), and Dn's half through register/poll.

use citm::{
  dirmgr::DirMgr,
  dn::{Dn, Target},
  maildir,
  mailbox::{Mailbox, StoreDiff, UpdateReq, UpdateReqKind},
  model::Flags,
};
use std::sync::{Arc, Mutex};

fn open(dir: &std::path::Path, name: &str) -> Mailbox {
  let builder = maildir::Builder::new(dir).unwrap();
  Mailbox::open(&builder, name).unwrap()
}

#[test]
fn fresh_mailbox_bootstraps_then_becomes_visible_to_a_new_dn() {
  let dir = tempfile::tempdir().unwrap();
  let mut mailbox = open(dir.path(), "INBOX");

  for uid in 1..=3u32 {
    mailbox.note_unfilled(uid, Flags::default()).unwrap();
  }
  assert_eq!(3, mailbox.unfilled_uids_up().len());
  for uid in 1..=3u32 {
    mailbox.fill(uid, format!("message {uid}").as_bytes(), Flags::default()).unwrap();
  }
  assert!(mailbox.unfilled_uids_up().is_empty());

  let view = mailbox.snapshot_view();
  assert_eq!(3, view.len());
  assert_eq!(Some(1), view.seq_of(view.uid_dn_at_seq(1).unwrap()));
}

#[test]
fn two_downward_clients_see_each_others_store_as_unsolicited_fetch() {
  let dir = tempfile::tempdir().unwrap();
  let mut mailbox = open(dir.path(), "INBOX");
  mailbox.note_unfilled(1, Flags::default()).unwrap();
  mailbox.fill(1, b"hi", Flags::default()).unwrap();

  let alice = mailbox.register();
  let bob = mailbox.register();
  mailbox.drain_updates(alice);
  mailbox.drain_updates(bob);

  let uid_dn = mailbox.snapshot_view().iter().next().unwrap().0;
  mailbox
    .apply(UpdateReq {
      dn_id: alice,
      kind: UpdateReqKind::Store,
      uid_dns: vec![uid_dn],
      diff: Some(StoreDiff {
        add: Flags {
          flagged: true,
          ..Flags::default()
        },
        remove: Flags::default(),
        set: false,
      }),
    })
    .unwrap();

  let bob_updates = mailbox.drain_updates(bob);
  assert_eq!(1, bob_updates.len());
  match &bob_updates[0] {
    citm::mailbox::Update::Meta(_, seen_uid_dn, flags) => {
      assert_eq!(uid_dn, *seen_uid_dn);
      assert!(flags.flagged);
    }
    other => panic!("expected a Meta update, got {other:?}"),
  }

  let alice_updates = mailbox.drain_updates(alice);
  assert!(matches!(
    alice_updates.last(),
    Some(citm::mailbox::Update::Sync { ok: true, .. })
  ));
}

#[test]
fn expunge_drops_the_message_from_every_registrants_view() {
  let dir = tempfile::tempdir().unwrap();
  let mut mailbox = open(dir.path(), "INBOX");
  for uid in 1..=2u32 {
    mailbox.note_unfilled(uid, Flags::default()).unwrap();
    mailbox.fill(uid, b"x", Flags::default()).unwrap();
  }
  let watcher = mailbox.register();
  mailbox.drain_updates(watcher);

  let uid_dns: Vec<u32> = mailbox.snapshot_view().iter().map(|(u, _)| u).collect();
  mailbox
    .apply(UpdateReq {
      dn_id: watcher,
      kind: UpdateReqKind::Expunge,
      uid_dns: uid_dns.clone(),
      diff: None,
    })
    .unwrap();

  assert_eq!(0, mailbox.snapshot_view().len());
  assert_eq!(uid_dns.len(), mailbox.unpushed_expunge_uids_up().len());
}

#[test]
fn reopening_a_mailbox_replays_its_log() {
  let dir = tempfile::tempdir().unwrap();
  {
    let mut mailbox = open(dir.path(), "INBOX");
    mailbox.note_unfilled(1, Flags::default()).unwrap();
    mailbox.fill(1, b"persisted", Flags::default()).unwrap();
  }
  let reopened = open(dir.path(), "INBOX");
  assert_eq!(1, reopened.snapshot_view().len());
  assert!(reopened.himodseq_dn() > 0);
}

#[test]
fn fetch_marks_seen_and_store_echoes_unless_silent() {
  let dir = tempfile::tempdir().unwrap();
  let mut mailbox = open(dir.path(), "INBOX");
  mailbox.note_unfilled(1, Flags::default()).unwrap();
  mailbox.fill(1, b"hello", Flags::default()).unwrap();
  let mailbox = Arc::new(Mutex::new(mailbox));

  let mut dn = Dn::open(mailbox.clone());
  let uid_dn = dn.view().iter().next().unwrap().0;

  let entries = dn.fetch(&[uid_dn], true).unwrap();
  assert_eq!(1, entries.len());
  assert!(entries[0].flags.seen, "fetch without .PEEK should set \\Seen");

  let results = dn
    .store(
      &[uid_dn],
      StoreDiff {
        add: Flags {
          flagged: true,
          ..Flags::default()
        },
        remove: Flags::default(),
        set: false,
      },
      false,
    )
    .unwrap();
  assert_eq!(1, results.len());
  assert!(results[0].flags.flagged);

  let silent_results = dn
    .store(
      &[uid_dn],
      StoreDiff {
        add: Flags::default(),
        remove: Flags {
          flagged: true,
          ..Flags::default()
        },
        set: false,
      },
      true,
    )
    .unwrap();
  assert!(silent_results.is_empty(), ".SILENT must suppress the requester's own echo");
}

#[test]
fn search_matches_flag_based_criteria() {
  let dir = tempfile::tempdir().unwrap();
  let mut mailbox = open(dir.path(), "INBOX");
  mailbox.note_unfilled(1, Flags::default()).unwrap();
  mailbox.fill(1, b"one", Flags::default()).unwrap();
  mailbox
    .note_unfilled(
      2,
      Flags {
        seen: true,
        ..Flags::default()
      },
    )
    .unwrap();
  mailbox.fill(
    2,
    b"two",
    Flags {
      seen: true,
      ..Flags::default()
    },
  ).unwrap();
  let mailbox = Arc::new(Mutex::new(mailbox));
  let dn = Dn::open(mailbox);

  let unseen = dn.search(&[imap_types::search::SearchKey::Unseen], false).unwrap();
  assert_eq!(vec![1], unseen);
  let seen = dn.search(&[imap_types::search::SearchKey::Seen], true).unwrap();
  assert_eq!(1, seen.len());
}

#[test]
fn deleted_among_and_expunge_only_remove_flagged_deleted_messages() {
  let dir = tempfile::tempdir().unwrap();
  let mut mailbox = open(dir.path(), "INBOX");
  for uid in 1..=2u32 {
    mailbox.note_unfilled(uid, Flags::default()).unwrap();
    mailbox.fill(uid, b"x", Flags::default()).unwrap();
  }
  let mailbox = Arc::new(Mutex::new(mailbox));
  let mut dn = Dn::open(mailbox);
  let uid_dns: Vec<u32> = dn.view().iter().map(|(u, _)| u).collect();
  dn.store(
    &uid_dns[..1],
    StoreDiff {
      add: Flags {
        deleted: true,
        ..Flags::default()
      },
      remove: Flags::default(),
      set: false,
    },
    true,
  )
  .unwrap();

  let deleted = dn.deleted_among(&uid_dns);
  assert_eq!(1, deleted.len());
  let removed = dn.expunge(&deleted).unwrap();
  assert_eq!(1, removed.len());
  assert_eq!(1, dn.view().len());
}

#[test]
fn resolve_maps_sequence_numbers_and_uids_through_the_view() {
  let dir = tempfile::tempdir().unwrap();
  let mut mailbox = open(dir.path(), "INBOX");
  for uid in 1..=3u32 {
    mailbox.note_unfilled(uid, Flags::default()).unwrap();
    mailbox.fill(uid, b"x", Flags::default()).unwrap();
  }
  let mailbox = Arc::new(Mutex::new(mailbox));
  let dn = Dn::open(mailbox);

  let by_seq = dn.resolve(&Target::Sequence(vec![1, 3]));
  assert_eq!(2, by_seq.len());
  let by_uid = dn.resolve(&Target::Uid(by_seq.clone()));
  assert_eq!(by_seq, by_uid);
}

#[test]
fn dirmgr_denies_access_to_a_frozen_mailbox_while_rename_is_in_flight() {
  let dir = tempfile::tempdir().unwrap();
  let dirmgr = DirMgr::new(maildir::Builder::new(dir.path()).unwrap());
  let handle = dirmgr.open_up("Archive").unwrap();
  {
    let mut mailbox = handle.lock().unwrap();
    mailbox.note_unfilled(1, Flags::default()).unwrap();
  }
  let freeze = dirmgr.freeze("Archive").unwrap();
  assert!(dirmgr.open_dn("Archive").is_err());
  drop(freeze);
  assert!(dirmgr.open_dn("Archive").is_ok());
}
