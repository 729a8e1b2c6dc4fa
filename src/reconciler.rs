//! C7 — Reconciler (Sync): per-server full snapshot, diff against Maildir
//! presence, propagate deletions upward (§4.7).

use std::collections::{HashMap, HashSet};
use std::path::Path;

use log::{info, warn};

use crate::error::EngineError;
use crate::fetch::{self, Scope};
use crate::index::Index;
use crate::maildir::MaildirStore;
use crate::message::Message;
use crate::session::SessionPool;

/// One server's sync outcome: its full-mailbox snapshot (the `all`-scope
/// fetch results) used as the diff basis (§4.7 step 1).
struct ServerSnapshot {
    server_name: String,
    messages: Vec<Message>,
}

/// Runs a full sync across every server in `pool` (§4.7):
///
/// 1. For each server, run `fetch(new)` then `fetch(all)` on INBOX; the
///    `all` results are that server's snapshot.
/// 2. Build the Maildir presence map — per spec's redesign mandate (open
///    questions, §9), a fresh map is scanned per server and the results are
///    unioned, rather than reusing one possibly-stale map.
/// 3. Any snapshot fingerprint that is indexed but absent from the presence
///    union is a delete candidate.
/// 4. Per server, batch the Deleted flag + expunge for its candidates, then
///    remove their index rows. `dry_run` substitutes step 4 with logging.
pub fn sync(
    pool: &SessionPool,
    index: &Index,
    maildir_root: &Path,
    common_inbox: bool,
    dry_run: bool,
) -> Result<usize, EngineError> {
    let server_names: Vec<String> = pool.servers.keys().cloned().collect();

    // Per-server snapshot fan-out (§4.7 step 1 / §5): each server is dialed
    // and fetched from its own thread, matching the same
    // one-thread-per-server pattern already used for connection fan-out in
    // `SessionPool::connect_all` and per-message write fan-out in `fetch`.
    // Cross-server work runs in parallel; the new-then-all pair for a given
    // server stays sequential on its own thread, since the `new` pass must
    // land in the index/filesystem before the `all` pass uses it as the
    // diff basis (§4.7 step 1 rationale).
    let snapshots: Vec<ServerSnapshot> = std::thread::scope(|scope_handle| {
        let handles: Vec<_> = server_names
            .iter()
            .map(|server_name| {
                scope_handle.spawn(move || -> Result<ServerSnapshot, EngineError> {
                    fetch::fetch(
                        pool,
                        index,
                        maildir_root,
                        common_inbox,
                        server_name,
                        "INBOX",
                        Scope::New,
                    )?;
                    let all = fetch::fetch(
                        pool,
                        index,
                        maildir_root,
                        common_inbox,
                        server_name,
                        "INBOX",
                        Scope::All,
                    )?;
                    Ok(ServerSnapshot {
                        server_name: server_name.clone(),
                        messages: all,
                    })
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(EngineError::Other(anyhow::anyhow!("fetch worker panicked"))))
            })
            .collect::<Result<Vec<_>, EngineError>>()
    })?;

    let presence = maildir_presence_union(&server_names, maildir_root, common_inbox)?;
    let candidates = compute_delete_candidates(&snapshots, index, &presence)?;

    let total: usize = candidates.values().map(|v| v.len()).sum();
    if total == 0 {
        info!("sync: nothing to delete");
        return Ok(0);
    }

    if dry_run {
        for (server_name, fingerprints) in &candidates {
            for fp in fingerprints {
                info!("[dry-run] would expunge {fp} from {server_name} and drop its index row");
            }
        }
        return Ok(total);
    }

    for (server_name, fingerprints) in &candidates {
        delete_from_server(pool, index, server_name, &fingerprints)?;
    }

    Ok(total)
}

/// Pure (session-free) diff step (§4.7 step 3), factored out of `sync` so
/// it can be unit tested directly against an in-memory `Index` rather than
/// through a restated predicate: a snapshot message is a delete candidate
/// when its fingerprint is already indexed *and* absent from the Maildir
/// presence union.
fn compute_delete_candidates(
    snapshots: &[ServerSnapshot],
    index: &Index,
    presence: &HashSet<String>,
) -> Result<HashMap<String, Vec<String>>, EngineError> {
    let mut candidates: HashMap<String, Vec<String>> = HashMap::new();
    for snapshot in snapshots {
        for message in &snapshot.messages {
            if !message.is_identifiable() {
                continue;
            }
            let indexed = index
                .find(&message.fingerprint)
                .map_err(EngineError::Other)?
                .is_some();
            if indexed && !presence.contains(&message.fingerprint) {
                candidates
                    .entry(snapshot.server_name.clone())
                    .or_default()
                    .push(message.fingerprint.clone());
            }
        }
    }
    Ok(candidates)
}

/// Per-server batch deletion (§4.7 step 4): select INBOX, find the current
/// sequence numbers for each fingerprint's Message-ID, flag Deleted on the
/// union, expunge, then drop the index rows.
fn delete_from_server(
    pool: &SessionPool,
    index: &Index,
    server_name: &str,
    fingerprints: &[String],
) -> Result<(), EngineError> {
    let server = pool
        .servers
        .get(server_name)
        .ok_or_else(|| EngineError::ConfigInvalid(format!("unknown server {server_name}")))?;

    let wanted: HashMap<String, &str> = fingerprints
        .iter()
        .map(|fp| (fp.clone(), fp.as_str()))
        .collect();

    let mut session = server.session.lock();
    let mailbox = session
        .select("INBOX")
        .map_err(|e| EngineError::ImapMutation {
            server: server_name.to_owned(),
            source: e.into(),
        })?;
    if mailbox.exists == 0 {
        drop(session);
        for fp in fingerprints {
            index.delete(fp).map_err(EngineError::Other)?;
        }
        return Ok(());
    }

    let range = format!("1:{}", mailbox.exists);
    let fetches = session
        .fetch(&range, "(BODY.PEEK[HEADER.FIELDS (MESSAGE-ID)])")
        .map_err(|e| EngineError::ImapMutation {
            server: server_name.to_owned(),
            source: e.into(),
        })?;

    let mut seqs = Vec::new();
    for item in fetches.iter() {
        let message_id = item
            .header()
            .and_then(|h| mailparse::parse_headers(h).ok())
            .map(|(headers, _)| {
                mailparse::MailHeaderMap::get_all_values(&headers, "Message-ID").join(" ")
            })
            .unwrap_or_default();
        let fingerprint = crate::identity::fingerprint(message_id.trim());
        if wanted.contains_key(&fingerprint) {
            seqs.push(item.message);
        }
    }

    if seqs.is_empty() {
        warn!("sync: no matching sequence numbers found on {server_name} for delete candidates");
    } else {
        let seq_set = seqs
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(",");
        session
            .store(&seq_set, "+FLAGS.SILENT (\\Deleted)")
            .map_err(|e| EngineError::ImapMutation {
                server: server_name.to_owned(),
                source: e.into(),
            })?;
        session.expunge().map_err(|e| EngineError::ImapMutation {
            server: server_name.to_owned(),
            source: e.into(),
        })?;
        info!("sync: expunged {} message(s) on {server_name}", seqs.len());
    }
    drop(session);

    for fp in fingerprints {
        index.delete(fp).map_err(EngineError::Other)?;
    }
    Ok(())
}

/// Scans each server's INBOX Maildir folder and unions the resulting
/// fingerprint sets. When `common_inbox` is set every server resolves to
/// the same on-disk folder, so the union degenerates to one scan; the
/// per-server loop is kept regardless, matching the spec's explicit
/// redesign of the original's uninitialized-map bug (§9 Open Questions):
/// a fresh map is always built per server rather than reused.
fn maildir_presence_union(
    server_names: &[String],
    maildir_root: &Path,
    common_inbox: bool,
) -> Result<HashSet<String>, EngineError> {
    let mut union = HashSet::new();
    for server_name in server_names {
        let store = MaildirStore::resolve(maildir_root, server_name, "INBOX", common_inbox);
        let scanned = store.scan().map_err(EngineError::Other)?;
        union.extend(scanned.into_keys());
    }
    Ok(union)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexRow;
    use tempfile::tempdir;

    #[test]
    fn presence_union_merges_per_server_scans() {
        let dir = tempdir().unwrap();
        let store_a = MaildirStore::resolve(dir.path(), "a", "INBOX", false);
        let fp_a = crate::identity::fingerprint("<a@x>");
        store_a.write(&fp_a, &[], b"body", &[]).unwrap();

        let store_b = MaildirStore::resolve(dir.path(), "b", "INBOX", false);
        let fp_b = crate::identity::fingerprint("<b@x>");
        store_b.write(&fp_b, &[], b"body", &[]).unwrap();

        let union = maildir_presence_union(
            &["a".to_owned(), "b".to_owned()],
            dir.path(),
            false,
        )
        .unwrap();
        assert!(union.contains(&fp_a));
        assert!(union.contains(&fp_b));
    }

    #[test]
    fn common_inbox_presence_union_is_single_shared_folder() {
        let dir = tempdir().unwrap();
        let shared = MaildirStore::resolve(dir.path(), "a", "INBOX", true);
        let fp = crate::identity::fingerprint("<shared@x>");
        shared.write(&fp, &[], b"body", &[]).unwrap();

        let union = maildir_presence_union(
            &["a".to_owned(), "b".to_owned()],
            dir.path(),
            true,
        )
        .unwrap();
        assert_eq!(union.len(), 1);
        assert!(union.contains(&fp));
    }

    fn snapshot(server_name: &str, messages: Vec<Message>) -> ServerSnapshot {
        ServerSnapshot {
            server_name: server_name.to_owned(),
            messages,
        }
    }

    #[test]
    fn indexed_and_absent_from_presence_is_a_delete_candidate() {
        let index = Index::open_in_memory().unwrap();
        let fp = crate::identity::fingerprint("<gone@x>");
        index
            .insert(&IndexRow {
                timestamp: 0,
                fingerprint: fp.clone(),
                message_id: "<gone@x>".to_owned(),
                path: "/mail/gone".to_owned(),
                origin: "s1".to_owned(),
            })
            .unwrap();
        let message = Message::new("<gone@x>".to_owned(), "s1".to_owned(), "".to_owned(), 1);
        let snapshots = vec![snapshot("s1", vec![message])];
        let presence: HashSet<String> = HashSet::new();

        let candidates = compute_delete_candidates(&snapshots, &index, &presence).unwrap();
        assert_eq!(candidates.get("s1"), Some(&vec![fp]));
    }

    #[test]
    fn present_in_maildir_is_never_a_candidate() {
        let index = Index::open_in_memory().unwrap();
        let fp = crate::identity::fingerprint("<stable@x>");
        index
            .insert(&IndexRow {
                timestamp: 0,
                fingerprint: fp.clone(),
                message_id: "<stable@x>".to_owned(),
                path: "/mail/stable".to_owned(),
                origin: "s1".to_owned(),
            })
            .unwrap();
        let message = Message::new("<stable@x>".to_owned(), "s1".to_owned(), "".to_owned(), 1);
        let snapshots = vec![snapshot("s1", vec![message])];
        let presence: HashSet<String> = [fp].into_iter().collect();

        let candidates = compute_delete_candidates(&snapshots, &index, &presence).unwrap();
        assert!(candidates.is_empty());
    }

    #[test]
    fn unindexed_snapshot_message_is_never_a_candidate() {
        let index = Index::open_in_memory().unwrap();
        let message = Message::new("<never-fetched@x>".to_owned(), "s1".to_owned(), "".to_owned(), 1);
        let snapshots = vec![snapshot("s1", vec![message])];
        let presence: HashSet<String> = HashSet::new();

        let candidates = compute_delete_candidates(&snapshots, &index, &presence).unwrap();
        assert!(candidates.is_empty());
    }

    #[test]
    fn non_identifiable_messages_are_skipped() {
        let index = Index::open_in_memory().unwrap();
        let message = Message::new(String::new(), "s1".to_owned(), "".to_owned(), 1);
        let snapshots = vec![snapshot("s1", vec![message])];
        let presence: HashSet<String> = HashSet::new();

        let candidates = compute_delete_candidates(&snapshots, &index, &presence).unwrap();
        assert!(candidates.is_empty());
    }

    #[test]
    fn candidates_are_grouped_per_server() {
        let index = Index::open_in_memory().unwrap();
        let fp_a = crate::identity::fingerprint("<a@x>");
        let fp_b = crate::identity::fingerprint("<b@x>");
        for (fp, mid, origin) in [
            (&fp_a, "<a@x>", "a"),
            (&fp_b, "<b@x>", "b"),
        ] {
            index
                .insert(&IndexRow {
                    timestamp: 0,
                    fingerprint: fp.clone(),
                    message_id: mid.to_owned(),
                    path: format!("/mail/{fp}"),
                    origin: origin.to_owned(),
                })
                .unwrap();
        }
        let snapshots = vec![
            snapshot("a", vec![Message::new("<a@x>".to_owned(), "a".to_owned(), "".to_owned(), 1)]),
            snapshot("b", vec![Message::new("<b@x>".to_owned(), "b".to_owned(), "".to_owned(), 1)]),
        ];
        let presence: HashSet<String> = HashSet::new();

        let candidates = compute_delete_candidates(&snapshots, &index, &presence).unwrap();
        assert_eq!(candidates.get("a"), Some(&vec![fp_a]));
        assert_eq!(candidates.get("b"), Some(&vec![fp_b]));
    }
}
