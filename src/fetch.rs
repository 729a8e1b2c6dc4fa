//! C5 — Fetch Pipeline: select → enumerate sequence numbers → stream bodies
//! → dedupe against index+filesystem → persist.

use std::path::{Path, PathBuf};

use itertools::Itertools;
use log::{debug, info, warn};

use crate::error::EngineError;
use crate::index::{Index, IndexRow};
use crate::maildir::MaildirStore;
use crate::message::{Flag, Message};
use crate::session::SessionPool;

/// Which messages a fetch run should consider (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Messages without the Seen flag (IMAP `SEARCH UNSEEN`).
    New,
    /// Every message currently in the mailbox.
    All,
}

/// Pure sequence-set construction (§4.5 step 2), factored out of `fetch` so
/// it can be unit tested without a live session: `New` joins the sorted
/// unseen sequence numbers, `All` is the full `1:<exists>` range. Both
/// return `None` when there is nothing to fetch.
fn build_sequence_set(scope: Scope, mailbox_exists: u32, unseen: &[u32]) -> Option<String> {
    match scope {
        Scope::New => {
            if unseen.is_empty() {
                return None;
            }
            Some(unseen.iter().sorted().map(|n| n.to_string()).join(","))
        }
        Scope::All => {
            if mailbox_exists == 0 {
                return None;
            }
            Some(format!("1:{mailbox_exists}"))
        }
    }
}

/// Pure dedupe decision (§4.5 step 4), factored out of `fetch` so it can be
/// unit tested without a live session or filesystem: given whether a
/// fingerprint is already indexed and whether a file for it already exists
/// on disk, decide what to do with a newly-observed message.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DedupeDecision {
    /// Already indexed: report it as observed (so snapshot-consumers like
    /// `sync`'s diff step still see it) but write nothing and touch no
    /// index row — this is the idempotence/duplicate-detected case.
    AlreadyIndexed,
    /// Not indexed but a file with this fingerprint already exists (e.g.
    /// from a prior crashed run): adopt the existing path into the index,
    /// without rewriting the file.
    AdoptExisting(PathBuf),
    /// Neither indexed nor on disk: hand off to a write worker.
    NeedsWrite,
}

fn dedupe_decision(already_indexed: bool, on_disk: Option<&PathBuf>) -> DedupeDecision {
    if already_indexed {
        DedupeDecision::AlreadyIndexed
    } else if let Some(path) = on_disk {
        DedupeDecision::AdoptExisting(path.clone())
    } else {
        DedupeDecision::NeedsWrite
    }
}

/// Runs one `(server, folder, scope)` fetch (§4.5). Folder-select failures
/// (including an unresolvable folder name) are logged and produce an empty,
/// non-fatal result — other server/folder work continues. An index write
/// failure after a successful file write is fatal (it would violate
/// invariant 1) and is the only error this function propagates.
pub fn fetch(
    pool: &SessionPool,
    index: &Index,
    maildir_root: &Path,
    common_inbox: bool,
    server_name: &str,
    folder: &str,
    scope: Scope,
) -> Result<Vec<Message>, EngineError> {
    let server = match pool.servers.get(server_name) {
        Some(s) => s,
        None => {
            warn!("fetch: unknown server {server_name}");
            return Ok(Vec::new());
        }
    };

    let canonical = match pool.canonicalize_folder(server_name, folder) {
        Some(name) => name,
        None => {
            warn!("fetch: folder {folder:?} not found on {server_name}, skipping");
            return Ok(Vec::new());
        }
    };

    let mut session = server.session.lock();
    let mailbox = match session.select(&canonical) {
        Ok(mbox) => mbox,
        Err(e) => {
            warn!("fetch: select {canonical:?} on {server_name} failed: {e}, skipping");
            return Ok(Vec::new());
        }
    };

    let unseen: Vec<u32> = match scope {
        Scope::New => session
            .search("UNSEEN")
            .map_err(|e| EngineError::FolderMissing {
                server: server_name.to_owned(),
                folder: canonical.clone(),
                source: e.into(),
            })?
            .into_iter()
            .collect(),
        Scope::All => Vec::new(),
    };
    let sequence_set = match build_sequence_set(scope, mailbox.exists, &unseen) {
        Some(s) => s,
        None => return Ok(Vec::new()),
    };

    debug!("fetching {server_name}/{canonical} seq {sequence_set}");
    let fetches = session
        .fetch(&sequence_set, "(FLAGS BODY.PEEK[])")
        .map_err(|e| EngineError::FolderMissing {
            server: server_name.to_owned(),
            folder: canonical.clone(),
            source: e.into(),
        })?;
    drop(session);

    let store = MaildirStore::resolve(maildir_root, server_name, &canonical, common_inbox);
    store
        .ensure_dirs()
        .map_err(|e| EngineError::Other(e))?;
    let on_disk = store.scan().map_err(|e| EngineError::Other(e))?;

    let mut observed = Vec::new();
    let mut pending_writes = Vec::new();

    for item in fetches.iter() {
        let body = match item.body() {
            Some(b) => b,
            None => {
                warn!("fetch: message with no body on {server_name}/{canonical}, skipping");
                continue;
            }
        };
        let (headers, body_offset) = match mailparse::parse_headers(body) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("fetch: malformed headers on {server_name}/{canonical}: {e}, skipping");
                continue;
            }
        };
        let message_id = mailparse::MailHeaderMap::get_all_values(&headers, "Message-ID").join(" ");
        let message_id = message_id.trim().to_owned();
        let fingerprint = crate::identity::fingerprint(&message_id);
        if message_id.is_empty() || fingerprint.is_empty() {
            warn!("fetch: message with empty Message-ID on {server_name}/{canonical}, skipping");
            continue;
        }

        let indexed_row = index.find(&fingerprint).map_err(EngineError::Other)?;
        let subject = mailparse::MailHeaderMap::get_all_values(&headers, "Subject").join(" ");
        let mut flags = imap_flags_to_engine(item.flags());
        let seq_number = item.message;

        match dedupe_decision(indexed_row.is_some(), on_disk.get(&fingerprint)) {
            DedupeDecision::AlreadyIndexed => {
                // duplicate-detected (§7): no write, no index mutation, but
                // still report it as observed — callers like `sync`'s
                // snapshot diff rely on steady-state messages showing up
                // here even though they're already indexed.
                debug!("duplicate-detected: {fingerprint} already indexed, recording as observed");
                let path = indexed_row.map(|row| PathBuf::from(row.path));
                observed.push(Message {
                    message_id,
                    fingerprint,
                    flags,
                    origin: server_name.to_owned(),
                    subject,
                    seq_number,
                    path,
                });
            }
            DedupeDecision::AdoptExisting(existing_path) => {
                // catch-up: the file exists already (e.g. from a prior
                // crashed run) but the index row is missing; adopt it
                // without a rewrite.
                index
                    .insert(&IndexRow {
                        timestamp: now(),
                        fingerprint: fingerprint.clone(),
                        message_id: message_id.clone(),
                        path: existing_path.to_string_lossy().into_owned(),
                        origin: server_name.to_owned(),
                    })
                    .map_err(|e| EngineError::IndexAfterWrite {
                        fingerprint: fingerprint.clone(),
                        source: e,
                    })?;
                observed.push(Message {
                    message_id,
                    fingerprint,
                    flags,
                    origin: server_name.to_owned(),
                    subject,
                    seq_number,
                    path: Some(existing_path),
                });
            }
            DedupeDecision::NeedsWrite => {
                if scope == Scope::New {
                    flags.push(Flag::Recent);
                }
                let header_pairs: Vec<(String, String)> = headers
                    .iter()
                    .map(|h| (h.get_key(), h.get_value()))
                    .collect();
                pending_writes.push((
                    fingerprint,
                    message_id,
                    subject,
                    seq_number,
                    flags,
                    header_pairs,
                    body[body_offset..].to_vec(),
                ));
            }
        }
    }

    // Write workers run in parallel; the pipeline waits for all of them
    // before returning (§4.5 step 4).
    let results: Vec<anyhow::Result<(Message, IndexRow)>> = std::thread::scope(|scope_handle| {
        let handles: Vec<_> = pending_writes
            .into_iter()
            .map(|(fingerprint, message_id, subject, seq_number, flags, headers, body)| {
                let store = &store;
                scope_handle.spawn(move || -> anyhow::Result<(Message, IndexRow)> {
                    let path = store.write(&fingerprint, &headers, &body, &flags)?;
                    let row = IndexRow {
                        timestamp: now(),
                        fingerprint: fingerprint.clone(),
                        message_id: message_id.clone(),
                        path: path.to_string_lossy().into_owned(),
                        origin: server_name.to_owned(),
                    };
                    Ok((
                        Message {
                            message_id,
                            fingerprint,
                            flags,
                            origin: server_name.to_owned(),
                            subject,
                            seq_number,
                            path: Some(path),
                        },
                        row,
                    ))
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| Err(anyhow::anyhow!("write worker panicked"))))
            .collect()
    });

    for result in results {
        match result {
            Ok((message, row)) => {
                index
                    .insert(&row)
                    .map_err(|e| EngineError::IndexAfterWrite {
                        fingerprint: row.fingerprint.clone(),
                        source: e,
                    })?;
                observed.push(message);
            }
            Err(e) => {
                warn!("fetch: filesystem write failed on {server_name}/{canonical}: {e}, skipping");
            }
        }
    }

    info!(
        "fetched {} message(s) from {server_name}/{canonical}",
        observed.len()
    );
    Ok(observed)
}

fn imap_flags_to_engine(flags: &[imap::types::Flag]) -> Vec<Flag> {
    flags
        .iter()
        .filter_map(|f| match f {
            imap::types::Flag::Seen => Some(Flag::Seen),
            imap::types::Flag::Answered => Some(Flag::Answered),
            imap::types::Flag::Deleted => Some(Flag::Deleted),
            imap::types::Flag::Recent => Some(Flag::Recent),
            imap::types::Flag::Custom(name) if name.to_ascii_lowercase().contains("junk") => {
                Some(Flag::Junk)
            }
            _ => None,
        })
        .collect()
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_imap_flags() {
        let flags = vec![imap::types::Flag::Seen, imap::types::Flag::Recent];
        let mapped = imap_flags_to_engine(&flags);
        assert!(mapped.contains(&Flag::Seen));
        assert!(mapped.contains(&Flag::Recent));
    }

    #[test]
    fn maps_custom_junk_flag_case_insensitively() {
        let flags = vec![imap::types::Flag::Custom("$Junk".into())];
        let mapped = imap_flags_to_engine(&flags);
        assert_eq!(mapped, vec![Flag::Junk]);
    }

    #[test]
    fn drops_unknown_flags() {
        let flags = vec![imap::types::Flag::Draft, imap::types::Flag::MayCreate];
        assert!(imap_flags_to_engine(&flags).is_empty());
    }

    #[test]
    fn sequence_set_new_is_sorted_comma_join() {
        assert_eq!(
            build_sequence_set(Scope::New, 10, &[5, 1, 3]),
            Some("1,3,5".to_owned())
        );
    }

    #[test]
    fn sequence_set_new_is_none_when_nothing_unseen() {
        assert_eq!(build_sequence_set(Scope::New, 10, &[]), None);
    }

    #[test]
    fn sequence_set_all_is_full_range() {
        assert_eq!(build_sequence_set(Scope::All, 7, &[]), Some("1:7".to_owned()));
    }

    #[test]
    fn sequence_set_all_is_none_when_mailbox_empty() {
        assert_eq!(build_sequence_set(Scope::All, 0, &[99]), None);
    }

    #[test]
    fn dedupe_decision_already_indexed_wins_over_on_disk() {
        let on_disk = PathBuf::from("/mail/cur/1.fp.host:2,S");
        assert_eq!(
            dedupe_decision(true, Some(&on_disk)),
            DedupeDecision::AlreadyIndexed
        );
    }

    #[test]
    fn dedupe_decision_adopts_existing_file_when_not_indexed() {
        let on_disk = PathBuf::from("/mail/cur/1.fp.host:2,S");
        assert_eq!(
            dedupe_decision(false, Some(&on_disk)),
            DedupeDecision::AdoptExisting(on_disk)
        );
    }

    #[test]
    fn dedupe_decision_needs_write_when_neither_indexed_nor_on_disk() {
        assert_eq!(dedupe_decision(false, None), DedupeDecision::NeedsWrite);
    }
}
