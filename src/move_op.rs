//! C6 — Move/Expunge: locate a Message-ID's sequence number on a server and
//! flag/copy/expunge it (§4.6). Module named `move_op` because `move` is a
//! Rust keyword.

use std::fs;

use log::info;

use crate::error::EngineError;
use crate::session::SessionPool;

/// Either a literal Message-ID or a filesystem path whose `Message-ID:`
/// header should be parsed out (§4.6). The CLI hands us the raw `-mid`
/// string and we decide which at `resolve` time.
pub enum MatchTarget {
    MessageId(String),
    Path(String),
}

impl MatchTarget {
    /// `-mid` is a path if it names an existing file; otherwise it is taken
    /// as a literal Message-ID.
    pub fn from_cli_arg(arg: &str) -> MatchTarget {
        if std::path::Path::new(arg).is_file() {
            MatchTarget::Path(arg.to_owned())
        } else {
            MatchTarget::MessageId(arg.to_owned())
        }
    }

    /// Resolves to the literal Message-ID to search for, parsing the header
    /// out of the file when given a path.
    pub fn resolve(&self) -> Result<String, EngineError> {
        match self {
            MatchTarget::MessageId(id) => Ok(id.clone()),
            MatchTarget::Path(path) => {
                let content = fs::read(path).map_err(|e| {
                    EngineError::Other(anyhow::anyhow!(
                        "failed to read message file {path:?}: {e}"
                    ))
                })?;
                let (headers, _) = mailparse::parse_headers(&content).map_err(|e| {
                    EngineError::Other(anyhow::anyhow!(
                        "failed to parse headers of {path:?}: {e}"
                    ))
                })?;
                let message_id =
                    mailparse::MailHeaderMap::get_all_values(&headers, "Message-ID").join(" ");
                Ok(message_id.trim().to_owned())
            }
        }
    }
}

/// `move(session, server_name, match, dest_folder)` (§4.6 step 1-4): selects
/// INBOX, scans the full range for the first envelope whose Message-ID
/// equals `target`, and on a match hands off to [`move_message`]. Any
/// IMAP-level error is fatal for this operation, per §4.6/§7.
pub fn move_message_by_id(
    pool: &SessionPool,
    server_name: &str,
    target: &str,
    dest_folder: &str,
) -> Result<bool, EngineError> {
    let server = pool
        .servers
        .get(server_name)
        .ok_or_else(|| EngineError::ConfigInvalid(format!("unknown server {server_name}")))?;

    let mut session = server.session.lock();
    let mailbox = session
        .select("INBOX")
        .map_err(|e| EngineError::ImapMutation {
            server: server_name.to_owned(),
            source: e.into(),
        })?;
    if mailbox.exists == 0 {
        return Ok(false);
    }

    let range = format!("1:{}", mailbox.exists);
    let fetches = session
        .fetch(&range, "(BODY.PEEK[HEADER.FIELDS (MESSAGE-ID)])")
        .map_err(|e| EngineError::ImapMutation {
            server: server_name.to_owned(),
            source: e.into(),
        })?;

    let mut seq = None;
    for item in fetches.iter() {
        let message_id = item
            .header()
            .and_then(|h| mailparse::parse_headers(h).ok())
            .map(|(headers, _)| {
                mailparse::MailHeaderMap::get_all_values(&headers, "Message-ID").join(" ")
            })
            .unwrap_or_default();
        if message_id.trim() == target {
            seq = Some(item.message);
            break;
        }
    }

    let seq = match seq {
        Some(seq) => seq,
        None => return Ok(false),
    };
    drop(session);

    move_message(pool, server_name, seq, dest_folder)?;
    Ok(true)
}

/// `move_message(session, server_name, msg, dest_folder)` (§4.6): select
/// INBOX; if `dest_folder` is non-empty, flag Seen and copy `seq` there;
/// flag Deleted on `seq`; expunge. An empty `dest_folder` skips the copy
/// step (delete-only). Any IMAP error aborts the whole process, per spec.
pub fn move_message(
    pool: &SessionPool,
    server_name: &str,
    seq: u32,
    dest_folder: &str,
) -> Result<(), EngineError> {
    let server = pool
        .servers
        .get(server_name)
        .ok_or_else(|| EngineError::ConfigInvalid(format!("unknown server {server_name}")))?;
    let mut session = server.session.lock();

    session
        .select("INBOX")
        .map_err(|e| EngineError::ImapMutation {
            server: server_name.to_owned(),
            source: e.into(),
        })?;

    macro_rules! mutate {
        ($op:expr) => {
            $op.map(|_| ()).map_err(|e| EngineError::ImapMutation {
                server: server_name.to_owned(),
                source: e.into(),
            })
        };
    }

    if !dest_folder.is_empty() {
        mutate!(session.store(seq.to_string(), "+FLAGS.SILENT (\\Seen)"))?;
        info!("moving seq {seq} on {server_name} to {dest_folder}");
        mutate!(session.copy(seq.to_string(), dest_folder))?;
    }

    mutate!(session.store(seq.to_string(), "+FLAGS.SILENT (\\Deleted)"))?;
    mutate!(session.expunge())?;
    info!("expunged seq {seq} on {server_name}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn from_cli_arg_detects_existing_path() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "Message-ID: <abc@x>").unwrap();
        writeln!(f).unwrap();
        writeln!(f, "body").unwrap();
        let target = MatchTarget::from_cli_arg(f.path().to_str().unwrap());
        assert!(matches!(target, MatchTarget::Path(_)));
        assert_eq!(target.resolve().unwrap(), "<abc@x>");
    }

    #[test]
    fn from_cli_arg_treats_nonexistent_as_literal_id() {
        let target = MatchTarget::from_cli_arg("<literal@x>");
        assert!(matches!(target, MatchTarget::MessageId(_)));
        assert_eq!(target.resolve().unwrap(), "<literal@x>");
    }
}
