//! The central data-model entity (spec §3) and its flag set.

use std::path::PathBuf;

/// One of the flags the engine understands. `Recent` is special: it never
/// appears in a `:2,<flags>` suffix, it routes the file into `new/` instead
/// (spec §4.2). `Deleted` is tracked in-memory (e.g. while driving move and
/// sync) but is never written into a Maildir flagstring — see the Open
/// Questions in spec §9, preserved as observed in the original.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    Seen,
    Recent,
    Answered,
    Junk,
    Deleted,
}

/// The central Message entity. `seq_number` is only ever valid for the
/// lifetime of the mailbox selection it was observed under and is never
/// persisted (spec §3).
#[derive(Debug, Clone)]
pub struct Message {
    pub message_id: String,
    pub fingerprint: String,
    pub flags: Vec<Flag>,
    pub origin: String,
    pub subject: String,
    pub seq_number: u32,
    pub path: Option<PathBuf>,
}

impl Message {
    /// Constructs a Message from an observed Message-ID, deriving its
    /// fingerprint. Per invariant 3, callers must check `is_identifiable`
    /// before indexing or writing this message anywhere.
    pub fn new(message_id: String, origin: String, subject: String, seq_number: u32) -> Self {
        let fingerprint = crate::identity::fingerprint(&message_id);
        Message {
            message_id,
            fingerprint,
            flags: Vec::new(),
            origin,
            subject,
            seq_number,
            path: None,
        }
    }

    /// Invariant 3: a message with an empty Message-ID or empty fingerprint
    /// is never written and never indexed.
    pub fn is_identifiable(&self) -> bool {
        !self.message_id.is_empty() && !self.fingerprint.is_empty()
    }

    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_message_id() {
        let m = Message::new(String::new(), "s1".into(), "".into(), 1);
        assert!(!m.is_identifiable());
    }

    #[test]
    fn accepts_well_formed_message_id() {
        let m = Message::new("<abc@x>".into(), "s1".into(), "hi".into(), 1);
        assert!(m.is_identifiable());
        assert_eq!(m.fingerprint, crate::identity::fingerprint("<abc@x>"));
    }
}
