//! C2 — Maildir Store: enumerate and write `<root>/<folder>/{cur,new,tmp}/`.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use gethostname::gethostname;
use once_cell::sync::OnceCell;

use crate::message::Flag;

static HOSTNAME: OnceCell<String> = OnceCell::new();

fn hostname() -> &'static str {
    HOSTNAME.get_or_init(|| gethostname().to_string_lossy().into_owned())
}

/// A single resolved `<root>/<folder>` Maildir, with `cur/new/tmp` ensured
/// to exist on first access.
pub struct MaildirStore {
    path: PathBuf,
}

impl MaildirStore {
    /// Resolves the on-disk folder for `(origin, folder)` per §4.2: shared
    /// `<root>/<folder>` when `folder` case-insensitively equals `INBOX` and
    /// `common_inbox` is set, or when `origin` is empty; otherwise
    /// `<root>/<origin>/<folder>`. Slashes inside `folder` become `.`.
    pub fn resolve(root: &Path, origin: &str, folder: &str, common_inbox: bool) -> Self {
        let safe_folder = folder.replace('/', ".");
        let shared = (common_inbox && folder.eq_ignore_ascii_case("inbox")) || origin.is_empty();
        let path = if shared {
            root.join(&safe_folder)
        } else {
            root.join(origin).join(&safe_folder)
        };
        MaildirStore { path }
    }

    /// Ensures `cur/`, `new/`, `tmp/` exist under the resolved folder.
    pub fn ensure_dirs(&self) -> anyhow::Result<()> {
        for sub in ["cur", "new", "tmp"] {
            fs::create_dir_all(self.path.join(sub))
                .with_context(|| format!("failed to create {}/{}", self.path.display(), sub))?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Scans `cur/`, `new/`, and (defensively) `tmp/`, returning a map from
    /// fingerprint to the absolute path of the file that names it. A later
    /// duplicate for the same fingerprint overwrites an earlier one
    /// (invariant 2 makes this unexpected in practice).
    pub fn scan(&self) -> anyhow::Result<HashMap<String, PathBuf>> {
        let mut found = HashMap::new();
        for sub in ["cur", "new", "tmp"] {
            let dir = self.path.join(sub);
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e).context(format!("failed to read {}", dir.display())),
            };
            for entry in entries {
                let entry = entry?;
                let filename = entry.file_name();
                let filename = filename.to_string_lossy();
                if let Some(fingerprint) = filename.splitn(3, '.').nth(1) {
                    found.insert(fingerprint.to_owned(), entry.path());
                }
            }
        }
        Ok(found)
    }

    /// Writes `message` with body `content` if no file for its fingerprint
    /// already exists in this folder (idempotence, §4.2). Returns the path
    /// written, or the existing path if this call was a no-op.
    ///
    /// The write is crash-visible-or-invisible: the file is written into
    /// `tmp/` and fsynced, then renamed into `cur/` or `new/`, so a crash
    /// mid-write never leaves a partial file in a client-visible directory.
    pub fn write(
        &self,
        fingerprint: &str,
        headers: &[(String, String)],
        body: &[u8],
        flags: &[Flag],
    ) -> anyhow::Result<PathBuf> {
        self.ensure_dirs()?;
        if let Some(existing) = self.scan()?.get(fingerprint) {
            return Ok(existing.clone());
        }

        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let recent = flags.contains(&Flag::Recent);
        let target_dir = if recent { "new" } else { "cur" };
        let filename = Self::filename(ts, fingerprint, flags, recent);

        let tmp_path = self.path.join("tmp").join(&filename);
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        for (name, value) in headers {
            writeln!(file, "{}: {}", name, value)?;
        }
        writeln!(file)?;
        file.write_all(body)?;
        file.sync_all()?;
        drop(file);

        let final_path = self.path.join(target_dir).join(&filename);
        fs::rename(&tmp_path, &final_path).with_context(|| {
            format!(
                "failed to rename {} into {}",
                tmp_path.display(),
                final_path.display()
            )
        })?;
        Ok(final_path)
    }

    /// `<unix_ts>.<fingerprint>.<hostname>:2,<flagstring>` for `cur/`, or
    /// `<unix_ts>.<fingerprint>.<hostname>` (no suffix) for `new/`, per
    /// §4.2. `<flagstring>` is S/A/J in insertion order, dropping unknown
    /// flags and Recent (which only routes placement); Deleted is never
    /// written here (see spec §9 Open Questions). If no letter survives,
    /// the default is `S`.
    fn filename(ts: u64, fingerprint: &str, flags: &[Flag], recent: bool) -> String {
        if recent {
            return format!("{}.{}.{}", ts, fingerprint, hostname());
        }
        let mut flagstring = String::new();
        for flag in flags {
            match flag {
                Flag::Seen => flagstring.push('S'),
                Flag::Answered => flagstring.push('A'),
                Flag::Junk => flagstring.push('J'),
                Flag::Recent | Flag::Deleted => {}
            }
        }
        if flagstring.is_empty() {
            flagstring.push('S');
        }
        format!("{}.{}.{}:2,{}", ts, fingerprint, hostname(), flagstring)
    }
}
