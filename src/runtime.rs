//! Design Notes §9: a single `Runtime` value built once at startup from the
//! parsed configuration, the connected session pool, and the opened index,
//! then passed explicitly into every component. No implicit globals (a
//! deliberate departure from the teacher's module-level `OnceCell`/static
//! `CONFIG` pattern, mandated by the spec's Design Notes).

use std::path::PathBuf;

use crate::config::Config;
use crate::error::EngineError;
use crate::index::Index;
use crate::session::SessionPool;

pub struct Runtime {
    pub config: Config,
    pub pool: SessionPool,
    pub index: Index,
    pub maildir_root: PathBuf,
}

impl Runtime {
    /// Connects every configured server concurrently (fatal on any single
    /// failure, §4.4) and opens the index, in that order, matching the
    /// spec's "dial/open before doing any work" startup sequencing.
    pub fn start(config: Config) -> Result<Runtime, EngineError> {
        let pool = SessionPool::connect_all(&config.servers)?;
        let index = Index::open(&config.index_path()).map_err(EngineError::Other)?;
        let maildir_root = PathBuf::from(&config.maildir);
        Ok(Runtime {
            config,
            pool,
            index,
            maildir_root,
        })
    }

    /// Best-effort logout of every session, regardless of earlier errors
    /// (§4.4). Called on every exit path, success or failure.
    pub fn shutdown(&self) {
        self.pool.logout_all();
    }
}
