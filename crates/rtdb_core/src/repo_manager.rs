//! Registry of open databases keyed by host and namespace.

use crate::config::{DatabaseConfig, RepoInfo};
use crate::connection::Connection;
use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, info};

/// Owns one [`Database`] per [`RepoInfo`].
///
/// Create one per application; there is no global instance.
#[derive(Default)]
pub struct RepoManager {
    repos: Mutex<HashMap<RepoInfo, Database>>,
}

impl RepoManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a database for `config.repo_info`.
    ///
    /// Fails if one is already registered for it.
    pub fn create(&self, config: DatabaseConfig, connection: Box<dyn Connection>) -> CoreResult<Database> {
        let mut repos = self.repos.lock();
        if repos.contains_key(&config.repo_info) {
            return Err(CoreError::RepoAlreadyExists(config.repo_info.to_string()));
        }
        let info = config.repo_info.clone();
        let db = Database::new(config, connection)?;
        info!(repo = %info, "registered repo");
        repos.insert(info, db.clone());
        Ok(db)
    }

    /// The database registered for `info`.
    pub fn get(&self, info: &RepoInfo) -> CoreResult<Database> {
        self.repos
            .lock()
            .get(info)
            .cloned()
            .ok_or_else(|| CoreError::RepoNotFound(info.to_string()))
    }

    /// Shuts down and forgets the database for `info`.
    pub fn destroy(&self, info: &RepoInfo) -> CoreResult<()> {
        let db = self
            .repos
            .lock()
            .remove(info)
            .ok_or_else(|| CoreError::RepoNotFound(info.to_string()))?;
        db.shutdown();
        info!(repo = %info, "destroyed repo");
        Ok(())
    }

    /// Number of registered databases.
    pub fn len(&self) -> usize {
        self.repos.lock().len()
    }

    /// Returns true if no database is registered.
    pub fn is_empty(&self) -> bool {
        self.repos.lock().is_empty()
    }

    /// Drops every connection. Databases without listeners also pause
    /// their run loop until [`RepoManager::resume_all`].
    pub fn interrupt_all(&self) -> CoreResult<()> {
        let repos: Vec<Database> = self.repos.lock().values().cloned().collect();
        for db in repos {
            db.go_offline()?;
            let db_for_check = db.clone();
            db.run_loop().schedule(move |repo| {
                if !repo.has_listeners() {
                    debug!(repo = %db_for_check.repo_info(), "no listeners, pausing run loop");
                    db_for_check.interrupt();
                }
            })?;
        }
        Ok(())
    }

    /// Resumes every run loop and reconnects.
    pub fn resume_all(&self) -> CoreResult<()> {
        let repos: Vec<Database> = self.repos.lock().values().cloned().collect();
        for db in repos {
            db.resume();
            db.go_online()?;
        }
        Ok(())
    }
}

impl Drop for RepoManager {
    fn drop(&mut self) {
        for (_, db) in self.repos.get_mut().drain() {
            db.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MockConnection;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn eventually(cond: impl Fn() -> bool) {
        let deadline = std::time::Instant::now() + TIMEOUT;
        while !cond() {
            assert!(std::time::Instant::now() < deadline, "condition not reached");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn config(ns: &str) -> DatabaseConfig {
        DatabaseConfig::new(RepoInfo::new("localhost:9000", ns))
    }

    #[test]
    fn create_get_destroy() {
        let manager = RepoManager::new();
        let db = manager
            .create(config("a"), Box::new(MockConnection::new()))
            .unwrap();
        let again = manager.create(config("a"), Box::new(MockConnection::new()));
        assert!(matches!(again, Err(CoreError::RepoAlreadyExists(_))));

        let info = RepoInfo::new("localhost:9000", "a");
        assert_eq!(manager.get(&info).unwrap().repo_info(), db.repo_info());
        assert_eq!(manager.len(), 1);

        manager.destroy(&info).unwrap();
        assert!(db.is_shut_down());
        assert!(matches!(manager.get(&info), Err(CoreError::RepoNotFound(_))));
        assert!(manager.is_empty());
    }

    #[test]
    fn interrupt_pauses_idle_repos_only() {
        let manager = RepoManager::new();
        let quiet_conn = MockConnection::new();
        let busy_conn = MockConnection::new();
        let quiet = manager.create(config("quiet"), Box::new(quiet_conn.clone())).unwrap();
        let busy = manager.create(config("busy"), Box::new(busy_conn.clone())).unwrap();
        busy.reference("x")
            .unwrap()
            .add_listener(crate::EventMask::VALUE, |_: &crate::Event| {})
            .unwrap();
        busy.wait_idle(TIMEOUT).unwrap();

        manager.interrupt_all().unwrap();
        // The paused loop holds its remaining tasks, so it never goes idle.
        eventually(|| quiet.is_interrupted());
        busy.wait_idle(TIMEOUT).unwrap();
        assert!(quiet_conn.is_interrupted());
        assert!(busy_conn.is_interrupted());
        assert!(quiet.is_interrupted());
        assert!(!busy.is_interrupted());

        manager.resume_all().unwrap();
        quiet.wait_idle(TIMEOUT).unwrap();
        assert!(!quiet.is_interrupted());
        assert!(!quiet_conn.is_interrupted());
    }
}
