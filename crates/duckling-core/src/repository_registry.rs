//! Repository registry (C14): maps registered working-copy paths to
//! (owner, name). Read-mostly — written only by the HTTP surface, read by
//! the engine.

use anyhow::{anyhow, Result};

use crate::db::Db;
use crate::types::Repository;

pub struct RepositoryRegistry<'a> {
    db: &'a Db,
}

impl<'a> RepositoryRegistry<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { db }
    }

    pub fn register(&self, path: &str, name: &str, owner: &str) -> Result<()> {
        self.db.register_repository(path, name, owner)
    }

    pub fn lookup(&self, path: &str) -> Result<Repository> {
        self.db
            .get_repository(path)?
            .ok_or_else(|| anyhow!("repository not registered: {path}"))
    }

    pub fn is_registered(&self, path: &str) -> Result<bool> {
        Ok(self.db.get_repository(path)?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_path_is_rejected() {
        let db = Db::open_in_memory().unwrap();
        let registry = RepositoryRegistry::new(&db);
        assert!(registry.lookup("/nope").is_err());
    }

    #[test]
    fn registered_path_resolves_owner_and_name() {
        let db = Db::open_in_memory().unwrap();
        let registry = RepositoryRegistry::new(&db);
        registry.register("/r", "n", "o").unwrap();
        let repo = registry.lookup("/r").unwrap();
        assert_eq!(repo.owner, "o");
        assert_eq!(repo.name, "n");
    }
}
