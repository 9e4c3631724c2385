//! Accepted client credentials.
//!
//! Populated once at startup from `[[user_list]]` and read by every session.
//! Lookups for unknown users still run the comparison against a dummy
//! password, so "no such user" and "wrong password" take the same path.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use sqlgate_core::UserConfig;
use sqlgate_wire::auth::{password_matches, verify_native_password};

const DUMMY_PASSWORD: &str = "\u{0}sqlgate-unknown-user\u{0}";

#[derive(Clone)]
struct Credential {
    password: String,
    database: Option<String>,
}

/// Username to password map with an optional per-user database restriction.
#[derive(Default)]
pub struct CredentialStore {
    users: RwLock<HashMap<String, Credential>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_users(users: &[UserConfig]) -> Self {
        let store = Self::new();
        for user in users {
            match &user.database {
                Some(db) => store.add_user_with_database(&user.user, &user.password, db),
                None => store.add_user(&user.user, &user.password),
            }
        }
        store
    }

    /// Insert or replace a user. The last write wins.
    pub fn add_user(&self, user: &str, password: &str) {
        self.insert(user, password, None);
    }

    /// Insert or replace a user that may only use `database`.
    pub fn add_user_with_database(&self, user: &str, password: &str, database: &str) {
        self.insert(user, password, Some(database.to_string()));
    }

    fn insert(&self, user: &str, password: &str, database: Option<String>) {
        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        users.insert(
            user.to_string(),
            Credential {
                password: password.to_string(),
                database,
            },
        );
    }

    fn password_of(&self, user: &str) -> Option<String> {
        let users = self.users.read().unwrap_or_else(PoisonError::into_inner);
        users.get(user).map(|c| c.password.clone())
    }

    /// Plaintext check. `false` for unknown users and wrong passwords alike.
    pub fn authenticate(&self, user: &str, password: &str) -> bool {
        match self.password_of(user) {
            Some(expected) => password_matches(expected.as_bytes(), password.as_bytes()),
            None => {
                let _ = password_matches(DUMMY_PASSWORD.as_bytes(), password.as_bytes());
                false
            }
        }
    }

    /// Check a `mysql_native_password` response computed against `salt`.
    pub fn verify_scramble(&self, user: &str, salt: &[u8], response: &[u8]) -> bool {
        match self.password_of(user) {
            Some(expected) => verify_native_password(expected.as_bytes(), salt, response),
            None => {
                let _ = verify_native_password(DUMMY_PASSWORD.as_bytes(), salt, response);
                false
            }
        }
    }

    /// Whether `user` may select `database`. Unknown users may not.
    pub fn allows_database(&self, user: &str, database: &str) -> bool {
        let users = self.users.read().unwrap_or_else(PoisonError::into_inner);
        match users.get(user) {
            Some(Credential {
                database: Some(allowed),
                ..
            }) => allowed == database,
            Some(_) => true,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.users.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("users", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlgate_wire::auth::native_password_scramble;

    #[test]
    fn authenticate_known_user() {
        let store = CredentialStore::new();
        store.add_user("alice", "correct");
        assert!(store.authenticate("alice", "correct"));
        assert!(!store.authenticate("alice", "wrong"));
    }

    #[test]
    fn unknown_user_rejected() {
        let store = CredentialStore::new();
        store.add_user("alice", "correct");
        assert!(!store.authenticate("bob", "correct"));
        assert!(!store.authenticate("bob", ""));
    }

    #[test]
    fn last_write_wins() {
        let store = CredentialStore::new();
        store.add_user("alice", "old");
        store.add_user("alice", "new");
        assert!(store.authenticate("alice", "new"));
        assert!(!store.authenticate("alice", "old"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn empty_password_only_matches_empty() {
        let store = CredentialStore::new();
        store.add_user("guest", "");
        assert!(store.authenticate("guest", ""));
        assert!(!store.authenticate("guest", "x"));
    }

    #[test]
    fn prefixes_and_extensions_rejected() {
        let store = CredentialStore::new();
        store.add_user("alice", "correct");
        assert!(!store.authenticate("alice", "correc"));
        assert!(!store.authenticate("alice", "correct\0"));
        assert!(!store.authenticate("alice", "correct-horse"));
    }

    #[test]
    fn scramble_verification() {
        let store = CredentialStore::new();
        store.add_user("alice", "correct");
        let salt = [7u8; 20];

        let good = native_password_scramble(b"correct", &salt);
        let bad = native_password_scramble(b"wrong", &salt);
        assert!(store.verify_scramble("alice", &salt, &good));
        assert!(!store.verify_scramble("alice", &salt, &bad));
        assert!(!store.verify_scramble("mallory", &salt, &good));
    }

    #[test]
    fn database_restriction() {
        let store = CredentialStore::new();
        store.add_user_with_database("app", "pw", "orders");
        store.add_user("admin", "pw");

        assert!(store.allows_database("app", "orders"));
        assert!(!store.allows_database("app", "billing"));
        assert!(store.allows_database("admin", "billing"));
        assert!(!store.allows_database("nobody", "orders"));
    }

    #[test]
    fn from_users_loads_config() {
        let users = vec![
            UserConfig {
                user: "a".into(),
                password: "1".into(),
                database: None,
            },
            UserConfig {
                user: "b".into(),
                password: "2".into(),
                database: Some("db".into()),
            },
        ];
        let store = CredentialStore::from_users(&users);
        assert_eq!(store.len(), 2);
        assert!(!store.is_empty());
        assert!(store.authenticate("b", "2"));
        assert!(!store.allows_database("b", "other"));
    }

    #[test]
    fn concurrent_reads() {
        let store = std::sync::Arc::new(CredentialStore::new());
        store.add_user("alice", "correct");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        assert!(store.authenticate("alice", "correct"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
