//! Who is connecting, and in what role.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::model::{Actor, Role, UserId};

/// Work factor for hashes minted at startup; see `SLOTD_PASSWORD_COST`.
pub const DEFAULT_HASH_COST: u32 = bcrypt::DEFAULT_COST;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Account {
    pub id: UserId,
    pub name: String,
    /// bcrypt hash (`$2b$...`); plaintext is never stored.
    pub password_hash: String,
    #[serde(default = "default_role")]
    pub role: Role,
}

fn default_role() -> Role {
    Role::User
}

impl Account {
    /// Build an account from a plaintext password, hashing it at `cost`.
    pub fn with_password(
        id: UserId,
        name: impl Into<String>,
        password: &str,
        role: Role,
        cost: u32,
    ) -> Result<Self, IdentityError> {
        let password_hash =
            bcrypt::hash(password, cost).map_err(|e| IdentityError::Hash(e.to_string()))?;
        Ok(Self { id, name: name.into(), password_hash, role })
    }

    pub fn actor(&self) -> Actor {
        Actor { id: self.id, role: self.role }
    }
}

#[derive(Debug)]
pub enum IdentityError {
    /// Unknown name or wrong password. Deliberately indistinguishable.
    Unauthenticated,
    Load(String),
    Duplicate(String),
    Hash(String),
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityError::Unauthenticated => write!(f, "invalid credentials"),
            IdentityError::Load(e) => write!(f, "cannot load accounts: {e}"),
            IdentityError::Duplicate(what) => write!(f, "duplicate account {what}"),
            IdentityError::Hash(e) => write!(f, "cannot hash password: {e}"),
        }
    }
}

impl std::error::Error for IdentityError {}

/// Credential check and subject lookup. Trusted for every authorization decision.
pub trait IdentityProvider: Send + Sync {
    /// Stored bcrypt hash for `name`.
    fn password_hash(&self, name: &str) -> Option<&str>;

    fn resolve(&self, name: &str) -> Result<Actor, IdentityError>;

    /// CPU-bound (bcrypt); async callers should run it on a blocking thread.
    fn authenticate(&self, name: &str, password: &str) -> Result<Actor, IdentityError> {
        let verified = self
            .password_hash(name)
            .is_some_and(|hash| bcrypt::verify(password, hash).unwrap_or(false));
        if verified {
            self.resolve(name)
        } else {
            Err(IdentityError::Unauthenticated)
        }
    }
}

/// Static account table, keyed by login name.
#[derive(Debug, Default)]
pub struct Directory {
    accounts: HashMap<String, Account>,
}

impl Directory {
    pub fn new(accounts: impl IntoIterator<Item = Account>) -> Result<Self, IdentityError> {
        let mut dir = Self::default();
        for account in accounts {
            dir.insert(account)?;
        }
        Ok(dir)
    }

    /// Load a JSON array of accounts.
    pub fn load(path: &Path) -> Result<Self, IdentityError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| IdentityError::Load(format!("{}: {e}", path.display())))?;
        let accounts: Vec<Account> =
            serde_json::from_str(&raw).map_err(|e| IdentityError::Load(e.to_string()))?;
        Self::new(accounts)
    }

    pub fn insert(&mut self, account: Account) -> Result<(), IdentityError> {
        if self.accounts.contains_key(&account.name) {
            return Err(IdentityError::Duplicate(format!("name {}", account.name)));
        }
        if self.accounts.values().any(|a| a.id == account.id) {
            return Err(IdentityError::Duplicate(format!("id {}", account.id)));
        }
        self.accounts.insert(account.name.clone(), account);
        Ok(())
    }

    /// Next id not taken by any account.
    pub fn next_id(&self) -> UserId {
        self.accounts.values().map(|a| a.id).max().unwrap_or(0) + 1
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

impl IdentityProvider for Directory {
    fn password_hash(&self, name: &str) -> Option<&str> {
        self.accounts.get(name).map(|a| a.password_hash.as_str())
    }

    fn resolve(&self, name: &str) -> Result<Actor, IdentityError> {
        self.accounts
            .get(name)
            .map(Account::actor)
            .ok_or(IdentityError::Unauthenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// bcrypt's minimum cost keeps the tests fast.
    const COST: u32 = 4;

    fn account(id: UserId, name: &str, role: Role) -> Account {
        Account::with_password(id, name, &format!("{name}-pw"), role, COST).unwrap()
    }

    #[test]
    fn authenticate_checks_password() {
        let dir = Directory::new([account(1, "alice", Role::User), account(2, "root", Role::Admin)]).unwrap();
        assert_eq!(dir.authenticate("alice", "alice-pw").unwrap(), Actor::user(1));
        assert_eq!(dir.authenticate("root", "root-pw").unwrap(), Actor::admin(2));
        assert!(matches!(dir.authenticate("alice", "nope"), Err(IdentityError::Unauthenticated)));
        assert!(matches!(dir.authenticate("mallory", "x"), Err(IdentityError::Unauthenticated)));
        assert!(matches!(dir.resolve("mallory"), Err(IdentityError::Unauthenticated)));
    }

    #[test]
    fn stored_password_is_a_hash() {
        let alice = account(1, "alice", Role::User);
        assert!(alice.password_hash.starts_with("$2"), "{}", alice.password_hash);
        assert!(!alice.password_hash.contains("alice-pw"));
        let dir = Directory::new([alice.clone()]).unwrap();
        // The hash itself is not a password.
        assert!(matches!(
            dir.authenticate("alice", &alice.password_hash),
            Err(IdentityError::Unauthenticated)
        ));
    }

    #[test]
    fn malformed_stored_hash_never_authenticates() {
        let broken = Account { id: 1, name: "alice".into(), password_hash: "alice-pw".into(), role: Role::User };
        let dir = Directory::new([broken]).unwrap();
        assert!(matches!(dir.authenticate("alice", "alice-pw"), Err(IdentityError::Unauthenticated)));
    }

    #[test]
    fn duplicates_rejected() {
        let err = Directory::new([account(1, "alice", Role::User), account(2, "alice", Role::User)]);
        assert!(matches!(err, Err(IdentityError::Duplicate(_))));
        let err = Directory::new([account(1, "alice", Role::User), account(1, "bob", Role::User)]);
        assert!(matches!(err, Err(IdentityError::Duplicate(_))));
    }

    #[test]
    fn load_json_with_default_role() {
        let path = std::env::temp_dir().join("slotd_test_accounts.json");
        let hash = bcrypt::hash("pw", COST).unwrap();
        std::fs::write(
            &path,
            format!(
                r#"[{{"id": 1, "name": "alice", "password_hash": "{hash}"}},
                    {{"id": 9, "name": "ops", "password_hash": "{hash}", "role": "admin"}}]"#
            ),
        )
        .unwrap();
        let dir = Directory::load(&path).unwrap();
        assert_eq!(dir.len(), 2);
        assert_eq!(dir.authenticate("alice", "pw").unwrap(), Actor::user(1));
        assert_eq!(dir.resolve("ops").unwrap(), Actor::admin(9));
        assert_eq!(dir.next_id(), 10);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn load_rejects_bad_json() {
        let path = std::env::temp_dir().join("slotd_test_accounts_bad.json");
        std::fs::write(&path, r#"{"not": "a list"}"#).unwrap();
        assert!(matches!(Directory::load(&path), Err(IdentityError::Load(_))));
        let _ = std::fs::remove_file(&path);
    }
}
