//! Job owners.

use serde::{Deserialize, Serialize};

/// Username of the account anonymous submissions run under.
pub const PUBLIC_USERNAME: &str = "public";

/// A user as seen by the scheduler: identity and the admin flag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub admin: bool,
}

impl User {
    pub fn new(id: i64, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            admin: false,
        }
    }

    /// Mark the user as administrator.
    pub fn with_admin(mut self, admin: bool) -> Self {
        self.admin = admin;
        self
    }

    /// The shared account used for anonymous submissions.
    pub fn public(id: i64) -> Self {
        Self::new(id, PUBLIC_USERNAME)
    }

    pub fn is_public(&self) -> bool {
        self.username == PUBLIC_USERNAME
    }

    /// Owner-or-admin check.
    pub fn can_access(&self, owner: &User) -> bool {
        self.admin || self.id == owner.id
    }
}
