//! Effective user tracking within a stage.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::snapshot::ROOT_USER;

/// The effective user operations run under.
///
/// Every stage starts as [`PrivilegeState::Root`]; only a `user` step moves
/// it, and only for the operations after it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum PrivilegeState {
    /// The superuser.
    #[default]
    Root,
    /// A non-privileged account (name or `uid[:gid]`).
    User(String),
}

impl PrivilegeState {
    /// State for a `user` step argument (`user[:group]`).
    ///
    /// Only the user part decides privilege, so `0:1000` and `root:root` are
    /// both root.
    pub fn for_user(name: impl Into<String>) -> Self {
        let name = name.into();
        let user = name.split_once(':').map_or(name.as_str(), |(user, _)| user);
        if user == ROOT_USER || user == "0" {
            PrivilegeState::Root
        } else {
            PrivilegeState::User(name)
        }
    }

    /// Whether `name` is a numeric `uid[:gid]`, which needs no account.
    #[must_use]
    pub fn is_numeric(name: &str) -> bool {
        name.split(':')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
    }

    /// Whether privileged operations are allowed.
    #[must_use]
    pub fn is_root(&self) -> bool {
        matches!(self, PrivilegeState::Root)
    }

    /// Account name (or numeric id) of the effective user.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            PrivilegeState::Root => ROOT_USER,
            PrivilegeState::User(name) => name,
        }
    }
}

impl fmt::Display for PrivilegeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<String> for PrivilegeState {
    fn from(value: String) -> Self {
        Self::for_user(value)
    }
}

impl From<PrivilegeState> for String {
    fn from(state: PrivilegeState) -> Self {
        state.name().to_string()
    }
}
