//! Client-side mutation policy
//!
//! The server still enforces permissions; this only stops a read-only session
//! from sending mutating requests at all.

use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Deserialize;

/// Decides whether the current session may issue mutating requests.
pub trait AccessPolicy: Send + Sync {
    fn allows_mutation(&self) -> bool;
}

/// Every request is allowed.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unrestricted;

impl AccessPolicy for Unrestricted {
    fn allows_mutation(&self) -> bool {
        true
    }
}

/// Dashboard role of the signed-in user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Editor,
    Admin,
}

impl Role {
    pub fn is_read_only(self) -> bool {
        matches!(self, Role::Viewer)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Role::Viewer,
            1 => Role::Editor,
            _ => Role::Admin,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Role::Viewer => 0,
            Role::Editor => 1,
            Role::Admin => 2,
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "viewer" => Ok(Role::Viewer),
            "editor" => Ok(Role::Editor),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Policy following a role that can change when the user switches account.
#[derive(Debug)]
pub struct RolePolicy {
    role: AtomicU8,
}

impl RolePolicy {
    pub fn new(role: Role) -> Self {
        Self {
            role: AtomicU8::new(role.as_u8()),
        }
    }

    pub fn role(&self) -> Role {
        Role::from_u8(self.role.load(Ordering::Acquire))
    }

    pub fn set_role(&self, role: Role) {
        self.role.store(role.as_u8(), Ordering::Release);
    }
}

impl AccessPolicy for RolePolicy {
    fn allows_mutation(&self) -> bool {
        !self.role().is_read_only()
    }
}
