//! Operator identity: who is calling, and the credentials that prove it.

pub mod backup_codes;
pub mod otp;
pub mod secret_box;
pub mod token;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use backup_codes::BackupCodes;
pub use secret_box::{SecretBox, SecretError};
pub use token::{Purpose, TokenError, TokenService};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Unauthenticated,
    Technician,
    Admin,
    Superadmin,
}

impl Role {
    /// Admins see every endpoint.
    pub fn is_admin(self) -> bool {
        matches!(self, Role::Admin | Role::Superadmin)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Unauthenticated => "unauthenticated",
            Role::Technician => "technician",
            Role::Admin => "admin",
            Role::Superadmin => "superadmin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unauthenticated" => Ok(Role::Unauthenticated),
            "technician" => Ok(Role::Technician),
            "admin" => Ok(Role::Admin),
            "superadmin" => Ok(Role::Superadmin),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// An authenticated operator, as carried through request extensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub display_name: String,
    pub role: Role,
}

impl Principal {
    /// Identity given to unauthenticated loopback requests when the
    /// development exemption is enabled.
    pub fn local_superadmin() -> Self {
        Self {
            id: "local".into(),
            display_name: "Local administrator".into(),
            role: Role::Superadmin,
        }
    }
}
