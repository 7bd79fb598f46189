//! The authenticated user profile returned by `GET /rest/v2/user`.

use serde::{Deserialize, Serialize};

/// Account state as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum UserStatus {
    ConfirmationPending = 1,
    Active = 2,
    Deactivated = 3,
}

impl TryFrom<u8> for UserStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::ConfirmationPending),
            2 => Ok(Self::Active),
            3 => Ok(Self::Deactivated),
            other => Err(format!("unknown user status {other}")),
        }
    }
}

impl From<UserStatus> for u8 {
    fn from(status: UserStatus) -> Self {
        status as u8
    }
}

impl UserStatus {
    /// Label used in tables and badges.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::ConfirmationPending => "confirmation pending",
            Self::Active => "active",
            Self::Deactivated => "deactivated",
        }
    }
}

/// Profile of the user a bearer token belongs to. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub email: String,
    pub confirmation: i64,
    pub status: UserStatus,
}
