//! Party identities and the deterministic room key for a dealer/technician pair.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ChatResult};

/// Joins the two emails of a room key. Emails may not contain it.
pub const ROOM_KEY_SEPARATOR: char = ':';

/// Trimmed email, or `InvalidIdentity` if it is empty or would make a room key ambiguous.
fn party_email(email: &str) -> ChatResult<&str> {
    let email = email.trim();
    if email.is_empty() || email.contains(ROOM_KEY_SEPARATOR) {
        return Err(ChatError::InvalidIdentity);
    }
    Ok(email)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    #[serde(alias = "dealer")]
    Dealer,
    #[serde(alias = "technician")]
    Technician,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Dealer => "DEALER",
            Role::Technician => "TECHNICIAN",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ChatError;

    fn from_str(s: &str) -> ChatResult<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEALER" => Ok(Role::Dealer),
            "TECHNICIAN" => Ok(Role::Technician),
            other => Err(ChatError::validation(format!(
                "user type must be DEALER or TECHNICIAN, got {other:?}"
            ))),
        }
    }
}

/// Who is on the other end of a connection, as established by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub email: String,
    #[serde(rename = "user_type")]
    pub role: Role,
}

impl Identity {
    pub fn new(email: impl AsRef<str>, role: Role) -> ChatResult<Self> {
        let email = party_email(email.as_ref())?;
        Ok(Self { email: email.to_owned(), role })
    }

    pub fn dealer(email: impl AsRef<str>) -> ChatResult<Self> {
        Self::new(email, Role::Dealer)
    }

    pub fn technician(email: impl AsRef<str>) -> ChatResult<Self> {
        Self::new(email, Role::Technician)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.email, self.role)
    }
}

/// Stable key of the room shared by one dealer and one technician.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomKey(String);

impl RoomKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn for_stored(key: String) -> Self {
        Self(key)
    }

    /// Key for a dealer/technician pair.
    pub fn for_pair(dealer_email: &str, technician_email: &str) -> ChatResult<Self> {
        room_key(
            &Identity { email: dealer_email.to_owned(), role: Role::Dealer },
            &Identity { email: technician_email.to_owned(), role: Role::Technician },
        )
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoomKey {
    type Err = ChatError;

    fn from_str(s: &str) -> ChatResult<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ChatError::validation("room id must not be empty"));
        }
        Ok(Self(s.to_owned()))
    }
}

/// Derives the room key for two parties. The dealer always comes first, so the
/// result does not depend on argument order. Two parties with the same role are
/// ordered by email to keep the function total.
pub fn room_key(a: &Identity, b: &Identity) -> ChatResult<RoomKey> {
    let (a_email, b_email) = (party_email(&a.email)?, party_email(&b.email)?);

    let (first, second) = match (a.role, b.role) {
        (Role::Dealer, Role::Technician) => (a_email, b_email),
        (Role::Technician, Role::Dealer) => (b_email, a_email),
        _ if a_email <= b_email => (a_email, b_email),
        _ => (b_email, a_email),
    };

    Ok(RoomKey(format!("{first}{ROOM_KEY_SEPARATOR}{second}")))
}
