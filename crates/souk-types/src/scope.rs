//! Data scopes a federated server may be granted.

use serde::{Deserialize, Serialize};

use crate::ParseLabelError;

/// A named category of marketplace data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Users,
    Postings,
    Chat,
    Geolocation,
    Attributes,
}

impl Scope {
    /// All scopes in canonical order.
    pub const ALL: [Scope; 5] = [
        Scope::Users,
        Scope::Postings,
        Scope::Chat,
        Scope::Geolocation,
        Scope::Attributes,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Postings => "postings",
            Self::Chat => "chat",
            Self::Geolocation => "geolocation",
            Self::Attributes => "attributes",
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Scope {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scope::ALL
            .into_iter()
            .find(|scope| scope.as_str() == s)
            .ok_or_else(|| ParseLabelError::new("scope", s))
    }
}

/// Independent scope grants for one federation link.
///
/// Missing fields deserialize as `false`: a peer only ever gets what was
/// explicitly granted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopePermissions {
    pub users: bool,
    pub postings: bool,
    pub chat: bool,
    pub geolocation: bool,
    pub attributes: bool,
}

impl ScopePermissions {
    /// Every scope granted.
    pub fn all() -> Self {
        Self {
            users: true,
            postings: true,
            chat: true,
            geolocation: true,
            attributes: true,
        }
    }

    pub fn allows(&self, scope: Scope) -> bool {
        match scope {
            Scope::Users => self.users,
            Scope::Postings => self.postings,
            Scope::Chat => self.chat,
            Scope::Geolocation => self.geolocation,
            Scope::Attributes => self.attributes,
        }
    }

    /// Scopes granted by both sets.
    pub fn intersect(&self, other: &ScopePermissions) -> ScopePermissions {
        ScopePermissions {
            users: self.users && other.users,
            postings: self.postings && other.postings,
            chat: self.chat && other.chat,
            geolocation: self.geolocation && other.geolocation,
            attributes: self.attributes && other.attributes,
        }
    }

    /// Returns the scopes this set grants that `current` does not.
    pub fn newly_granted(&self, current: &ScopePermissions) -> Vec<Scope> {
        Scope::ALL
            .into_iter()
            .filter(|scope| self.allows(*scope) && !current.allows(*scope))
            .collect()
    }

    /// Fixed-order rendering used inside signed payloads and agreement
    /// hashes, e.g. `users=1,postings=1,chat=0,geolocation=0,attributes=0`.
    pub fn canonical(&self) -> String {
        Scope::ALL
            .into_iter()
            .map(|scope| format!("{}={}", scope.as_str(), u8::from(self.allows(scope))))
            .collect::<Vec<_>>()
            .join(",")
    }
}
