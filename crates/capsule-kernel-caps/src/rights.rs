//! Rights and resource types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A single right a capability may confer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Right {
    Read,
    Write,
    Execute,
    Delegate,
    Revoke,
}

impl Right {
    pub const ALL: [Right; 5] = [
        Right::Read,
        Right::Write,
        Right::Execute,
        Right::Delegate,
        Right::Revoke,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Right::Read => "read",
            Right::Write => "write",
            Right::Execute => "execute",
            Right::Delegate => "delegate",
            Right::Revoke => "revoke",
        }
    }
}

impl FromStr for Right {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read" => Ok(Right::Read),
            "write" => Ok(Right::Write),
            "execute" => Ok(Right::Execute),
            "delegate" => Ok(Right::Delegate),
            "revoke" => Ok(Right::Revoke),
            other => Err(format!("unknown right: {}", other)),
        }
    }
}

/// A set of rights, one flag per [`Right`].
///
/// Serialized as an object of booleans (`{"read": true, "write": true}`);
/// missing flags default to `false`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Rights {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub delegate: bool,
    pub revoke: bool,
}

impl Rights {
    /// No rights at all.
    pub const NONE: Rights = Rights {
        read: false,
        write: false,
        execute: false,
        delegate: false,
        revoke: false,
    };

    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::NONE
        }
    }

    pub fn write_only() -> Self {
        Self {
            write: true,
            ..Self::NONE
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Self::NONE
        }
    }

    pub fn execute_only() -> Self {
        Self {
            execute: true,
            ..Self::NONE
        }
    }

    /// Every right, including delegate and revoke.
    pub fn full() -> Self {
        Self {
            read: true,
            write: true,
            execute: true,
            delegate: true,
            revoke: true,
        }
    }

    pub fn has(&self, right: Right) -> bool {
        match right {
            Right::Read => self.read,
            Right::Write => self.write,
            Right::Execute => self.execute,
            Right::Delegate => self.delegate,
            Right::Revoke => self.revoke,
        }
    }

    /// Return a copy with `right` set.
    pub fn with(mut self, right: Right) -> Self {
        match right {
            Right::Read => self.read = true,
            Right::Write => self.write = true,
            Right::Execute => self.execute = true,
            Right::Delegate => self.delegate = true,
            Right::Revoke => self.revoke = true,
        }
        self
    }

    pub fn is_subset_of(&self, other: &Rights) -> bool {
        Right::ALL.iter().all(|r| !self.has(*r) || other.has(*r))
    }

    pub fn union(&self, other: &Rights) -> Rights {
        Right::ALL
            .iter()
            .filter(|r| self.has(**r) || other.has(**r))
            .fold(Rights::NONE, |acc, r| acc.with(*r))
    }

    /// Rights in `self` that `other` lacks.
    pub fn missing_from(&self, other: &Rights) -> Rights {
        Right::ALL
            .iter()
            .filter(|r| self.has(**r) && !other.has(**r))
            .fold(Rights::NONE, |acc, r| acc.with(*r))
    }

    pub fn is_empty(&self) -> bool {
        *self == Rights::NONE
    }

    pub fn iter(&self) -> impl Iterator<Item = Right> + '_ {
        Right::ALL.into_iter().filter(move |r| self.has(*r))
    }

    /// Parse a comma-separated list such as `"read,write"`.
    pub fn parse(s: &str) -> Result<Self, String> {
        s.split(',')
            .filter(|p| !p.trim().is_empty())
            .try_fold(Rights::NONE, |acc, p| Ok(acc.with(p.parse::<Right>()?)))
    }
}

impl fmt::Display for Rights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let names: Vec<&str> = self.iter().map(|r| r.as_str()).collect();
        write!(f, "{}", names.join(","))
    }
}

/// The kind of resource a capability guards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// A named message channel (`accrual.*`).
    Channel,
    /// A module's inbound mailbox.
    Mailbox,
    /// Kernel key/value storage.
    Storage,
    /// Outbound network access.
    Network,
    /// The kernel clock.
    Clock,
    /// The kernel audit log.
    AuditLog,
    /// Module lifecycle operations.
    Module,
    Custom(String),
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Channel => write!(f, "channel"),
            ResourceType::Mailbox => write!(f, "mailbox"),
            ResourceType::Storage => write!(f, "storage"),
            ResourceType::Network => write!(f, "network"),
            ResourceType::Clock => write!(f, "clock"),
            ResourceType::AuditLog => write!(f, "audit_log"),
            ResourceType::Module => write!(f, "module"),
            ResourceType::Custom(name) => write!(f, "custom:{}", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subset() {
        assert!(Rights::read_only().is_subset_of(&Rights::read_write()));
        assert!(!Rights::read_write().is_subset_of(&Rights::read_only()));
        assert!(Rights::NONE.is_subset_of(&Rights::NONE));
    }

    #[test]
    fn test_missing_from() {
        let missing = Rights::full().missing_from(&Rights::read_write());
        assert_eq!(missing.to_string(), "execute,delegate,revoke");
    }

    #[test]
    fn test_parse_and_display() {
        let rights = Rights::parse("read, write").unwrap();
        assert_eq!(rights, Rights::read_write());
        assert_eq!(rights.to_string(), "read,write");
        assert!(Rights::parse("read,fly").is_err());
    }

    #[test]
    fn test_json_shape() {
        let rights: Rights = serde_json::from_str(r#"{"read": true, "write": true}"#).unwrap();
        assert_eq!(rights, Rights::read_write());
        let rt: ResourceType = serde_json::from_str(r#""audit_log""#).unwrap();
        assert_eq!(rt, ResourceType::AuditLog);
    }
}
