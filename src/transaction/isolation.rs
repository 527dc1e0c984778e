//! Transaction isolation levels.
//!
//! The level is fixed when a transaction is created and inherited by every
//! scope that joins it. Scopes request a level; only `Unspecified` may join a
//! transaction running at a different one.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Reads may observe uncommitted writes of other transactions.
    ReadUncommitted,

    /// Each read sees the most recently committed data at the time of the read.
    ReadCommitted,

    /// Rows read once keep returning the same values for the transaction's lifetime.
    RepeatableRead,

    /// Full serializability. This is the level scopes request by default.
    #[default]
    Serializable,

    /// Reads see a consistent snapshot taken at transaction start.
    Snapshot,

    /// No preference: join whatever is ambient, create at `Serializable`.
    Unspecified,
}

impl IsolationLevel {
    /// Check whether a scope requesting `self` may join a transaction running at `ambient`.
    pub fn accepts(&self, ambient: IsolationLevel) -> bool {
        *self == IsolationLevel::Unspecified || *self == ambient
    }

    /// The level a newly created transaction runs at when this level is requested.
    pub fn resolve(self) -> IsolationLevel {
        match self {
            IsolationLevel::Unspecified => IsolationLevel::Serializable,
            level => level,
        }
    }

    /// Get a human-readable description of this isolation level.
    pub fn description(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "Reads may see uncommitted changes",
            IsolationLevel::ReadCommitted => "Each read sees the latest committed data",
            IsolationLevel::RepeatableRead => "Rows read once do not change underneath the reader",
            IsolationLevel::Serializable => "Transactions behave as if run one after another",
            IsolationLevel::Snapshot => {
                "All reads see a consistent snapshot from transaction start"
            }
            IsolationLevel::Unspecified => "Inherit the ambient transaction's level",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadUncommitted => write!(f, "READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => write!(f, "READ COMMITTED"),
            IsolationLevel::RepeatableRead => write!(f, "REPEATABLE READ"),
            IsolationLevel::Serializable => write!(f, "SERIALIZABLE"),
            IsolationLevel::Snapshot => write!(f, "SNAPSHOT"),
            IsolationLevel::Unspecified => write!(f, "UNSPECIFIED"),
        }
    }
}

/// Parse isolation level from string (SQL syntax).
impl std::str::FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "READ UNCOMMITTED" | "READ_UNCOMMITTED" | "READUNCOMMITTED" => {
                Ok(IsolationLevel::ReadUncommitted)
            }
            "READ COMMITTED" | "READ_COMMITTED" | "READCOMMITTED" => {
                Ok(IsolationLevel::ReadCommitted)
            }
            "REPEATABLE READ" | "REPEATABLE_READ" | "REPEATABLEREAD" => {
                Ok(IsolationLevel::RepeatableRead)
            }
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            "SNAPSHOT" => Ok(IsolationLevel::Snapshot),
            "UNSPECIFIED" | "" => Ok(IsolationLevel::Unspecified),
            _ => Err(format!("unknown isolation level: {}", s)),
        }
    }
}
