//! Scope construction options.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transaction::IsolationLevel;

/// How a scope relates to the ambient transaction it finds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeMode {
    /// Join the ambient transaction, or create one if there is none.
    #[default]
    Required,
    /// Always create a new transaction, shadowing the ambient one.
    RequiresNew,
    /// Hide the ambient transaction for the scope's extent.
    Suppress,
    /// Join the ambient transaction; fail if there is none.
    Mandatory,
}

impl fmt::Display for ScopeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeMode::Required => write!(f, "REQUIRED"),
            ScopeMode::RequiresNew => write!(f, "REQUIRES NEW"),
            ScopeMode::Suppress => write!(f, "SUPPRESS"),
            ScopeMode::Mandatory => write!(f, "MANDATORY"),
        }
    }
}

impl std::str::FromStr for ScopeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "REQUIRED" => Ok(ScopeMode::Required),
            "REQUIRES NEW" | "REQUIRES_NEW" | "REQUIRESNEW" => Ok(ScopeMode::RequiresNew),
            "SUPPRESS" => Ok(ScopeMode::Suppress),
            "MANDATORY" => Ok(ScopeMode::Mandatory),
            _ => Err(format!("unknown scope mode: {}", s)),
        }
    }
}

/// Options a scope is constructed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeOptions {
    /// Join/create/suppress decision.
    pub mode: ScopeMode,
    /// Requested isolation level.
    pub isolation: IsolationLevel,
    /// Keep the ambient transaction across suspension points.
    pub async_flow: bool,
    /// Abort an owned transaction still unresolved after this long.
    pub timeout: Option<Duration>,
}

impl Default for ScopeOptions {
    fn default() -> Self {
        Self {
            mode: ScopeMode::Required,
            isolation: IsolationLevel::Serializable,
            async_flow: false,
            timeout: None,
        }
    }
}

impl ScopeOptions {
    /// Create options for the given mode with everything else defaulted.
    pub fn new(mode: ScopeMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    /// Set the requested isolation level.
    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = level;
        self
    }

    /// Set the async flow flag.
    pub fn async_flow(mut self, value: bool) -> Self {
        self.async_flow = value;
        self
    }

    /// Set the timeout for an owned transaction.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
