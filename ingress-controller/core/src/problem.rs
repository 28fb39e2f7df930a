use crate::KindedKey;
use std::fmt;

/// A diagnostic about a single resource, surfaced through status and events.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Problem {
    pub object: KindedKey,
    pub reason: Reason,
    pub message: String,
}

/// Event reasons. The string forms match the reasons written to resource status.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum Reason {
    AddedOrUpdated,
    AddedOrUpdatedWithWarning,
    AddedOrUpdatedWithError,
    Updated,
    UpdatedWithWarning,
    UpdatedWithError,
    Rejected,
    NoVirtualServersFound,
    NoIngressMasterFound,
    MissingSecret,
    Ignored,
}

// === impl Problem ===

impl Problem {
    pub fn new(object: KindedKey, reason: Reason, message: impl Into<String>) -> Self {
        Self {
            object,
            reason,
            message: message.into(),
        }
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.object, self.reason, self.message)
    }
}

// === impl Reason ===

impl Reason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AddedOrUpdated => "AddedOrUpdated",
            Self::AddedOrUpdatedWithWarning => "AddedOrUpdatedWithWarning",
            Self::AddedOrUpdatedWithError => "AddedOrUpdatedWithError",
            Self::Updated => "Updated",
            Self::UpdatedWithWarning => "UpdatedWithWarning",
            Self::UpdatedWithError => "UpdatedWithError",
            Self::Rejected => "Rejected",
            Self::NoVirtualServersFound => "NoVirtualServersFound",
            Self::NoIngressMasterFound => "NoIngressMasterFound",
            Self::MissingSecret => "Missing Secret",
            Self::Ignored => "Ignored",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
