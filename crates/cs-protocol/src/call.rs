//! Remote call identifier type

use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-channel sequence number matching a response to its call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub u32);

impl CallId {
    /// Create a new call ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Reserved ID carried by fire-and-forget notifications
    pub const NOTIFY: CallId = CallId(0);
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

impl From<u32> for CallId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id_display() {
        let id = CallId::new(42);
        assert_eq!(format!("{}", id), "call-42");
    }

    #[test]
    fn test_notify_id_is_zero() {
        assert_eq!(CallId::NOTIFY.as_u32(), 0);
        assert_ne!(CallId::from(1), CallId::NOTIFY);
    }
}
