use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a redirect. `Tombstoned` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedirectState {
    Active,
    Tombstoned,
}

impl RedirectState {
    pub fn is_active(self) -> bool {
        matches!(self, RedirectState::Active)
    }
}

/// A stored mapping from a short code to the original URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    pub id: Uuid,
    pub original_url: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: RedirectState,
}

impl Redirect {
    /// Build a fresh active record stamped with the current time.
    ///
    /// Timestamps carry millisecond precision, matching what every backend stores.
    pub fn new(
        original_url: impl Into<String>,
        code: impl Into<String>,
        owner_id: Option<&str>,
    ) -> Self {
        let now = Utc::now().trunc_subsecs(3);
        Self {
            id: Uuid::now_v7(),
            original_url: original_url.into(),
            code: code.into(),
            owner_id: owner_id.map(str::to_owned),
            created_at: now,
            updated_at: now,
            state: RedirectState::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_owned_by(&self, owner_id: &str) -> bool {
        self.owner_id.as_deref() == Some(owner_id)
    }

    /// Mark the record deleted. Returns `false` if it already was.
    pub fn tombstone(&mut self, at: DateTime<Utc>) -> bool {
        if !self.is_active() {
            return false;
        }
        self.state = RedirectState::Tombstoned;
        self.updated_at = at;
        true
    }
}

/// One entry of a batch create request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub correlation_id: String,
    pub original_url: String,
}
