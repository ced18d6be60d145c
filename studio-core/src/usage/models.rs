use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provider::ProviderKey;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UsageStatus {
    #[default]
    Active,
    QuotaExceeded,
    Error,
    Disabled,
}

impl UsageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageStatus::Active => "active",
            UsageStatus::QuotaExceeded => "quota_exceeded",
            UsageStatus::Error => "error",
            UsageStatus::Disabled => "disabled",
        }
    }

    /// Statuses that take a pair out of rotation for the rest of the day.
    pub fn blocks_requests(&self) -> bool {
        matches!(self, UsageStatus::QuotaExceeded | UsageStatus::Disabled)
    }
}

impl fmt::Display for UsageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UsageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(UsageStatus::Active),
            "quota_exceeded" => Ok(UsageStatus::QuotaExceeded),
            "error" => Ok(UsageStatus::Error),
            "disabled" => Ok(UsageStatus::Disabled),
            other => Err(format!("unknown usage status: {other}")),
        }
    }
}

pub fn mentions_quota(error: &str) -> bool {
    error.to_lowercase().contains("quota")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageRecord {
    pub provider: String,
    pub config_name: String,
    #[serde(default)]
    pub requests_today: u64,
    #[serde(default)]
    pub total_cost_today: f64,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub status: UsageStatus,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
}

impl UsageRecord {
    pub fn new(key: &ProviderKey) -> Self {
        Self {
            provider: key.provider.clone(),
            config_name: key.config_name.clone(),
            requests_today: 0,
            total_cost_today: 0.0,
            last_error: None,
            status: UsageStatus::Active,
            last_used: None,
        }
    }

    pub fn key(&self) -> ProviderKey {
        ProviderKey::new(&self.provider, &self.config_name)
    }

    pub fn record_success(&mut self, cost: f64, at: DateTime<Utc>) {
        self.bump(cost, at);
        self.status = UsageStatus::Active;
        self.last_error = None;
    }

    pub fn record_failure(&mut self, cost: f64, error: &str, at: DateTime<Utc>) {
        self.bump(cost, at);
        self.status = if mentions_quota(error) {
            UsageStatus::QuotaExceeded
        } else {
            UsageStatus::Error
        };
        self.last_error = Some(error.to_string());
    }

    /// Zero-valued copy for a new day. Disabled pairs stay disabled.
    pub fn rolled_over(&self) -> Self {
        let mut fresh = Self::new(&self.key());
        if self.status == UsageStatus::Disabled {
            fresh.status = UsageStatus::Disabled;
        }
        fresh
    }

    fn bump(&mut self, cost: f64, at: DateTime<Utc>) {
        self.requests_today += 1;
        self.total_cost_today += cost;
        self.last_used = Some(at);
    }
}
