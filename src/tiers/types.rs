use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Service tier label
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TierName {
    Premium,
    Standard,
    Basic,
    /// Unknown identities and the anonymous caller land here
    Default,
}

impl TierName {
    pub const ALL: [TierName; 4] = [
        TierName::Premium,
        TierName::Standard,
        TierName::Basic,
        TierName::Default,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TierName::Premium => "premium",
            TierName::Standard => "standard",
            TierName::Basic => "basic",
            TierName::Default => "default",
        }
    }
}

impl fmt::Display for TierName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TierName {
    type Err = GatewayError;

    /// Tier labels are lowercase, the same spelling `limits.yaml` keys use
    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "premium" => Ok(TierName::Premium),
            "standard" => Ok(TierName::Standard),
            "basic" => Ok(TierName::Basic),
            "default" => Ok(TierName::Default),
            other => Err(GatewayError::Config(format!("unknown tier '{}'", other))),
        }
    }
}

/// Limit parameters of one tier, immutable once published
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierLimits {
    pub requests_per_minute: u32,
    pub requests_per_second: u32,
    pub bytes_in_per_minute: u64,
    pub bytes_out_per_minute: u64,
    /// Tier-specific lead-in of the rejection message
    pub message: String,
    /// Whether the anonymous identity is limited when it resolves to this tier
    pub limit_anonymous: bool,
}

impl TierLimits {
    /// Built-in row used when a limits table has neither the tier nor a `default` entry
    pub fn builtin() -> Self {
        Self {
            requests_per_minute: 50,
            requests_per_second: 5,
            bytes_in_per_minute: 100 * 1024 * 1024,
            bytes_out_per_minute: 200 * 1024 * 1024,
            message: "Rate limit exceeded".to_string(),
            limit_anonymous: false,
        }
    }
}

/// One complete row per tier, indexed by [`TierName`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierTable([TierLimits; 4]);

impl TierTable {
    pub fn from_fn(f: impl FnMut(TierName) -> TierLimits) -> Self {
        Self(TierName::ALL.map(f))
    }

    pub fn get(&self, tier: TierName) -> &TierLimits {
        &self.0[tier as usize]
    }
}

/// Whether identities that fall back to the `default` tier are limited at all
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UnmappedPolicy {
    /// Fallback identities are limited with the `default` row
    #[default]
    Enforce,
    /// Fallback identities are always admitted
    Exempt,
}

/// How an identity got its tier
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TierSource {
    /// Listed in the identity map
    Mapped,
    /// Matched the test identity prefix
    TestPrefix,
    /// Not listed, resolved to `default`
    Fallback,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_name_parse() {
        assert_eq!("premium".parse::<TierName>().unwrap(), TierName::Premium);
        assert_eq!(" basic ".parse::<TierName>().unwrap(), TierName::Basic);
        assert!("Premium".parse::<TierName>().is_err());
        assert!("gold".parse::<TierName>().is_err());
    }

    #[test]
    fn test_tier_name_serde() {
        let tier: TierName = serde_yaml::from_str("standard").unwrap();
        assert_eq!(tier, TierName::Standard);
        assert_eq!(serde_json::to_string(&TierName::Default).unwrap(), "\"default\"");
    }

    #[test]
    fn test_tier_table_indexing() {
        let table = TierTable::from_fn(|tier| TierLimits {
            message: tier.to_string(),
            ..TierLimits::builtin()
        });
        for tier in TierName::ALL {
            assert_eq!(table.get(tier).message, tier.as_str());
        }
    }

    #[test]
    fn test_unmapped_policy_default() {
        assert_eq!(UnmappedPolicy::default(), UnmappedPolicy::Enforce);
    }
}
