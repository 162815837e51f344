use super::types::{TierLimits, TierName, TierTable, UnmappedPolicy};
use crate::error::{GatewayError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Parse a line-oriented `<identity> <tier>` map.
///
/// Blank lines and lines starting with `#` are skipped. Any other malformed
/// line fails the whole parse.
pub fn parse_identity_map(content: &str, source_name: &str) -> Result<HashMap<String, TierName>> {
    let mut identities = HashMap::new();

    for (index, raw) in content.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split_whitespace();
        let (identity, tier) = match (fields.next(), fields.next(), fields.next()) {
            (Some(identity), Some(tier), None) => (identity, tier),
            _ => {
                return Err(GatewayError::parse(
                    source_name,
                    line_no,
                    "expected '<identity> <tier>'",
                ))
            }
        };

        let tier = tier
            .parse::<TierName>()
            .map_err(|e| GatewayError::parse(source_name, line_no, e.to_string()))?;

        if identities.insert(identity.to_string(), tier).is_some() {
            debug!(identity, line = line_no, "Duplicate identity, later entry wins");
        }
    }

    Ok(identities)
}

/// Per-dimension limit tables keyed by tier name
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsFile {
    #[serde(default)]
    pub requests_per_minute: HashMap<TierName, u32>,
    #[serde(default)]
    pub requests_per_second: HashMap<TierName, u32>,
    #[serde(default)]
    pub bytes_in_per_minute: HashMap<TierName, u64>,
    #[serde(default)]
    pub bytes_out_per_minute: HashMap<TierName, u64>,
    #[serde(default)]
    pub messages: HashMap<TierName, String>,
    /// Tiers that also limit the anonymous identity
    #[serde(default)]
    pub limit_anonymous: Vec<TierName>,
    #[serde(default)]
    pub unmapped_policy: UnmappedPolicy,
}

/// Tier row, then the table's `default` row, then the built-in value
fn pick<T: Clone>(table: &HashMap<TierName, T>, tier: TierName, builtin: T) -> T {
    table
        .get(&tier)
        .or_else(|| table.get(&TierName::Default))
        .cloned()
        .unwrap_or(builtin)
}

impl LimitsFile {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatewayError::Config(format!("Failed to parse limits: {}", e)))
    }

    /// Resolve every tier to a complete row
    pub fn into_table(self) -> TierTable {
        let builtin = TierLimits::builtin();

        TierTable::from_fn(|tier| TierLimits {
            requests_per_minute: pick(
                &self.requests_per_minute,
                tier,
                builtin.requests_per_minute,
            ),
            requests_per_second: pick(
                &self.requests_per_second,
                tier,
                builtin.requests_per_second,
            ),
            bytes_in_per_minute: pick(
                &self.bytes_in_per_minute,
                tier,
                builtin.bytes_in_per_minute,
            ),
            bytes_out_per_minute: pick(
                &self.bytes_out_per_minute,
                tier,
                builtin.bytes_out_per_minute,
            ),
            message: pick(&self.messages, tier, builtin.message.clone()),
            limit_anonymous: self.limit_anonymous.contains(&tier),
        })
    }
}

/// Files backing the tier configuration
#[derive(Debug, Clone)]
pub struct TierSources {
    pub mapping_path: PathBuf,
    pub limits_path: PathBuf,
}

impl TierSources {
    pub fn new(mapping_path: impl Into<PathBuf>, limits_path: impl Into<PathBuf>) -> Self {
        Self {
            mapping_path: mapping_path.into(),
            limits_path: limits_path.into(),
        }
    }

    /// Read and parse both sources
    pub fn read(&self) -> Result<(HashMap<String, TierName>, LimitsFile)> {
        let mapping = read_source(&self.mapping_path)?;
        let identities = parse_identity_map(&mapping, &display_name(&self.mapping_path))?;

        let limits = read_source(&self.limits_path)?;
        let limits = LimitsFile::from_yaml(&limits)?;

        Ok((identities, limits))
    }

    pub fn paths(&self) -> [&Path; 2] {
        [&self.mapping_path, &self.limits_path]
    }
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        GatewayError::Config(format!("Failed to read {}: {}", path.display(), e))
    })
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_identity_map() {
        let content = r#"
# premium customers
AKIA-PREMIUM-1 premium
AKIA-STANDARD-1   standard

AKIA-BASIC-1 basic
"#;
        let map = parse_identity_map(content, "identities.map").unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map["AKIA-PREMIUM-1"], TierName::Premium);
        assert_eq!(map["AKIA-STANDARD-1"], TierName::Standard);
    }

    #[test]
    fn test_parse_identity_map_rejects_unknown_tier() {
        let err = parse_identity_map("AKIA1 premium\nAKIA2 gold\n", "identities.map").unwrap_err();
        match err {
            GatewayError::ConfigParse { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_tier_casing_matches_limits_file() {
        assert!(parse_identity_map("AKIA1 Premium\n", "identities.map").is_err());
        assert!(LimitsFile::from_yaml("requests_per_minute: { Premium: 10 }\n").is_err());
    }

    #[test]
    fn test_parse_identity_map_rejects_extra_fields() {
        assert!(parse_identity_map("AKIA1 premium extra\n", "identities.map").is_err());
        assert!(parse_identity_map("AKIA1\n", "identities.map").is_err());
    }

    #[test]
    fn test_duplicate_identity_last_wins() {
        let map = parse_identity_map("K basic\nK premium\n", "identities.map").unwrap();
        assert_eq!(map["K"], TierName::Premium);
    }

    #[test]
    fn test_limits_fallback_rows() {
        let yaml = r#"
requests_per_minute: { premium: 1000, default: 50 }
requests_per_second: { premium: 50 }
messages: { default: "Slow down" }
limit_anonymous: [default]
unmapped_policy: exempt
"#;
        let file = LimitsFile::from_yaml(yaml).unwrap();
        assert_eq!(file.unmapped_policy, UnmappedPolicy::Exempt);
        let table = file.into_table();

        let premium = table.get(TierName::Premium);
        assert_eq!(premium.requests_per_minute, 1000);
        assert_eq!(premium.requests_per_second, 50);
        assert_eq!(premium.message, "Slow down");
        assert!(!premium.limit_anonymous);

        // Table default row
        let basic = table.get(TierName::Basic);
        assert_eq!(basic.requests_per_minute, 50);
        // Built-in row
        assert_eq!(basic.requests_per_second, TierLimits::builtin().requests_per_second);

        assert!(table.get(TierName::Default).limit_anonymous);
    }

    #[test]
    fn test_limits_reject_unknown_keys() {
        assert!(LimitsFile::from_yaml("requests_per_hour: { default: 1 }").is_err());
        assert!(LimitsFile::from_yaml("requests_per_minute: { gold: 1 }").is_err());
        assert!(LimitsFile::from_yaml("requests_per_minute: { default: -1 }").is_err());
    }
}
