//! Tier configuration
//!
//! Two hot-reloadable sources describe the tiers:
//!
//! - an identity map, one `<identity> <tier>` record per line
//! - a limits file with one table per dimension keyed by tier name
//!
//! Both are parsed into a [`ConfigSnapshot`] that the [`TierStore`] publishes
//! with a single atomic pointer swap. Requests load the snapshot once and
//! resolve tier and limits from that same snapshot, so a request can never
//! pair a mapping from one generation with limits from another.
//!
//! # Example
//!
//! ```rust
//! use s3gate::tiers::{parse_identity_map, LimitsFile, TierName, TierStore};
//!
//! let store = TierStore::in_memory(Some("test-".to_string()));
//! store.publish(
//!     parse_identity_map("AKIA-PREMIUM-1 premium\n", "inline").unwrap(),
//!     LimitsFile::from_yaml("requests_per_minute: { premium: 1000, default: 50 }").unwrap(),
//! );
//!
//! let (tier, limits) = store.resolve("AKIA-PREMIUM-1");
//! assert_eq!(tier, TierName::Premium);
//! assert_eq!(limits.requests_per_minute, 1000);
//! assert_eq!(store.resolve("AKIA-UNKNOWN").0, TierName::Default);
//! ```

pub mod source;
pub mod store;
pub mod types;

pub use source::{parse_identity_map, LimitsFile, TierSources};
pub use store::{ConfigSnapshot, Resolution, TierStore};
pub use types::{TierLimits, TierName, TierSource, TierTable, UnmappedPolicy};
