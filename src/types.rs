//! Opaque identifier newtypes shared across every component.
//!
//! Cross-references between components (artifact → cluster, cluster → peer)
//! are modeled as these identifiers plus a lookup through `StateStore` or
//! `FederationCache`, never as a direct reference into another component's
//! map (see the design notes on cyclic ownership).

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

opaque_id!(ClusterId);
opaque_id!(NodeId);
opaque_id!(StreamName);
opaque_id!(PlaybackId);
opaque_id!(TenantId);
opaque_id!(ArtifactHash);
opaque_id!(InstanceId);

/// Known media-server prefixes stripped before a raw stream key is treated
/// as a canonical `StreamName`.
const KNOWN_STREAM_PREFIXES: &[&str] = &["live+", "vod+"];

impl StreamName {
    /// Normalize a raw incoming stream key into a canonical `StreamName` by
    /// stripping one recognized prefix, if present. Unknown prefixes pass
    /// through unchanged: the media server is free to introduce new ones
    /// and this orchestrator's job is routing, not validation.
    pub fn normalize(raw: &str) -> Self {
        for prefix in KNOWN_STREAM_PREFIXES {
            if let Some(stripped) = raw.strip_prefix(prefix) {
                return StreamName(stripped.to_string());
            }
        }
        StreamName(raw.to_string())
    }

    pub fn is_live(raw: &str) -> bool {
        raw.starts_with("live+")
    }
}

/// Geographic coordinates used by the balancer's geo score and by edge
/// advertisements exchanged over the peer channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_known_prefix() {
        assert_eq!(StreamName::normalize("live+demo").as_str(), "demo");
        assert_eq!(StreamName::normalize("vod+clip1").as_str(), "clip1");
    }

    #[test]
    fn normalize_passes_through_unknown_prefix() {
        assert_eq!(StreamName::normalize("demo").as_str(), "demo");
    }

    #[test]
    fn display_matches_inner_string() {
        let id = NodeId::new("edge-1");
        assert_eq!(format!("{id}"), "edge-1");
    }
}
