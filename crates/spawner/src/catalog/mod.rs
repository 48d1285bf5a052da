//! Image catalog: tag classification, snapshots, and resolution
//!
//! The catalog service (queried by [`client::CatalogClient`]) advertises
//! which lab images exist. Resolution is a pure function over the cached
//! snapshot: it never performs network I/O during a spawn.

pub mod client;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SpawnError;

pub use client::CatalogClient;

const FIELD_DELIMITER: char = '|';

/// Image classification derived from the tag naming convention
///
/// Tags follow the `r_<major>_<minor>` (release), `w_<year>_<week>`
/// (weekly), `d_<year>_<month>_<day>` (daily) convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageClass {
    Release,
    Weekly,
    Daily,
    Unknown,
}

impl ImageClass {
    /// Classify a tag by its prefix
    pub fn from_tag(tag: &str) -> Self {
        match tag.split('_').next() {
            Some("r") => Self::Release,
            Some("w") => Self::Weekly,
            Some("d") => Self::Daily,
            _ => Self::Unknown,
        }
    }
}

/// Numeric ordering key parsed out of a tag
///
/// `w_2024_10` sorts below `w_2024_11` regardless of catalog listing
/// order; non-numeric components make a tag unorderable (key `None`).
fn tag_sort_key(tag: &str) -> Option<Vec<u64>> {
    let parts: Vec<&str> = tag.split('_').collect();
    if parts.len() < 2 {
        return None;
    }
    parts[1..].iter().map(|p| p.parse::<u64>().ok()).collect()
}

/// One image the catalog knows about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReference {
    /// Full docker reference, e.g. "registry.example.com/lab:w_2024_10"
    pub reference: String,
    /// The tag portion of the reference
    pub tag: String,
    /// Layer digest, empty string when unknown
    #[serde(default)]
    pub digest: String,
    /// Human-readable description, e.g. "Weekly 10"
    pub display_name: String,
    /// Classification derived from the tag
    pub class: ImageClass,
    /// Whether the catalog flags this entry as the recommended default
    #[serde(default)]
    pub recommended: bool,
}

impl ImageReference {
    /// The packed form used to round-trip a selection through the hub's
    /// options form: `reference|display_name|digest`.
    pub fn packed_string(&self) -> String {
        format!(
            "{}{FIELD_DELIMITER}{}{FIELD_DELIMITER}{}",
            self.reference, self.display_name, self.digest
        )
    }

    /// Parse the packed `reference|display_name|digest` form
    pub fn from_packed_string(packed: &str) -> Result<Self, SpawnError> {
        let fields: Vec<&str> = packed.split(FIELD_DELIMITER).collect();
        if fields.len() != 3 {
            return Err(SpawnError::InvalidProfile(format!(
                "packed image string '{packed}' must have 3 '|'-separated fields"
            )));
        }
        let tag = tag_of(fields[0]);
        Ok(Self {
            reference: fields[0].to_string(),
            class: ImageClass::from_tag(&tag),
            tag,
            digest: fields[2].to_string(),
            display_name: fields[1].to_string(),
            recommended: false,
        })
    }
}

/// Extract the tag from a docker reference, defaulting to "latest"
pub(crate) fn tag_of(reference: &str) -> String {
    // The tag separator is the last ':' after the final '/', so a
    // registry port does not get mistaken for a tag.
    let after_slash = reference.rsplit('/').next().unwrap_or(reference);
    after_slash
        .rsplit_once(':')
        .map_or_else(|| "latest".to_string(), |(_, tag)| tag.to_string())
}

/// What the user asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSelection {
    /// An explicit tag, e.g. "w_2024_10"
    Tag(String),
    /// The entry the catalog flags as recommended
    Recommended,
    /// Highest-versioned weekly by tag ordering
    LatestWeekly,
    /// Highest-versioned release by tag ordering
    LatestRelease,
    /// Sticky re-spawn with the image a previous session used
    Previous(ImageReference),
}

/// A point-in-time view of the catalog
///
/// `cached` images are pre-pulled on cluster nodes and start fast;
/// `all` is the full list including uncached tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub cached: Vec<ImageReference>,
    pub all: Vec<ImageReference>,
    pub fetched_at: DateTime<Utc>,
}

impl CatalogSnapshot {
    pub fn new(cached: Vec<ImageReference>, all: Vec<ImageReference>) -> Self {
        Self {
            cached,
            all,
            fetched_at: Utc::now(),
        }
    }

    /// Resolve a selection against this snapshot
    ///
    /// Deterministic: the same selection against the same snapshot always
    /// yields the same reference. Cached entries are preferred; explicit
    /// tags fall back to the full list (slower start, still valid).
    pub fn resolve(&self, selection: &ImageSelection) -> Result<ImageReference, SpawnError> {
        match selection {
            ImageSelection::Tag(tag) => self
                .find_tag(tag)
                .cloned()
                .ok_or_else(|| SpawnError::ImageNotFound(tag.clone())),
            ImageSelection::Recommended => self
                .iter_preferred()
                .find(|image| image.recommended)
                .cloned()
                .ok_or_else(|| SpawnError::ImageNotFound("recommended".to_string())),
            ImageSelection::LatestWeekly => self
                .latest_of(ImageClass::Weekly)
                .ok_or_else(|| SpawnError::ImageNotFound("latest-weekly".to_string())),
            ImageSelection::LatestRelease => self
                .latest_of(ImageClass::Release)
                .ok_or_else(|| SpawnError::ImageNotFound("latest-release".to_string())),
            // A previous image stays valid even after the catalog rotates
            // it out; prefer the catalog copy when present so the digest
            // is current.
            ImageSelection::Previous(image) => {
                Ok(self.find_tag(&image.tag).cloned().unwrap_or_else(|| image.clone()))
            }
        }
    }

    fn find_tag(&self, tag: &str) -> Option<&ImageReference> {
        self.iter_preferred().find(|image| image.tag == tag)
    }

    /// Cached entries first, then the rest of the full list
    fn iter_preferred(&self) -> impl Iterator<Item = &ImageReference> {
        self.cached.iter().chain(&self.all)
    }

    fn latest_of(&self, class: ImageClass) -> Option<ImageReference> {
        self.iter_preferred()
            .filter(|image| image.class == class)
            .filter_map(|image| tag_sort_key(&image.tag).map(|key| (key, image)))
            .max_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, image)| image.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(tag: &str, recommended: bool) -> ImageReference {
        ImageReference {
            reference: format!("registry.example.com/lab:{tag}"),
            tag: tag.to_string(),
            digest: String::new(),
            display_name: tag.to_string(),
            class: ImageClass::from_tag(tag),
            recommended,
        }
    }

    #[test]
    fn test_class_from_tag() {
        assert_eq!(ImageClass::from_tag("r_2024_1"), ImageClass::Release);
        assert_eq!(ImageClass::from_tag("w_2024_10"), ImageClass::Weekly);
        assert_eq!(ImageClass::from_tag("d_2024_05_01"), ImageClass::Daily);
        assert_eq!(ImageClass::from_tag("latest"), ImageClass::Unknown);
    }

    #[test]
    fn test_resolve_recommended() {
        // The worked example: recommended wins over the weekly even
        // though the weekly is listed first.
        let snapshot = CatalogSnapshot::new(
            vec![image("w_2024_10", false), image("r_2024_1", true)],
            vec![],
        );
        let resolved = snapshot.resolve(&ImageSelection::Recommended).unwrap();
        assert_eq!(resolved.tag, "r_2024_1");
    }

    #[test]
    fn test_resolve_latest_weekly_by_version_not_listing_order() {
        let snapshot = CatalogSnapshot::new(
            vec![
                image("w_2024_9", false),
                image("w_2024_11", false),
                image("w_2024_10", false),
            ],
            vec![],
        );
        let resolved = snapshot.resolve(&ImageSelection::LatestWeekly).unwrap();
        assert_eq!(resolved.tag, "w_2024_11");
    }

    #[test]
    fn test_resolve_latest_weekly_crosses_years() {
        let snapshot = CatalogSnapshot::new(
            vec![image("w_2024_52", false), image("w_2025_1", false)],
            vec![],
        );
        let resolved = snapshot.resolve(&ImageSelection::LatestWeekly).unwrap();
        assert_eq!(resolved.tag, "w_2025_1");
    }

    #[test]
    fn test_resolve_explicit_tag_falls_back_to_all() {
        let snapshot = CatalogSnapshot::new(
            vec![image("w_2024_10", false)],
            vec![image("d_2024_05_01", false)],
        );
        let resolved = snapshot
            .resolve(&ImageSelection::Tag("d_2024_05_01".to_string()))
            .unwrap();
        assert_eq!(resolved.class, ImageClass::Daily);
    }

    #[test]
    fn test_resolve_missing_tag() {
        let snapshot = CatalogSnapshot::new(vec![image("w_2024_10", false)], vec![]);
        let err = snapshot
            .resolve(&ImageSelection::Tag("w_1999_1".to_string()))
            .unwrap_err();
        assert!(matches!(err, SpawnError::ImageNotFound(_)));
    }

    #[test]
    fn test_resolve_previous_survives_catalog_rotation() {
        let snapshot = CatalogSnapshot::new(vec![image("w_2024_10", false)], vec![]);
        let old = image("w_2023_1", false);
        let resolved = snapshot
            .resolve(&ImageSelection::Previous(old.clone()))
            .unwrap();
        assert_eq!(resolved, old);
    }

    #[test]
    fn test_packed_string_round_trip() {
        let mut original = image("w_2024_10", false);
        original.digest = "sha256:abcd".to_string();
        let packed = original.packed_string();
        assert_eq!(
            packed,
            "registry.example.com/lab:w_2024_10|w_2024_10|sha256:abcd"
        );
        let parsed = ImageReference::from_packed_string(&packed).unwrap();
        assert_eq!(parsed.reference, original.reference);
        assert_eq!(parsed.tag, "w_2024_10");
        assert_eq!(parsed.class, ImageClass::Weekly);
    }

    #[test]
    fn test_packed_string_wrong_field_count() {
        assert!(ImageReference::from_packed_string("just-a-ref").is_err());
    }

    #[test]
    fn test_tag_of_handles_registry_port() {
        assert_eq!(tag_of("registry:5000/lab:w_2024_10"), "w_2024_10");
        assert_eq!(tag_of("registry:5000/lab"), "latest");
    }
}
