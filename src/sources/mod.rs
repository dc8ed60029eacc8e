//! Asset source abstractions and concrete implementations.

pub mod immich;
pub mod local;

use std::collections::BTreeMap;

use log::warn;

use crate::error::SourceError;
use crate::model::Asset;

/// An album (remote) or top-level directory (local) that holds assets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupRef {
    pub id: String,
    pub name: String,
}

/// All groups of one calendar year.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketRef {
    pub year: i32,
    pub groups: Vec<GroupRef>,
}

/// Interface implemented by concrete asset sources.
pub trait AssetSource: Send {
    /// Year buckets, oldest first.
    fn list_buckets(&self) -> Result<Vec<BucketRef>, SourceError>;
    /// Allow-listed image assets of one group.
    fn list_assets(&self, group: &GroupRef) -> Result<Vec<Asset>, SourceError>;
    /// Short human-readable description for logs.
    fn describe(&self) -> String;
}

/// Extracts the year from names like `[2019] Rome` or `[2019-05] Rome`. With
/// `allow_bare_year`, directory-style `2019` / `2019 Rome` / `2019-05 Rome`
/// names count too.
pub fn year_from_group_name(name: &str, allow_bare_year: bool) -> Option<i32> {
    let trimmed = name.trim();
    let (rest, bracketed) = match trimmed.strip_prefix('[') {
        Some(rest) => (rest, true),
        None if allow_bare_year => (trimmed, false),
        None => return None,
    };
    let digits = rest.get(..4)?;
    if !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    let next = rest[4..].chars().next();
    let terminated = if bracketed {
        matches!(next, Some(']') | Some('-'))
    } else {
        matches!(next, None | Some(' ') | Some('-') | Some('_'))
    };
    if !terminated {
        return None;
    }
    digits.parse().ok()
}

/// Case-insensitive substring match against the exclusion list.
pub fn is_excluded(name: &str, exclusions: &[String]) -> bool {
    let lowered = name.to_lowercase();
    exclusions
        .iter()
        .map(|excluded| excluded.trim())
        .filter(|excluded| !excluded.is_empty())
        .any(|excluded| lowered.contains(&excluded.to_lowercase()))
}

/// Groups named by the year rule into ascending year buckets; groups without
/// a year are skipped.
pub fn buckets_by_year(
    groups: impl IntoIterator<Item = GroupRef>,
    allow_bare_year: bool,
) -> Vec<BucketRef> {
    let mut by_year: BTreeMap<i32, Vec<GroupRef>> = BTreeMap::new();
    for group in groups {
        match year_from_group_name(&group.name, allow_bare_year) {
            Some(year) => by_year.entry(year).or_default().push(group),
            None => warn!(
                "Ignoring group for which a year cannot be extracted: '{}'",
                group.name
            ),
        }
    }
    by_year
        .into_iter()
        .map(|(year, groups)| BucketRef { year, groups })
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::{AssetSource, BucketRef, GroupRef};
    use crate::error::SourceError;
    use crate::model::{Asset, MediaType};

    /// Shared knobs and counters of a [`FakeSource`].
    #[derive(Default)]
    pub(crate) struct FakeSourceState {
        pub bucket_calls: AtomicUsize,
        pub asset_calls: AtomicUsize,
        /// Number of upcoming `list_buckets` calls that fail.
        pub failures_remaining: AtomicUsize,
        /// When set, every `list_assets` call returns nothing.
        pub assets_vanished: AtomicBool,
    }

    /// In-memory source: `counts[i]` assets in one album for year `first_year + i`.
    pub(crate) struct FakeSource {
        buckets: Vec<BucketRef>,
        assets: HashMap<String, Vec<Asset>>,
        pub state: Arc<FakeSourceState>,
    }

    impl FakeSource {
        pub fn with_counts(first_year: i32, counts: &[usize]) -> Self {
            let mut buckets = Vec::new();
            let mut assets = HashMap::new();
            for (offset, count) in counts.iter().enumerate() {
                let year = first_year + offset as i32;
                let group = GroupRef {
                    id: format!("album-{year}"),
                    name: format!("[{year}] Album"),
                };
                let album_assets = (0..*count)
                    .map(|n| Asset::new(format!("{year}-{n}"), MediaType::Jpeg))
                    .collect();
                assets.insert(group.id.clone(), album_assets);
                buckets.push(BucketRef {
                    year,
                    groups: vec![group],
                });
            }
            Self {
                buckets,
                assets,
                state: Arc::new(FakeSourceState::default()),
            }
        }

        pub fn with_buckets(buckets: Vec<BucketRef>, assets: HashMap<String, Vec<Asset>>) -> Self {
            Self {
                buckets,
                assets,
                state: Arc::new(FakeSourceState::default()),
            }
        }
    }

    impl AssetSource for FakeSource {
        fn list_buckets(&self) -> Result<Vec<BucketRef>, SourceError> {
            self.state.bucket_calls.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .state
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failing {
                return Err(SourceError::Http {
                    url: "fake://albums".to_string(),
                    message: "connection refused".to_string(),
                });
            }
            Ok(self.buckets.clone())
        }

        fn list_assets(&self, group: &GroupRef) -> Result<Vec<Asset>, SourceError> {
            self.state.asset_calls.fetch_add(1, Ordering::SeqCst);
            if self.state.assets_vanished.load(Ordering::SeqCst) {
                return Ok(Vec::new());
            }
            Ok(self.assets.get(&group.id).cloned().unwrap_or_default())
        }

        fn describe(&self) -> String {
            "fake source".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{buckets_by_year, is_excluded, year_from_group_name, GroupRef};

    fn group(id: &str, name: &str) -> GroupRef {
        GroupRef {
            id: id.to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn test_year_extraction_from_album_names() {
        assert_eq!(year_from_group_name("[2019] Rome", false), Some(2019));
        assert_eq!(year_from_group_name("[2019-05] Rome", false), Some(2019));
        assert_eq!(year_from_group_name("[2019]", false), Some(2019));
        assert_eq!(year_from_group_name("[201] Short", false), None);
        assert_eq!(year_from_group_name("[20190] Long", false), None);
        assert_eq!(year_from_group_name("Rome 2019", true), None);
        assert_eq!(year_from_group_name("", true), None);
    }

    #[test]
    fn test_bare_year_names_only_when_allowed() {
        assert_eq!(year_from_group_name("2021", true), Some(2021));
        assert_eq!(year_from_group_name("2021 Summer", true), Some(2021));
        assert_eq!(year_from_group_name("2021_Summer", true), Some(2021));
        assert_eq!(year_from_group_name("[2021] Summer", true), Some(2021));
        assert_eq!(year_from_group_name("20210 photos", true), None);

        assert_eq!(year_from_group_name("2021", false), None);
        assert_eq!(year_from_group_name("2021 Summer", false), None);
    }

    #[test]
    fn test_exclusion_is_case_insensitive_substring() {
        let exclusions = vec!["private".to_string(), "Screenshots".to_string()];
        assert!(is_excluded("[2020] PRIVATE stuff", &exclusions));
        assert!(is_excluded("screenshots-2020", &exclusions));
        assert!(!is_excluded("[2020] Holidays", &exclusions));
        assert!(!is_excluded("anything", &["".to_string()]));
    }

    #[test]
    fn test_buckets_sorted_oldest_first_and_skip_yearless() {
        let buckets = buckets_by_year(vec![
            group("c", "[2022] Ski"),
            group("a", "[2019] Rome"),
            group("x", "Favourites"),
            group("b", "[2019-08] Beach"),
        ], false);

        let years: Vec<i32> = buckets.iter().map(|bucket| bucket.year).collect();
        assert_eq!(years, vec![2019, 2022]);
        assert_eq!(buckets[0].groups, vec![group("a", "[2019] Rome"), group("b", "[2019-08] Beach")]);
        assert_eq!(buckets[1].groups, vec![group("c", "[2022] Ski")]);
    }
}
