//! Cached, recency-weighted index over the asset source.
//!
//! A rebuild lists the year buckets, drops excluded albums, lists every
//! remaining album's assets (warming the per-album cache), drops what ends up
//! empty, and installs a fresh [`IndexSnapshot`] in one swap. Sampling reads
//! the installed snapshot and never rebuilds on its own.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, TimeDelta};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::cache::TtlCache;
use crate::clock::Clock;
use crate::error::IndexError;
use crate::model::Asset;
use crate::sampler::{bucket_weights, pick_uniform, pick_weighted, year_elapsed_fraction};
use crate::sources::{is_excluded, AssetSource, BucketRef, GroupRef};

/// Resamples allowed per pick when sampled albums turn out empty.
pub const MAX_EMPTY_SELECTION_ATTEMPTS: usize = 16;

#[derive(Debug, Clone)]
pub struct IndexSettings {
    pub decay: f64,
    pub index_ttl: Duration,
    pub bucket_listing_ttl: Duration,
    pub asset_listing_ttl: Duration,
    pub exclusions: Vec<String>,
}

/// One non-empty year of the snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedBucket {
    pub year: i32,
    /// Position in the source's chronological listing, before any dropping.
    pub position: usize,
    pub groups: Vec<GroupRef>,
}

/// Immutable, fully built index. `weights[i]` belongs to `buckets[i]`.
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    pub buckets: Vec<IndexedBucket>,
    pub weights: Vec<f64>,
    pub built_at: DateTime<Local>,
}

impl IndexSnapshot {
    /// True iff the snapshot is strictly older than `ttl`.
    pub fn is_stale(&self, now: DateTime<Local>, ttl: Duration) -> bool {
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(self.built_at) > ttl
    }
}

pub struct ContentIndex {
    source: Box<dyn AssetSource>,
    clock: Arc<dyn Clock>,
    settings: IndexSettings,
    bucket_cache: TtlCache<(), Vec<BucketRef>>,
    asset_cache: TtlCache<GroupRef, Vec<Asset>>,
    snapshot: Option<Arc<IndexSnapshot>>,
    rng: StdRng,
}

impl ContentIndex {
    pub fn new(source: Box<dyn AssetSource>, clock: Arc<dyn Clock>, settings: IndexSettings) -> Self {
        let mut seed = [0u8; 32];
        if let Err(err) = getrandom::fill(&mut seed) {
            warn!("ContentIndex: secure seed unavailable, using time seed: {}", err);
            let nanos = clock.now().timestamp_nanos_opt().unwrap_or_default();
            seed[..8].copy_from_slice(&nanos.to_le_bytes());
        }
        Self::with_rng(source, clock, settings, StdRng::from_seed(seed))
    }

    pub fn with_rng(
        source: Box<dyn AssetSource>,
        clock: Arc<dyn Clock>,
        settings: IndexSettings,
        rng: StdRng,
    ) -> Self {
        Self {
            bucket_cache: TtlCache::new(settings.bucket_listing_ttl),
            asset_cache: TtlCache::new(settings.asset_listing_ttl),
            source,
            clock,
            settings,
            snapshot: None,
            rng,
        }
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> Option<Arc<IndexSnapshot>> {
        self.snapshot.clone()
    }

    pub fn is_stale(&self, now: DateTime<Local>) -> bool {
        self.snapshot
            .as_ref()
            .map_or(true, |snapshot| snapshot.is_stale(now, self.settings.index_ttl))
    }

    /// Rebuilds when there is no snapshot or it outlived the index TTL.
    /// Returns whether a rebuild happened. On failure the previous snapshot
    /// stays installed.
    pub fn refresh_if_stale(&mut self, now: DateTime<Local>) -> Result<bool, IndexError> {
        if !self.is_stale(now) {
            return Ok(false);
        }
        let snapshot = self.rebuild(now)?;
        info!(
            "ContentIndex: rebuilt from {} with {} bucket(s) over {} album listing(s), weights {:?}",
            self.source.describe(),
            snapshot.buckets.len(),
            self.asset_cache.len(),
            snapshot.weights
        );
        self.snapshot = Some(Arc::new(snapshot));
        Ok(true)
    }

    fn rebuild(&mut self, now: DateTime<Local>) -> Result<IndexSnapshot, IndexError> {
        let source = &self.source;
        let listing = self
            .bucket_cache
            .get_or_try_insert((), now, || source.list_buckets())?;

        let mut buckets = Vec::with_capacity(listing.len());
        for (position, bucket) in listing.into_iter().enumerate() {
            let mut groups = Vec::with_capacity(bucket.groups.len());
            for group in bucket.groups {
                if is_excluded(&group.name, &self.settings.exclusions) {
                    info!("ContentIndex: ignoring excluded album '{}'", group.name);
                    continue;
                }
                let assets = self
                    .asset_cache
                    .get_or_try_insert(group.clone(), now, || source.list_assets(&group))?;
                if assets.is_empty() {
                    warn!("ContentIndex: album '{}' has no valid assets", group.name);
                    continue;
                }
                groups.push(group);
            }
            if groups.is_empty() {
                debug!("ContentIndex: dropping empty bucket {}", bucket.year);
                continue;
            }
            buckets.push(IndexedBucket {
                year: bucket.year,
                position,
                groups,
            });
        }

        let Some(newest) = buckets.last() else {
            return Err(IndexError::EmptyIndex);
        };
        let current_fraction =
            (newest.year == now.year()).then(|| year_elapsed_fraction(now.naive_local()));
        let positions: Vec<usize> = buckets.iter().map(|bucket| bucket.position).collect();
        let weights = bucket_weights(&positions, self.settings.decay, current_fraction);

        Ok(IndexSnapshot {
            buckets,
            weights,
            built_at: now,
        })
    }

    /// Draws one asset from the installed snapshot: weighted year, uniform
    /// album, uniform asset.
    pub fn sample(&mut self) -> Result<Asset, IndexError> {
        let snapshot = self.snapshot.clone().ok_or(IndexError::EmptyIndex)?;
        if snapshot.buckets.is_empty() {
            return Err(IndexError::EmptyIndex);
        }
        let bucket_index = pick_weighted(&snapshot.weights, &mut self.rng)?;
        let bucket = &snapshot.buckets[bucket_index];
        let group = pick_uniform(&bucket.groups, &mut self.rng)
            .ok_or(IndexError::EmptyIndex)?
            .clone();

        let now = self.clock.now();
        let source = &self.source;
        let assets = self
            .asset_cache
            .get_or_try_insert(group.clone(), now, || source.list_assets(&group))?;
        pick_uniform(&assets, &mut self.rng)
            .cloned()
            .ok_or(IndexError::EmptySelection(group.name))
    }

    /// Ensures freshness, then samples, resampling a bounded number of times
    /// when a chosen album has gone empty since the last rebuild.
    pub fn pick(&mut self) -> Result<Asset, IndexError> {
        let now = self.clock.now();
        self.refresh_if_stale(now)?;

        let mut last_empty = String::new();
        for attempt in 1..=MAX_EMPTY_SELECTION_ATTEMPTS {
            match self.sample() {
                Err(IndexError::EmptySelection(group)) => {
                    warn!(
                        "ContentIndex: album '{}' has no valid assets (attempt {}/{})",
                        group, attempt, MAX_EMPTY_SELECTION_ATTEMPTS
                    );
                    last_empty = group;
                }
                other => return other,
            }
        }
        Err(IndexError::EmptySelection(last_empty))
    }
}
