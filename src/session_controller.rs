//! Device session control loop.
//!
//! Each cycle polls the receiver once and classifies it. An idle receiver (or
//! one still showing our own photo) enters a casting session that rotates
//! photos every display interval until another app takes the screen.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::cast_manager::CastTarget;
use crate::clock::Clock;
use crate::content_index::ContentIndex;
use crate::model::{Asset, DeviceStatus};
use crate::prefetch::Prefetch;
use crate::resolver::AssetUrlResolver;
use crate::retry::Retry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Display name the receiver reports when showing its ambient screen.
    pub idle_identity: String,
    /// Display name of the generic media app photos are cast with.
    pub content_identity: String,
    pub poll_backoff: Duration,
    pub display_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Busy,
    Idle,
    Resumable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Unavailable,
    Busy,
    SessionEnded { displayed: usize },
}

pub fn classify(
    status: &DeviceStatus,
    settings: &SessionSettings,
    resolver: &AssetUrlResolver,
) -> DeviceState {
    if status.display_name == settings.idle_identity {
        return DeviceState::Idle;
    }
    let showing_ours = status
        .active_content_id
        .as_deref()
        .is_some_and(|content_id| resolver.is_own_content(content_id));
    if status.display_name == settings.content_identity && showing_ours {
        DeviceState::Resumable
    } else {
        DeviceState::Busy
    }
}

pub struct SessionController {
    target: Box<dyn CastTarget>,
    index: ContentIndex,
    resolver: AssetUrlResolver,
    prefetcher: Box<dyn Prefetch>,
    clock: Arc<dyn Clock>,
    retry: Retry,
    settings: SessionSettings,
}

impl SessionController {
    pub fn new(
        target: Box<dyn CastTarget>,
        index: ContentIndex,
        resolver: AssetUrlResolver,
        prefetcher: Box<dyn Prefetch>,
        clock: Arc<dyn Clock>,
        retry: Retry,
        settings: SessionSettings,
    ) -> Self {
        Self {
            target,
            index,
            resolver,
            prefetcher,
            clock,
            retry,
            settings,
        }
    }

    pub fn run(&mut self) -> ! {
        loop {
            self.run_cycle();
        }
    }

    pub fn run_cycle(&mut self) -> CycleOutcome {
        let Some(status) = self.poll_status() else {
            warn!("Chromecast status unknown");
            self.clock.sleep(self.settings.poll_backoff);
            return CycleOutcome::Unavailable;
        };

        let state = classify(&status, &self.settings, &self.resolver);
        if state == DeviceState::Busy {
            debug!(
                "Chromecast busy: '{}' (present: {})",
                status.display_name, status.is_present
            );
            self.clock.sleep(self.settings.poll_backoff);
            return CycleOutcome::Busy;
        }

        info!("Casting...");
        let displayed = self.run_session(state);
        info!("Finished casting after {} photo(s)", displayed);
        self.clock.sleep(self.settings.poll_backoff);
        CycleOutcome::SessionEnded { displayed }
    }

    fn poll_status(&mut self) -> Option<DeviceStatus> {
        let target = &mut self.target;
        self.retry
            .run("Chromecast status poll", || target.poll_status())
    }

    fn next_photo(&mut self) -> (Asset, String) {
        let index = &mut self.index;
        let asset = self.retry.run("Photo selection", || index.pick());
        let url = self.resolver.resolve(&asset);
        (asset, url)
    }

    fn display(&mut self, asset: &Asset, url: &str) -> bool {
        match self.target.display(url, asset.media_type) {
            Ok(()) => true,
            Err(err) => {
                warn!("Failed to cast photo {}: {}", asset.id, err);
                false
            }
        }
    }

    /// Returns the number of photos the device was told to show.
    fn run_session(&mut self, state: DeviceState) -> usize {
        let mut displayed = 0;

        if state == DeviceState::Idle {
            let (asset, url) = self.next_photo();
            debug!("Casting initial photo {} ({})", asset.id, asset.media_type);
            if !self.display(&asset, &url) {
                return displayed;
            }
            displayed += 1;
        }

        loop {
            let (asset, url) = self.next_photo();

            debug!("Warming-up new photo {} ({})", asset.id, asset.media_type);
            match self.prefetcher.warm(&url) {
                Ok(bytes) => debug!("Warmed-up photo {} ({} bytes)", asset.id, bytes),
                Err(err) => debug!("Warm-up of photo {} failed: {}", asset.id, err),
            }

            self.clock.sleep(self.settings.display_interval);

            let still_ours = self
                .poll_status()
                .is_some_and(|status| status.display_name == self.settings.content_identity);
            if !still_ours {
                return displayed;
            }

            debug!("Casting new photo {} ({})", asset.id, asset.media_type);
            if !self.display(&asset, &url) {
                return displayed;
            }
            displayed += 1;
        }
    }
}
