mod cache;
mod cast_manager;
mod clock;
mod config;
mod content_index;
mod error;
mod model;
mod prefetch;
mod resolver;
mod retry;
mod sampler;
mod session_controller;
mod sources;
mod stream_server;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use cast_manager::{CastDeviceInfo, CastReceiver};
use clock::{Clock, SystemClock};
use config::{Config, DeviceConfig, SourceKind, CONFIG_PATH_ENV};
use content_index::{ContentIndex, IndexSettings};
use error::{DeviceError, IndexError};
use log::{info, LevelFilter};
use prefetch::HttpPrefetcher;
use resolver::AssetUrlResolver;
use retry::Retry;
use session_controller::{SessionController, SessionSettings};
use sources::immich::ImmichSource;
use sources::local::LocalFolderSource;
use sources::AssetSource;

fn log_level_from_env(value: Option<&str>) -> LevelFilter {
    let Some(raw) = value.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return LevelFilter::Info;
    };
    match raw.to_ascii_lowercase().as_str() {
        "warning" => LevelFilter::Warn,
        "critical" | "fatal" => LevelFilter::Error,
        other => other.parse().unwrap_or(LevelFilter::Info),
    }
}

/// `http://host:port`, bracketing IPv6 literals.
fn http_origin(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("http://[{host}]:{port}")
    } else {
        format!("http://{host}:{port}")
    }
}

fn find_device(device: &DeviceConfig) -> Result<CastDeviceInfo, DeviceError> {
    match device
        .host
        .as_deref()
        .map(str::trim)
        .filter(|host| !host.is_empty())
    {
        Some(host) => CastDeviceInfo::from_static_host(&device.name, host, device.port),
        None => cast_manager::discover_by_name(&device.name),
    }
}

/// Builds the asset source and its URL scheme, starting the file server for a
/// local folder.
fn build_source(
    config: &Config,
    device: &CastDeviceInfo,
) -> Result<(Box<dyn AssetSource>, AssetUrlResolver), Box<dyn std::error::Error>> {
    match config.source.kind {
        SourceKind::Immich => Ok((
            Box::new(ImmichSource::new(
                &config.source.immich_base_url,
                &config.source.immich_api_key,
            )),
            AssetUrlResolver::immich(
                &config.source.immich_base_url,
                &config.source.immich_api_key,
            ),
        )),
        SourceKind::Local => {
            let root = PathBuf::from(&config.source.local_root);
            let bind_ip: IpAddr = config.server.bind_host.trim().parse()?;
            let server =
                stream_server::spawn_stream_server(&root, SocketAddr::new(bind_ip, config.server.port))?;
            let public_host = config
                .server
                .public_host
                .clone()
                .filter(|host| !host.trim().is_empty())
                .or_else(|| {
                    stream_server::local_ip_for_remote(device.address).map(|ip| ip.to_string())
                })
                .ok_or("cannot tell which address the receiver can reach; set server.public_host")?;
            let origin = http_origin(public_host.trim(), server.local_addr.port());
            info!("Serving {} to the receiver at {}", root.display(), origin);
            Ok((
                Box::new(LocalFolderSource::new(
                    root,
                    config.selection.exclusions.clone(),
                )),
                AssetUrlResolver::local(&origin, &server.token),
            ))
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut clog = colog::default_builder();
    clog.filter(
        None,
        log_level_from_env(std::env::var("LOG_LEVEL").ok().as_deref()),
    );
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    let config_path = config::resolve_config_path(
        std::env::args().nth(1),
        std::env::var(CONFIG_PATH_ENV).ok(),
    )?;
    let config = config::load_config(&config_path, |key| std::env::var(key).ok())?;
    info!("Loaded config from {}", config_path.display());

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let retry = Retry::new(clock.clone(), config.timing.retry_interval());

    let device = retry.run_transient(
        "Chromecast discovery",
        || find_device(&config.device),
        DeviceError::is_transient,
    )?;
    let (source, resolver) = build_source(&config, &device)?;
    info!("Photo source: {}", source.describe());

    let mut index = ContentIndex::new(
        source,
        clock.clone(),
        IndexSettings {
            decay: config.selection.decay,
            index_ttl: config.timing.index_ttl(),
            bucket_listing_ttl: config.timing.bucket_listing_ttl(),
            asset_listing_ttl: config.timing.asset_listing_ttl(),
            exclusions: config.selection.exclusions.clone(),
        },
    );
    retry.run_transient(
        "Photo index build",
        || index.refresh_if_stale(clock.now()),
        IndexError::is_transient,
    )?;

    let mut controller = SessionController::new(
        Box::new(CastReceiver::new(device)),
        index,
        resolver,
        Box::new(HttpPrefetcher::new()),
        clock,
        retry,
        SessionSettings {
            idle_identity: config.device.idle_identity.clone(),
            content_identity: config.device.content_identity.clone(),
            poll_backoff: config.timing.poll_backoff(),
            display_interval: config.timing.display_interval(),
        },
    );
    controller.run()
}

#[cfg(test)]
mod tests {
    use log::LevelFilter;

    use super::{http_origin, log_level_from_env};

    #[test]
    fn test_log_level_parsing_defaults_to_info() {
        assert_eq!(log_level_from_env(None), LevelFilter::Info);
        assert_eq!(log_level_from_env(Some("")), LevelFilter::Info);
        assert_eq!(log_level_from_env(Some("DEBUG")), LevelFilter::Debug);
        assert_eq!(log_level_from_env(Some("warning")), LevelFilter::Warn);
        assert_eq!(log_level_from_env(Some("trace")), LevelFilter::Trace);
        assert_eq!(log_level_from_env(Some("loud")), LevelFilter::Info);
    }

    #[test]
    fn test_http_origin_brackets_ipv6() {
        assert_eq!(http_origin("192.168.1.5", 8123), "http://192.168.1.5:8123");
        assert_eq!(http_origin("fe80::1", 80), "http://[fe80::1]:80");
        assert_eq!(http_origin("nas.local", 80), "http://nas.local:80");
    }
}
