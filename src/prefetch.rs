//! Best-effort cache warming: fetch a URL and throw the body away.

use std::time::Duration;

pub trait Prefetch {
    /// Reads the whole body, returning the number of bytes read.
    fn warm(&self, url: &str) -> Result<u64, String>;
}

pub struct HttpPrefetcher {
    http_client: ureq::Agent,
}

impl HttpPrefetcher {
    pub fn new() -> Self {
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(Duration::from_secs(30))
            .build();
        Self { http_client }
    }
}

impl Default for HttpPrefetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Prefetch for HttpPrefetcher {
    fn warm(&self, url: &str) -> Result<u64, String> {
        let response = self.http_client.get(url).call().map_err(|err| match err {
            ureq::Error::Status(code, _) => format!("HTTP status {code}"),
            ureq::Error::Transport(transport) => transport.to_string(),
        })?;
        std::io::copy(&mut response.into_reader(), &mut std::io::sink())
            .map_err(|err| format!("failed to read body: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::{HttpPrefetcher, Prefetch};
    use crate::sources::local::tests::write_file;
    use crate::stream_server::spawn_stream_server;

    #[test]
    fn test_warm_reads_whole_body() {
        let dir = tempfile::tempdir().expect("temp dir");
        write_file(&dir.path().join("photo.bin"), &[7u8; 4096]);
        let bind: SocketAddr = "127.0.0.1:0".parse().expect("valid address");
        let server = spawn_stream_server(dir.path(), bind).expect("server should start");

        let prefetcher = HttpPrefetcher::new();
        let url = format!("http://{}/photo.bin?key={}", server.local_addr, server.token);
        assert_eq!(prefetcher.warm(&url).expect("warm-up should succeed"), 4096);

        let denied = format!("http://{}/photo.bin?key=wrong", server.local_addr);
        assert!(prefetcher.warm(&denied).is_err());
    }
}
