//! Minimal HTTP server that exposes the local photo folder to the cast device.
//!
//! Every request must carry the per-process token as `?key=`. Paths are
//! percent-decoded per segment and must stay inside the root folder.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::thread;

use log::{debug, info, warn};
use tokio::sync::oneshot;

use crate::sources::local::sniff_media_type;

const TOKEN_BYTES: usize = 16;

/// What `main` learns once the server thread is listening.
#[derive(Debug, Clone)]
pub struct StreamServerHandle {
    pub local_addr: SocketAddr,
    pub token: String,
}

struct ServedRoot {
    root: PathBuf,
    token: String,
}

/// Binds on a dedicated thread and blocks until the bound address (or the
/// bind failure) comes back over a one-shot channel.
pub fn spawn_stream_server(root: &Path, bind_addr: SocketAddr) -> Result<StreamServerHandle, String> {
    let root = root
        .canonicalize()
        .map_err(|err| format!("failed to resolve served folder {}: {err}", root.display()))?;
    let token = random_token()?;
    let served = Arc::new(ServedRoot {
        root,
        token: token.clone(),
    });
    let (ready_tx, ready_rx) = oneshot::channel::<Result<SocketAddr, String>>();

    thread::Builder::new()
        .name("stream-server".to_string())
        .spawn(move || {
            let listener = match TcpListener::bind(bind_addr) {
                Ok(listener) => listener,
                Err(err) => {
                    let _ = ready_tx.send(Err(format!(
                        "failed to bind stream server on {bind_addr}: {err}"
                    )));
                    return;
                }
            };
            let local_addr = match listener.local_addr() {
                Ok(addr) => addr,
                Err(err) => {
                    let _ = ready_tx.send(Err(format!(
                        "failed to read stream server address: {err}"
                    )));
                    return;
                }
            };
            if ready_tx.send(Ok(local_addr)).is_err() {
                return;
            }
            info!(
                "StreamServer: serving {} on {}",
                served.root.display(),
                local_addr
            );
            accept_loop(listener, served);
        })
        .map_err(|err| format!("failed to spawn stream server thread: {err}"))?;

    let local_addr = ready_rx
        .blocking_recv()
        .map_err(|_| "stream server thread exited before reporting its address".to_string())??;
    Ok(StreamServerHandle { local_addr, token })
}

fn accept_loop(listener: TcpListener, served: Arc<ServedRoot>) {
    for incoming in listener.incoming() {
        match incoming {
            Ok(stream) => {
                let served = Arc::clone(&served);
                thread::spawn(move || {
                    if let Err(err) = handle_request(stream, &served) {
                        debug!("StreamServer: request failed: {}", err);
                    }
                });
            }
            Err(err) => warn!("StreamServer: accept failed: {}", err),
        }
    }
}

fn random_token() -> Result<String, String> {
    let mut bytes = [0u8; TOKEN_BYTES];
    getrandom::fill(&mut bytes).map_err(|err| format!("failed to generate stream token: {err}"))?;
    Ok(bytes.iter().map(|byte| format!("{byte:02x}")).collect())
}

/// Local interface address the OS would use to reach `remote_ip`.
pub fn local_ip_for_remote(remote_ip: IpAddr) -> Option<IpAddr> {
    let bind_addr = match remote_ip {
        IpAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        IpAddr::V6(_) => SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 0], 0)),
    };
    let socket = UdpSocket::bind(bind_addr).ok()?;
    socket.connect(SocketAddr::new(remote_ip, 9)).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

fn parse_header_line(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once(':')?;
    Some((name.trim(), value.trim()))
}

fn parse_http_request(
    reader: &mut BufReader<TcpStream>,
) -> Result<(String, String, HashMap<String, String>), String> {
    let mut request_line = String::new();
    reader
        .read_line(&mut request_line)
        .map_err(|err| format!("failed to read request line: {err}"))?;
    if request_line.trim().is_empty() {
        return Err("empty request".to_string());
    }
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| "missing request method".to_string())?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| "missing request path".to_string())?
        .to_string();

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        reader
            .read_line(&mut line)
            .map_err(|err| format!("failed to read header line: {err}"))?;
        if line == "\r\n" || line == "\n" || line.is_empty() {
            break;
        }
        if let Some((name, value)) = parse_header_line(&line) {
            headers.insert(name.to_ascii_lowercase(), value.to_string());
        }
    }

    Ok((method, target, headers))
}

/// Splits `/a/b.jpg?key=t&x=1` into the path and the decoded `key` value.
fn split_target(target: &str) -> (&str, Option<String>) {
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    let key = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| *name == "key")
        .and_then(|(_, value)| urlencoding::decode(value).ok())
        .map(|value| value.into_owned());
    (path, key)
}

/// Maps a request path onto a file below `root`, refusing anything that
/// escapes it.
fn resolve_path(root: &Path, request_path: &str) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for raw in request_path.split('/').filter(|segment| !segment.is_empty()) {
        let segment = urlencoding::decode(raw).ok()?;
        if segment.contains('/') || segment.contains('\\') {
            return None;
        }
        let mut components = Path::new(segment.as_ref()).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) => relative.push(part),
            _ => return None,
        }
    }
    if relative.as_os_str().is_empty() {
        return None;
    }
    let candidate = root.join(relative).canonicalize().ok()?;
    (candidate.starts_with(root) && candidate.is_file()).then_some(candidate)
}

fn write_simple_response(
    stream: &mut TcpStream,
    status_line: &str,
    content_type: &str,
    body: &[u8],
) -> Result<(), String> {
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream
        .write_all(header.as_bytes())
        .map_err(|err| format!("failed to write response header: {err}"))?;
    stream
        .write_all(body)
        .map_err(|err| format!("failed to write response body: {err}"))?;
    Ok(())
}

fn parse_range_header(range_header: Option<&str>, file_size: u64) -> Option<(u64, u64)> {
    let value = range_header?;
    let bytes = value.strip_prefix("bytes=")?;
    let (start_raw, end_raw) = bytes.split_once('-')?;
    let start = if start_raw.trim().is_empty() {
        0
    } else {
        start_raw.trim().parse::<u64>().ok()?
    };
    let end = if end_raw.trim().is_empty() {
        file_size.saturating_sub(1)
    } else {
        end_raw.trim().parse::<u64>().ok()?
    };
    if start > end || end >= file_size {
        return None;
    }
    Some((start, end))
}

fn handle_request(stream: TcpStream, served: &ServedRoot) -> Result<(), String> {
    let mut reader = BufReader::new(
        stream
            .try_clone()
            .map_err(|err| format!("failed to clone stream: {err}"))?,
    );
    let (method, target, headers) = parse_http_request(&mut reader)?;
    let mut stream = stream;

    if method != "GET" {
        return write_simple_response(
            &mut stream,
            "HTTP/1.1 405 Method Not Allowed",
            "text/plain; charset=utf-8",
            b"Method Not Allowed\n",
        );
    }
    let (request_path, key) = split_target(&target);
    if key.as_deref() != Some(served.token.as_str()) {
        debug!("StreamServer: rejected request without a valid key");
        return write_simple_response(
            &mut stream,
            "HTTP/1.1 401 Unauthorized",
            "text/plain; charset=utf-8",
            b"Unauthorized\n",
        );
    }
    let Some(path) = resolve_path(&served.root, request_path) else {
        return write_simple_response(
            &mut stream,
            "HTTP/1.1 404 Not Found",
            "text/plain; charset=utf-8",
            b"Not Found\n",
        );
    };

    let content_type = sniff_media_type(&path)
        .map(|media_type| media_type.mime())
        .unwrap_or("application/octet-stream");
    let mut file = File::open(&path).map_err(|err| format!("failed to open file: {err}"))?;
    let file_size = file
        .metadata()
        .map_err(|err| format!("failed to stat file: {err}"))?
        .len();
    if file_size == 0 {
        return write_simple_response(&mut stream, "HTTP/1.1 204 No Content", content_type, b"");
    }

    let range = parse_range_header(headers.get("range").map(String::as_str), file_size);
    let (start, end, status_line) = match range {
        Some((start, end)) => (start, end, "HTTP/1.1 206 Partial Content"),
        None => (0, file_size - 1, "HTTP/1.1 200 OK"),
    };
    let content_length = end.saturating_sub(start).saturating_add(1);

    file.seek(SeekFrom::Start(start))
        .map_err(|err| format!("failed to seek file: {err}"))?;

    let mut response_header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nAccept-Ranges: bytes\r\nContent-Length: {content_length}\r\nConnection: close\r\n"
    );
    if range.is_some() {
        response_header.push_str(&format!("Content-Range: bytes {start}-{end}/{file_size}\r\n"));
    }
    response_header.push_str("\r\n");
    stream
        .write_all(response_header.as_bytes())
        .map_err(|err| format!("failed to write response header: {err}"))?;

    let mut remaining = content_length;
    let mut buffer = [0u8; 64 * 1024];
    while remaining > 0 {
        let read_cap = remaining.min(buffer.len() as u64) as usize;
        let read = file
            .read(&mut buffer[..read_cap])
            .map_err(|err| format!("failed to read file: {err}"))?;
        if read == 0 {
            break;
        }
        stream
            .write_all(&buffer[..read])
            .map_err(|err| format!("failed to write body: {err}"))?;
        remaining = remaining.saturating_sub(read as u64);
    }
    debug!("StreamServer: served {} ({} bytes)", path.display(), content_length);
    Ok(())
}
