//! Google Cast discovery and photo display.
//!
//! This module provides a small Cast v2 controller:
//! - finds the receiver by friendly name via mDNS (`mdns-sd`, no system daemon
//!   dependency) or uses a configured static host
//! - reads the receiver and media status over the TLS control channel
//! - launches the Default Media Receiver when needed and loads image URLs
//!
//! Every capability call opens its own TLS connection and closes it when done,
//! so no heartbeat has to be serviced while the control loop sleeps.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent};
use serde_json::Value;

use crate::error::DeviceError;
use crate::model::{DeviceStatus, MediaType};

const CAST_DEFAULT_MEDIA_RECEIVER_APP_ID: &str = "CC1AD845";
const CAST_NAMESPACE_CONNECTION: &str = "urn:x-cast:com.google.cast.tp.connection";
const CAST_NAMESPACE_HEARTBEAT: &str = "urn:x-cast:com.google.cast.tp.heartbeat";
const CAST_NAMESPACE_RECEIVER: &str = "urn:x-cast:com.google.cast.receiver";
const CAST_NAMESPACE_MEDIA: &str = "urn:x-cast:com.google.cast.media";
const CAST_RECEIVER_ID: &str = "receiver-0";
const CAST_SERVICE_TYPE: &str = "_googlecast._tcp.local.";

const CAST_CONNECT_TIMEOUT: Duration = Duration::from_secs(6);
const CAST_READ_TIMEOUT: Duration = Duration::from_millis(180);
const CAST_WRITE_TIMEOUT: Duration = Duration::from_millis(1500);
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(8);
const LOAD_TIMEOUT: Duration = Duration::from_secs(6);
const CAST_MAX_FRAME_LEN: usize = 64 * 1024;
const DISCOVERY_WINDOW: Duration = Duration::from_millis(1800);
const DISCOVERY_POLL: Duration = Duration::from_millis(250);

/// The device capability the session controller drives.
pub trait CastTarget {
    /// `Ok(None)` when the device did not answer in time: unknown, try later.
    fn poll_status(&mut self) -> Result<Option<DeviceStatus>, DeviceError>;
    fn display(&mut self, url: &str, media_type: MediaType) -> Result<(), DeviceError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CastDeviceInfo {
    pub id: String,
    pub name: String,
    pub host: String,
    pub address: IpAddr,
    pub port: u16,
}

impl CastDeviceInfo {
    /// Resolves a configured host instead of browsing mDNS.
    pub fn from_static_host(name: &str, host: &str, port: u16) -> Result<Self, DeviceError> {
        let address = (host, port)
            .to_socket_addrs()
            .map_err(|err| DeviceError::Connection(format!("failed to resolve '{host}': {err}")))?
            .map(|addr| addr.ip())
            .min_by_key(|ip| !ip.is_ipv4())
            .ok_or_else(|| DeviceError::NotFound(name.to_string()))?;
        Ok(Self {
            id: format!("{host}:{port}"),
            name: name.to_string(),
            host: host.to_string(),
            address,
            port,
        })
    }
}

fn cast_instance_name_from_fullname(fullname: &str) -> String {
    let suffix = format!(".{CAST_SERVICE_TYPE}");
    fullname
        .trim()
        .strip_suffix(suffix.as_str())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(fullname)
        .trim_matches('.')
        .to_string()
}

fn cast_device_from_resolved_service(service: &mdns_sd::ResolvedService) -> Option<CastDeviceInfo> {
    // The stream server binds IPv4, so prefer IPv4 receivers.
    let mut v4_addresses: Vec<_> = service.get_addresses_v4().iter().copied().collect();
    v4_addresses.sort();
    let address: IpAddr = v4_addresses.first()?.to_string().parse().ok()?;

    let host = service.get_hostname().trim_end_matches('.').to_string();
    let port = service.get_port();
    let fallback_name = cast_instance_name_from_fullname(service.get_fullname());
    let name = service
        .get_property_val_str("fn")
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .unwrap_or(fallback_name);
    let id = service
        .get_property_val_str("id")
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| format!("{}:{}:{}", host, address, port));
    Some(CastDeviceInfo {
        id,
        name,
        host,
        address,
        port,
    })
}

fn discover_cast_devices_once() -> Result<Vec<CastDeviceInfo>, DeviceError> {
    let mdns = ServiceDaemon::new().map_err(|err| {
        DeviceError::Connection(format!("failed to start mDNS discovery daemon: {err}"))
    })?;
    let browse_receiver = match mdns.browse(CAST_SERVICE_TYPE) {
        Ok(receiver) => receiver,
        Err(err) => {
            let _ = mdns.shutdown();
            return Err(DeviceError::Connection(format!(
                "failed to browse cast mDNS service: {err}"
            )));
        }
    };

    let deadline = Instant::now() + DISCOVERY_WINDOW;
    let mut devices_by_id: HashMap<String, CastDeviceInfo> = HashMap::new();
    while Instant::now() < deadline {
        let timeout = deadline
            .saturating_duration_since(Instant::now())
            .min(DISCOVERY_POLL);
        let Ok(event) = browse_receiver.recv_timeout(timeout) else {
            continue;
        };
        if let ServiceEvent::ServiceResolved(service) = event {
            if let Some(device) = cast_device_from_resolved_service(&service) {
                devices_by_id.insert(device.id.clone(), device);
            }
        }
    }

    if let Err(err) = mdns.stop_browse(CAST_SERVICE_TYPE) {
        debug!("CastManager: failed to stop mDNS browse cleanly: {}", err);
    }
    let _ = mdns.shutdown();

    let mut devices: Vec<CastDeviceInfo> = devices_by_id.into_values().collect();
    devices.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    Ok(devices)
}

/// Exactly one device must carry the friendly name.
pub fn select_by_name(devices: Vec<CastDeviceInfo>, name: &str) -> Result<CastDeviceInfo, DeviceError> {
    let mut matches: Vec<CastDeviceInfo> = devices
        .into_iter()
        .filter(|device| device.name == name)
        .collect();
    match matches.len() {
        0 => Err(DeviceError::NotFound(name.to_string())),
        1 => Ok(matches.remove(0)),
        count => Err(DeviceError::Ambiguous {
            name: name.to_string(),
            count,
        }),
    }
}

/// Browses mDNS once and picks the device by friendly name.
pub fn discover_by_name(name: &str) -> Result<CastDeviceInfo, DeviceError> {
    let devices = discover_cast_devices_once()?;
    debug!(
        "CastManager: discovered {} cast device(s): {:?}",
        devices.len(),
        devices.iter().map(|device| device.name.as_str()).collect::<Vec<_>>()
    );
    let device = select_by_name(devices, name)?;
    info!(
        "CastManager: using '{}' at {}:{}",
        device.name, device.address, device.port
    );
    Ok(device)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RunningApp {
    app_id: String,
    display_name: String,
    transport_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReceiverStatus {
    app: Option<RunningApp>,
    is_stand_by: bool,
}

impl ReceiverStatus {
    fn media_receiver(&self) -> Option<&RunningApp> {
        self.app.as_ref().filter(|app| {
            app.app_id == CAST_DEFAULT_MEDIA_RECEIVER_APP_ID && !app.transport_id.is_empty()
        })
    }
}

fn message_type(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

fn parse_receiver_status(value: &Value) -> Option<ReceiverStatus> {
    if message_type(value) != Some("RECEIVER_STATUS") {
        return None;
    }
    let status = value.get("status")?;
    let app = status
        .get("applications")
        .and_then(Value::as_array)
        .and_then(|applications| applications.first())
        .map(|app| {
            let field = |key: &str| {
                app.get(key)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            RunningApp {
                app_id: field("appId"),
                display_name: field("displayName"),
                transport_id: field("transportId"),
            }
        });
    Some(ReceiverStatus {
        app,
        is_stand_by: status
            .get("isStandBy")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

/// `Some(content_id)` for a media status message; the id itself is absent
/// when nothing is loaded.
fn parse_media_content_id(value: &Value) -> Option<Option<String>> {
    if message_type(value) != Some("MEDIA_STATUS") {
        return None;
    }
    let content_id = value
        .get("status")
        .and_then(Value::as_array)
        .and_then(|entries| entries.first())
        .and_then(|entry| entry.get("media"))
        .and_then(|media| media.get("contentId"))
        .and_then(Value::as_str)
        .map(ToString::to_string);
    Some(content_id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LoadReply {
    Loaded,
    Rejected(String),
}

fn parse_load_reply(value: &Value, request_id: i64) -> Option<LoadReply> {
    let replied_to = value.get("requestId").and_then(Value::as_i64);
    match message_type(value)? {
        "MEDIA_STATUS" if replied_to == Some(request_id) => Some(LoadReply::Loaded),
        kind @ ("LOAD_FAILED" | "LOAD_CANCELLED" | "INVALID_REQUEST")
            if replied_to.is_none() || replied_to == Some(request_id) =>
        {
            Some(LoadReply::Rejected(kind.to_string()))
        }
        _ => None,
    }
}

struct CastConnection<S> {
    stream: S,
    sender_id: String,
    connected_transports: Vec<String>,
    next_request_id: i64,
}

impl CastConnection<native_tls::TlsStream<TcpStream>> {
    fn connect(device: &CastDeviceInfo, sender_id: &str) -> Result<Self, String> {
        let address = SocketAddr::new(device.address, device.port);
        let tcp = TcpStream::connect_timeout(&address, CAST_CONNECT_TIMEOUT)
            .map_err(|err| format!("failed to connect to cast target {}: {err}", address))?;
        tcp.set_read_timeout(Some(CAST_READ_TIMEOUT))
            .map_err(|err| format!("failed to set cast read timeout: {err}"))?;
        tcp.set_write_timeout(Some(CAST_WRITE_TIMEOUT))
            .map_err(|err| format!("failed to set cast write timeout: {err}"))?;

        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|err| format!("failed to create cast tls connector: {err}"))?;
        let stream = connector
            .connect(&device.host, tcp)
            .map_err(|err| format!("failed cast tls handshake: {err}"))?;
        Self::open(stream, sender_id)
    }

    fn shutdown(self) {
        let mut stream = self.close();
        let _ = stream.shutdown();
    }
}

impl<S: Read + Write> CastConnection<S> {
    fn open(stream: S, sender_id: &str) -> Result<Self, String> {
        let mut connection = Self {
            stream,
            sender_id: sender_id.to_string(),
            connected_transports: Vec::new(),
            next_request_id: 1,
        };
        connection.connect_transport(CAST_RECEIVER_ID)?;
        Ok(connection)
    }

    fn alloc_request_id(&mut self) -> i64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    fn connect_transport(&mut self, destination_id: &str) -> Result<(), String> {
        if self
            .connected_transports
            .iter()
            .any(|connected| connected == destination_id)
        {
            return Ok(());
        }
        self.send_json(
            CAST_NAMESPACE_CONNECTION,
            destination_id,
            serde_json::json!({"type":"CONNECT","origin":{}}),
        )?;
        self.connected_transports.push(destination_id.to_string());
        Ok(())
    }

    fn send_json(
        &mut self,
        namespace: &str,
        destination_id: &str,
        payload: serde_json::Value,
    ) -> Result<(), String> {
        let payload_text = payload.to_string();
        let frame = encode_cast_frame(
            &self.sender_id,
            destination_id,
            namespace,
            payload_text.as_str(),
        )?;
        self.stream
            .write_all(&frame)
            .map_err(|err| format!("failed to send cast frame: {err}"))?;
        Ok(())
    }

    fn read_next_message(&mut self) -> Result<Option<(String, String, String)>, String> {
        let mut len_buf = [0u8; 4];
        match self.stream.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => return Ok(None),
            Err(err) => return Err(format!("failed to read cast frame length: {err}")),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Ok(None);
        }
        if len > CAST_MAX_FRAME_LEN {
            return Err(format!(
                "cast frame of {len} bytes exceeds the {CAST_MAX_FRAME_LEN} byte limit"
            ));
        }
        let mut payload = vec![0u8; len];
        self.stream
            .read_exact(&mut payload)
            .map_err(|err| format!("failed to read cast frame payload: {err}"))?;
        let decoded = decode_cast_frame(&payload)?;
        Ok(Some((
            decoded.namespace,
            decoded.source_id,
            decoded.payload_utf8,
        )))
    }

    /// Reads messages until `accept` recognises one, answering heartbeats on
    /// the way. `Ok(None)` on timeout.
    fn await_reply<T>(
        &mut self,
        timeout: Duration,
        mut accept: impl FnMut(&str, &Value) -> Option<T>,
    ) -> Result<Option<T>, String> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let Some((namespace, source_id, payload)) = self.read_next_message()? else {
                continue;
            };
            let Ok(value) = serde_json::from_str::<Value>(&payload) else {
                continue;
            };
            if namespace == CAST_NAMESPACE_HEARTBEAT {
                if message_type(&value) == Some("PING") {
                    self.send_json(
                        CAST_NAMESPACE_HEARTBEAT,
                        &source_id,
                        serde_json::json!({"type":"PONG"}),
                    )?;
                }
                continue;
            }
            if namespace == CAST_NAMESPACE_CONNECTION && message_type(&value) == Some("CLOSE") {
                return Err(format!("cast peer {source_id} closed the connection"));
            }
            if let Some(found) = accept(&namespace, &value) {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    fn receiver_status(&mut self) -> Result<Option<ReceiverStatus>, String> {
        let request_id = self.alloc_request_id();
        self.send_json(
            CAST_NAMESPACE_RECEIVER,
            CAST_RECEIVER_ID,
            serde_json::json!({"type":"GET_STATUS","requestId":request_id}),
        )?;
        self.await_reply(STATUS_TIMEOUT, |namespace, value| {
            (namespace == CAST_NAMESPACE_RECEIVER)
                .then(|| parse_receiver_status(value))
                .flatten()
        })
    }

    fn media_content_id(&mut self, transport_id: &str) -> Result<Option<String>, String> {
        self.connect_transport(transport_id)?;
        let request_id = self.alloc_request_id();
        self.send_json(
            CAST_NAMESPACE_MEDIA,
            transport_id,
            serde_json::json!({"type":"GET_STATUS","requestId":request_id}),
        )?;
        let reply = self.await_reply(STATUS_TIMEOUT, |namespace, value| {
            (namespace == CAST_NAMESPACE_MEDIA)
                .then(|| parse_media_content_id(value))
                .flatten()
        })?;
        Ok(reply.flatten())
    }

    fn launch_media_receiver(&mut self) -> Result<String, String> {
        let request_id = self.alloc_request_id();
        self.send_json(
            CAST_NAMESPACE_RECEIVER,
            CAST_RECEIVER_ID,
            serde_json::json!({"type":"LAUNCH","appId":CAST_DEFAULT_MEDIA_RECEIVER_APP_ID,"requestId":request_id}),
        )?;
        let transport_id = self.await_reply(LAUNCH_TIMEOUT, |namespace, value| {
            if namespace != CAST_NAMESPACE_RECEIVER {
                return None;
            }
            parse_receiver_status(value)?
                .media_receiver()
                .map(|app| app.transport_id.clone())
        })?;
        transport_id.ok_or_else(|| "timed out waiting for media transport id".to_string())
    }

    fn load_media(&mut self, transport_id: &str, url: &str, content_type: &str) -> Result<(), String> {
        self.connect_transport(transport_id)?;
        let request_id = self.alloc_request_id();
        self.send_json(
            CAST_NAMESPACE_MEDIA,
            transport_id,
            serde_json::json!({
                "type":"LOAD",
                "requestId":request_id,
                "autoplay":true,
                "media":{
                    "contentId":url,
                    "streamType":"BUFFERED",
                    "contentType":content_type,
                    "metadata":{"metadataType":0}
                }
            }),
        )?;
        let reply = self.await_reply(LOAD_TIMEOUT, |namespace, value| {
            (namespace == CAST_NAMESPACE_MEDIA)
                .then(|| parse_load_reply(value, request_id))
                .flatten()
        })?;
        match reply {
            Some(LoadReply::Loaded) => Ok(()),
            Some(LoadReply::Rejected(kind)) => Err(format!("receiver answered LOAD with {kind}")),
            None => {
                debug!("CastManager: no LOAD acknowledgement, assuming it was accepted");
                Ok(())
            }
        }
    }

    /// Sends CLOSE to every transport opened on this connection and hands the
    /// stream back.
    fn close(mut self) -> S {
        for destination_id in std::mem::take(&mut self.connected_transports).into_iter().rev() {
            if let Err(err) = self.send_json(
                CAST_NAMESPACE_CONNECTION,
                &destination_id,
                serde_json::json!({"type":"CLOSE"}),
            ) {
                debug!("CastManager: CLOSE to {} failed: {}", destination_id, err);
            }
        }
        self.stream
    }

    fn device_status(&mut self) -> Result<Option<DeviceStatus>, String> {
        let Some(receiver) = self.receiver_status()? else {
            return Ok(None);
        };
        let active_content_id = match receiver.media_receiver() {
            Some(app) => {
                let transport_id = app.transport_id.clone();
                self.media_content_id(&transport_id)?
            }
            None => None,
        };
        Ok(Some(DeviceStatus {
            display_name: receiver
                .app
                .map(|app| app.display_name)
                .unwrap_or_default(),
            is_present: !receiver.is_stand_by,
            active_content_id,
        }))
    }

    /// Launches the Default Media Receiver when it is not running, then loads
    /// `url` on it.
    fn display(&mut self, device_name: &str, url: &str, content_type: &str) -> Result<(), String> {
        let running = self
            .receiver_status()?
            .and_then(|receiver| receiver.media_receiver().map(|app| app.transport_id.clone()));
        let transport_id = match running {
            Some(transport_id) => transport_id,
            None => {
                info!("CastManager: launching Default Media Receiver on '{}'", device_name);
                self.launch_media_receiver()?
            }
        };
        self.load_media(&transport_id, url, content_type)
    }
}

/// Cast v2 receiver reached over TLS.
pub struct CastReceiver {
    device: CastDeviceInfo,
    sender_id: String,
}

impl CastReceiver {
    pub fn new(device: CastDeviceInfo) -> Self {
        Self {
            device,
            sender_id: format!("sender-{}", uuid::Uuid::new_v4().simple()),
        }
    }

    fn with_connection<T>(
        &self,
        operation: impl FnOnce(&mut CastConnection<native_tls::TlsStream<TcpStream>>) -> Result<T, String>,
    ) -> Result<T, DeviceError> {
        let mut connection =
            CastConnection::connect(&self.device, &self.sender_id).map_err(DeviceError::Connection)?;
        let result = operation(&mut connection).map_err(DeviceError::Protocol);
        connection.shutdown();
        result
    }
}

impl CastTarget for CastReceiver {
    fn poll_status(&mut self) -> Result<Option<DeviceStatus>, DeviceError> {
        self.with_connection(|connection| connection.device_status())
    }

    fn display(&mut self, url: &str, media_type: MediaType) -> Result<(), DeviceError> {
        let device_name = self.device.name.clone();
        self.with_connection(|connection| connection.display(&device_name, url, media_type.mime()))
            .inspect_err(|err| warn!("CastManager: display on '{}' failed: {}", device_name, err))
    }
}

struct DecodedFrame {
    source_id: String,
    namespace: String,
    payload_utf8: String,
}

fn encode_cast_frame(
    source_id: &str,
    destination_id: &str,
    namespace: &str,
    payload_utf8: &str,
) -> Result<Vec<u8>, String> {
    let mut protobuf = Vec::new();
    write_varint_field(&mut protobuf, 1, 0); // CASTV2_1_0
    write_string_field(&mut protobuf, 2, source_id);
    write_string_field(&mut protobuf, 3, destination_id);
    write_string_field(&mut protobuf, 4, namespace);
    write_varint_field(&mut protobuf, 5, 0); // STRING
    write_string_field(&mut protobuf, 6, payload_utf8);

    let len = protobuf
        .len()
        .try_into()
        .map_err(|_| "cast frame too large".to_string())?;
    let mut frame = Vec::with_capacity(4 + protobuf.len());
    frame.extend_from_slice(&u32::to_be_bytes(len));
    frame.extend_from_slice(&protobuf);
    Ok(frame)
}

fn decode_cast_frame(bytes: &[u8]) -> Result<DecodedFrame, String> {
    let mut cursor = 0usize;
    let mut source_id = String::new();
    let mut namespace = String::new();
    let mut payload_utf8 = String::new();

    while cursor < bytes.len() {
        let key = read_varint(bytes, &mut cursor)
            .ok_or_else(|| "invalid cast protobuf key".to_string())?;
        let field_number = (key >> 3) as u32;
        let wire_type = (key & 0x07) as u8;
        match (field_number, wire_type) {
            (_, 0) => {
                let _ = read_varint(bytes, &mut cursor)
                    .ok_or_else(|| "invalid cast protobuf varint field".to_string())?;
            }
            (_, 2) => {
                let len = read_varint(bytes, &mut cursor)
                    .ok_or_else(|| "invalid cast protobuf length".to_string())?
                    as usize;
                let end = cursor
                    .checked_add(len)
                    .filter(|end| *end <= bytes.len())
                    .ok_or_else(|| "cast protobuf string out of bounds".to_string())?;
                let value = String::from_utf8(bytes[cursor..end].to_vec())
                    .map_err(|_| "cast protobuf invalid utf8".to_string())?;
                match field_number {
                    2 => source_id = value,
                    4 => namespace = value,
                    6 => payload_utf8 = value,
                    _ => {}
                }
                cursor = end;
            }
            _ => return Err("unsupported cast protobuf wire type".to_string()),
        }
    }

    Ok(DecodedFrame {
        source_id,
        namespace,
        payload_utf8,
    })
}

fn write_varint_field(out: &mut Vec<u8>, field_number: u32, value: u64) {
    let key = (field_number as u64) << 3;
    write_varint(out, key);
    write_varint(out, value);
}

fn write_string_field(out: &mut Vec<u8>, field_number: u32, value: &str) {
    let key = ((field_number as u64) << 3) | 2;
    write_varint(out, key);
    write_varint(out, value.len() as u64);
    out.extend_from_slice(value.as_bytes());
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn read_varint(bytes: &[u8], cursor: &mut usize) -> Option<u64> {
    let mut shift = 0u32;
    let mut value = 0u64;
    while *cursor < bytes.len() && shift <= 63 {
        let byte = bytes[*cursor];
        *cursor += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
    }
    None
}
