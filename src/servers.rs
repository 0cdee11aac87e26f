//! The four cooperating UDP server loops (spec §4.3-§4.6): Weather
//! (front), Location, Query, Report. Each role binds its own socket and
//! runs a `recv_from` / dispatch / `send_to` loop, the same shape goatns
//! uses for its DNS UDP listener (`udp_server`), just speaking WIP frames
//! instead of DNS ones.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use concread::cowcell::asynch::{CowCell, CowCellReadTxn};
use dashmap::DashMap;
use futures::FutureExt;
use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{CacheHandle, ReportPayload};
use crate::codec::{self, ExtendedField, Header, Packet, PacketType, RequestFlags, ResponseBody};
use crate::config::ConfigFile;
use crate::error::WipError;
use crate::Role;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Single monotonic 12-bit packet-id counter with a random starting
/// offset, shared across a role's outbound hops (spec §5). Wraps at 4096;
/// the core only treats the value as an opaque correlation token.
pub struct PacketIdGenerator {
    current: AtomicU16,
}

impl PacketIdGenerator {
    pub fn new() -> Self {
        let start = rand::random::<u16>() % 4096;
        Self {
            current: AtomicU16::new(start),
        }
    }

    pub fn next_id(&self) -> u16 {
        self.current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| {
                Some((id + 1) % 4096)
            })
            .expect("update closure always returns Some")
    }
}

impl Default for PacketIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// What a Weather correlation entry is waiting on next (spec §4.3's
/// pipeline state machine, collapsed into the two suspense states that
/// actually need remembered context between hops).
enum Stage {
    AwaitingLocation { day: u8, flags: RequestFlags },
    AwaitingQuery { day: u8, flags: RequestFlags },
}

struct CorrelationEntry {
    client_addr: SocketAddr,
    client_packet_id: u16,
    deadline: Instant,
    stage: Stage,
}

/// The Weather server's routing table: upstream (minted) packet_id ->
/// pending client correlation. Backed by `DashMap` for per-entry locking
/// rather than one global mutex, per spec §9's redesign hint.
#[derive(Default)]
struct CorrelationMap {
    entries: DashMap<u16, CorrelationEntry>,
}

impl CorrelationMap {
    fn insert(&self, upstream_pid: u16, entry: CorrelationEntry) {
        self.entries.insert(upstream_pid, entry);
    }

    fn remove(&self, upstream_pid: u16) -> Option<CorrelationEntry> {
        self.entries.remove(&upstream_pid).map(|(_, v)| v)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    /// Removes and returns every entry whose deadline has already passed.
    /// Called by the sweeper task; the caller is responsible for sending
    /// each evicted client its timeout reply (spec §5 cancellation rules).
    fn sweep_expired(&self) -> Vec<CorrelationEntry> {
        let now = Instant::now();
        let expired: Vec<u16> = self
            .entries
            .iter()
            .filter(|kv| kv.deadline <= now)
            .map(|kv| *kv.key())
            .collect();
        expired
            .into_iter()
            .filter_map(|pid| self.remove(pid))
            .collect()
    }
}

/// Builds an ErrorResponse packet (spec §6, §7): type=7, the error code in
/// the first body byte, an optional UTF-8 message in extended record
/// id=8.
fn error_packet(packet_id: u16, area_code: u32, code: u8, message: Option<&str>) -> Packet {
    let extended = match message {
        Some(msg) => vec![ExtendedField::ErrorMessage(msg.to_string())],
        None => vec![],
    };
    Packet {
        header: Header {
            packet_id,
            packet_type: PacketType::ErrorResponse,
            flags: RequestFlags::default(),
            ex_flag: !extended.is_empty(),
            day: 0,
            timestamp: now_secs(),
            area_code,
        },
        body: vec![code],
        extended,
    }
}

fn error_packet_from(packet_id: u16, area_code: u32, err: &WipError) -> Packet {
    error_packet(packet_id, area_code, err.error_code(), Some(&err.to_string()))
}

async fn send_packet(socket: &UdpSocket, packet: &Packet, to: SocketAddr) {
    match codec::encode(packet) {
        Ok(bytes) => {
            if let Err(err) = socket.send_to(&bytes, to).await {
                error!(%to, %err, "failed to send a reply datagram");
            }
        }
        Err(err) => error!(%err, "failed to encode an outgoing packet"),
    }
}

async fn send_error(socket: &UdpSocket, packet_id: u16, area_code: u32, err: &WipError, to: SocketAddr) {
    send_packet(socket, &error_packet_from(packet_id, area_code, err), to).await;
}

fn find_latitude(fields: &[ExtendedField]) -> Option<f32> {
    fields.iter().find_map(|f| match f {
        ExtendedField::Latitude(v) => Some(*v),
        _ => None,
    })
}

fn find_longitude(fields: &[ExtendedField]) -> Option<f32> {
    fields.iter().find_map(|f| match f {
        ExtendedField::Longitude(v) => Some(*v),
        _ => None,
    })
}

fn find_auth_hash(fields: &[ExtendedField]) -> Option<&[u8; 32]> {
    fields.iter().find_map(|f| match f {
        ExtendedField::AuthHash(digest) => Some(digest),
        _ => None,
    })
}

fn find_alert(fields: &[ExtendedField]) -> Vec<String> {
    fields
        .iter()
        .find_map(|f| match f {
            ExtendedField::Alert(items) => Some(items.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

fn find_disaster(fields: &[ExtendedField]) -> Vec<String> {
    fields
        .iter()
        .find_map(|f| match f {
            ExtendedField::Disaster(items) => Some(items.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

/// Authenticates `packet` against `config`'s passphrase for `role`, if
/// auth is enabled for that role (spec §4.2). A no-op when auth is
/// disabled.
fn authenticate(config: &ConfigFile, role: Role, packet: &Packet) -> Result<(), WipError> {
    if !config.auth_enabled_for(role) {
        return Ok(());
    }
    let digest = find_auth_hash(&packet.extended).ok_or_else(|| {
        WipError::AuthFailure("auth enabled but no auth_hash extended field present".to_string())
    })?;
    codec::auth::verify(
        packet.header.packet_id,
        packet.header.timestamp,
        now_secs(),
        config.max_timestamp_skew_secs,
        config.passphrase_for(role),
        digest,
    )
}

/// Runs `fut` with a panic guard (spec §7: "panics in a handler must be
/// caught and converted to code=8"). goatns doesn't need this because
/// Axum already catches handler panics for the HTTP surface; our raw UDP
/// loop has no such framework underneath it.
async fn run_guarded<F>(fut: F) -> Result<(), WipError>
where
    F: std::future::Future<Output = Result<(), WipError>>,
{
    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(WipError::ServerError("handler panicked".to_string())),
    }
}

// ---------------------------------------------------------------------
// Weather server (front)
// ---------------------------------------------------------------------

/// Runs the Weather front server: terminates client traffic on
/// `config.port_weather`, orchestrates the Location and Query hops over
/// one upstream socket, and forwards the final reply back to the
/// original client (spec §4.3).
///
/// `config` is consumed once at startup (the same CowCell read-snapshot
/// pattern goatns's `udp_server` uses), not re-read mid-loop: the handful
/// of values the background tasks need (hop timeouts) are copied out into
/// plain owned locals before those tasks are spawned, so nothing here
/// depends on `CowCellReadTxn` being `Clone`.
#[instrument(level = "info", skip_all)]
pub async fn weather_server(config: CowCellReadTxn<ConfigFile>) -> std::io::Result<()> {
    let client_sock = UdpSocket::bind(config.listener_address(Role::Weather)?).await?;
    info!(addr = %client_sock.local_addr()?, "weather server listening");

    let upstream_sock = UdpSocket::bind((config.address.as_str(), 0)).await?;
    let location_addr: SocketAddr = format!("{}:{}", config.address, config.port_location)
        .parse()
        .expect("address:port always parses");
    let query_addr: SocketAddr = format!("{}:{}", config.address, config.port_query)
        .parse()
        .expect("address:port always parses");
    let query_timeout_ms = config.query_timeout_ms;
    let query_auth_enabled = config.auth_enabled_for(Role::Query);
    let query_passphrase = config.passphrase_for(Role::Query).to_string();

    let correlation = std::sync::Arc::new(CorrelationMap::default());
    let pid_gen = std::sync::Arc::new(PacketIdGenerator::new());
    let upstream_sock = std::sync::Arc::new(upstream_sock);
    let client_sock = std::sync::Arc::new(client_sock);

    let sweeper = {
        let correlation = correlation.clone();
        let client_sock = client_sock.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(250));
            loop {
                interval.tick().await;
                for entry in correlation.sweep_expired() {
                    warn!(pid = entry.client_packet_id, "client request timed out");
                    send_error(
                        &client_sock,
                        entry.client_packet_id,
                        0,
                        &WipError::Timeout,
                        entry.client_addr,
                    )
                    .await;
                }
            }
        })
    };

    let upstream_reader = {
        let correlation = correlation.clone();
        let upstream_sock = upstream_sock.clone();
        let client_sock = client_sock.clone();
        let query_addr = query_addr;
        let query_auth_enabled = query_auth_enabled;
        let query_passphrase = query_passphrase.clone();
        tokio::spawn(async move {
            let mut buf = BytesMut::zeroed(codec::MAX_DATAGRAM_LEN);
            loop {
                let (len, _from) = match upstream_sock.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(err) => {
                        error!(%err, "upstream recv failed");
                        continue;
                    }
                };
                let packet = match codec::decode(&buf[..len]) {
                    Ok(p) => p,
                    Err(err) => {
                        debug!(%err, "dropping an unparsable upstream reply");
                        continue;
                    }
                };
                let Some(entry) = correlation.remove(packet.header.packet_id) else {
                    debug!(pid = packet.header.packet_id, "no correlation entry for upstream reply, dropping");
                    continue;
                };

                match (packet.header.packet_type, &entry.stage) {
                    (PacketType::LocationResponse, Stage::AwaitingLocation { day, flags }) => {
                        let upstream_pid = pid_gen.next_id();
                        let mut extended = vec![];
                        if query_auth_enabled {
                            extended.push(ExtendedField::AuthHash(codec::auth::compute(
                                upstream_pid,
                                now_secs(),
                                &query_passphrase,
                            )));
                        }
                        let query_request = Packet {
                            header: Header {
                                packet_id: upstream_pid,
                                packet_type: PacketType::QueryRequest,
                                flags: *flags,
                                ex_flag: !extended.is_empty(),
                                day: *day,
                                timestamp: now_secs(),
                                area_code: packet.header.area_code,
                            },
                            body: vec![],
                            extended,
                        };
                        correlation.insert(
                            upstream_pid,
                            CorrelationEntry {
                                client_addr: entry.client_addr,
                                client_packet_id: entry.client_packet_id,
                                deadline: Instant::now()
                                    + Duration::from_millis(query_timeout_ms),
                                stage: Stage::AwaitingQuery { day: *day, flags: *flags },
                            },
                        );
                        send_packet(&upstream_sock, &query_request, query_addr).await;
                    }
                    (PacketType::QueryResponse, Stage::AwaitingQuery { .. }) => {
                        let mut reply = packet.clone();
                        reply.header.packet_id = entry.client_packet_id;
                        send_packet(&client_sock, &reply, entry.client_addr).await;
                    }
                    (PacketType::ErrorResponse, _) => {
                        let code = packet.error_code().unwrap_or(8);
                        send_packet(
                            &client_sock,
                            &error_packet(entry.client_packet_id, packet.header.area_code, code, None),
                            entry.client_addr,
                        )
                        .await;
                    }
                    (other, _) => {
                        warn!(?other, "unexpected upstream reply for this correlation stage");
                    }
                }
            }
        })
    };

    let mut buf = BytesMut::zeroed(codec::MAX_DATAGRAM_LEN);
    loop {
        let (len, client_addr) = client_sock.recv_from(&mut buf).await?;
        let datagram = buf[..len].to_vec();

        if let Err(err) = run_guarded(handle_client_datagram(
            &datagram,
            client_addr,
            &config,
            &correlation,
            &pid_gen,
            &upstream_sock,
            &client_sock,
            location_addr,
            query_addr,
        ))
        .await
        {
            error!(%err, "weather handler failed");
        }
    }

    // Unreachable in practice (the loop above only exits on I/O error),
    // but keeps the background tasks named so `cargo build` doesn't warn
    // about them being dropped silently on an early return.
    #[allow(unreachable_code)]
    {
        sweeper.abort();
        upstream_reader.abort();
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_client_datagram(
    datagram: &[u8],
    client_addr: SocketAddr,
    config: &ConfigFile,
    correlation: &CorrelationMap,
    pid_gen: &PacketIdGenerator,
    upstream_sock: &UdpSocket,
    client_sock: &UdpSocket,
    location_addr: SocketAddr,
    query_addr: SocketAddr,
) -> Result<(), WipError> {
    let packet = match codec::decode(datagram) {
        Ok(p) => p,
        Err(err) => {
            // We can still read a packet_id/area_code out of a
            // partially-valid datagram in many failure modes, but a
            // MalformedHeader can mean the id field itself is garbage.
            // Best-effort: only reply when decode got far enough to hand
            // us nothing usable, drop silently otherwise (spec §7).
            debug!(%err, "dropping an unparsable client datagram");
            return Ok(());
        }
    };

    if let Err(err) = authenticate(config, Role::Weather, &packet) {
        send_error(client_sock, packet.header.packet_id, packet.header.area_code, &err, client_addr).await;
        return Ok(());
    }

    if correlation.len() >= crate::MAX_IN_FLIGHT {
        send_error(
            client_sock,
            packet.header.packet_id,
            packet.header.area_code,
            &WipError::ServerError("too many in-flight requests".to_string()),
            client_addr,
        )
        .await;
        return Ok(());
    }

    match packet.header.packet_type {
        PacketType::LocationRequest => {
            let (Some(lat), Some(lon)) = (
                find_latitude(&packet.extended),
                find_longitude(&packet.extended),
            ) else {
                send_error(
                    client_sock,
                    packet.header.packet_id,
                    0,
                    &WipError::MissingRequiredData("latitude/longitude extended fields required".into()),
                    client_addr,
                )
                .await;
                return Ok(());
            };

            let upstream_pid = pid_gen.next_id();
            let mut extended = vec![
                ExtendedField::Latitude(lat),
                ExtendedField::Longitude(lon),
                ExtendedField::Source(client_addr.to_string()),
            ];
            if config.auth_enabled_for(Role::Location) {
                extended.push(ExtendedField::AuthHash(codec::auth::compute(
                    upstream_pid,
                    now_secs(),
                    config.passphrase_for(Role::Location),
                )));
            }
            let request = Packet {
                header: Header {
                    packet_id: upstream_pid,
                    packet_type: PacketType::LocationRequest,
                    flags: packet.header.flags,
                    ex_flag: true,
                    day: packet.header.day,
                    timestamp: now_secs(),
                    area_code: 0,
                },
                body: vec![],
                extended,
            };
            correlation.insert(
                upstream_pid,
                CorrelationEntry {
                    client_addr,
                    client_packet_id: packet.header.packet_id,
                    deadline: Instant::now() + Duration::from_millis(config.location_timeout_ms),
                    stage: Stage::AwaitingLocation {
                        day: packet.header.day,
                        flags: packet.header.flags,
                    },
                },
            );
            send_packet(upstream_sock, &request, location_addr).await;
        }
        PacketType::QueryRequest if packet.header.area_code != 0 => {
            let upstream_pid = pid_gen.next_id();
            let mut extended = vec![];
            if config.auth_enabled_for(Role::Query) {
                extended.push(ExtendedField::AuthHash(codec::auth::compute(
                    upstream_pid,
                    now_secs(),
                    config.passphrase_for(Role::Query),
                )));
            }
            let request = Packet {
                header: Header {
                    packet_id: upstream_pid,
                    packet_type: PacketType::QueryRequest,
                    flags: packet.header.flags,
                    ex_flag: !extended.is_empty(),
                    day: packet.header.day,
                    timestamp: now_secs(),
                    area_code: packet.header.area_code,
                },
                body: vec![],
                extended,
            };
            correlation.insert(
                upstream_pid,
                CorrelationEntry {
                    client_addr,
                    client_packet_id: packet.header.packet_id,
                    deadline: Instant::now() + Duration::from_millis(config.query_timeout_ms),
                    stage: Stage::AwaitingQuery {
                        day: packet.header.day,
                        flags: packet.header.flags,
                    },
                },
            );
            send_packet(upstream_sock, &request, query_addr).await;
        }
        _ => {
            send_error(
                client_sock,
                packet.header.packet_id,
                packet.header.area_code,
                &WipError::MissingRequiredData(
                    "expected a coordinate LocationRequest or an area-code QueryRequest".into(),
                ),
                client_addr,
            )
            .await;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------
// Location server
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AreaBBox {
    pub area_code: u32,
    pub min_lat: f32,
    pub max_lat: f32,
    pub min_lon: f32,
    pub max_lon: f32,
}

impl AreaBBox {
    fn contains(&self, lat: f32, lon: f32) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }
}

/// The built-in fixture table used when no `location_table_path` is
/// configured: just enough area boxes to exercise the scenarios spec §8
/// names by name (Tokyo -> 130010).
fn default_area_table() -> Vec<AreaBBox> {
    vec![
        AreaBBox {
            area_code: 130010,
            min_lat: 35.5,
            max_lat: 35.9,
            min_lon: 139.5,
            max_lon: 139.9,
        },
        AreaBBox {
            area_code: 270000,
            min_lat: 34.5,
            max_lat: 34.8,
            min_lon: 135.3,
            max_lon: 135.7,
        },
    ]
}

async fn load_area_table(path: &Option<String>) -> Vec<AreaBBox> {
    let Some(path) = path else {
        return default_area_table();
    };
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|err| {
            warn!(%err, %path, "failed to parse location table, falling back to the fixture table");
            default_area_table()
        }),
        Err(err) => {
            warn!(%err, %path, "failed to read location table, falling back to the fixture table");
            default_area_table()
        }
    }
}

/// Maps (lat, lon) -> area_code via a first-match scan over bounding
/// boxes (spec §4.4's "static spatial table supplied by an external
/// collaborator", here given the simplest geometry that satisfies the
/// contract: exact algorithm is out of scope for the core).
fn resolve_area(table: &[AreaBBox], lat: f32, lon: f32) -> Option<u32> {
    table.iter().find(|b| b.contains(lat, lon)).map(|b| b.area_code)
}

#[instrument(level = "info", skip_all)]
pub async fn location_server(config: CowCellReadTxn<ConfigFile>) -> std::io::Result<()> {
    let socket = UdpSocket::bind(config.listener_address(Role::Location)?).await?;
    info!(addr = %socket.local_addr()?, "location server listening");
    let table = load_area_table(&config.location_table_path).await;

    let mut buf = BytesMut::zeroed(codec::MAX_DATAGRAM_LEN);
    loop {
        let (len, addr) = socket.recv_from(&mut buf).await?;
        let packet = match codec::decode(&buf[..len]) {
            Ok(p) => p,
            Err(err) => {
                debug!(%err, "dropping an unparsable location request");
                continue;
            }
        };

        if let Err(err) = run_guarded(handle_location_request(&socket, &config, &table, packet, addr)).await {
            error!(%err, "location handler failed");
        }
    }
}

async fn handle_location_request(
    socket: &UdpSocket,
    config: &ConfigFile,
    table: &[AreaBBox],
    packet: Packet,
    addr: SocketAddr,
) -> Result<(), WipError> {
    if let Err(err) = authenticate(config, Role::Location, &packet) {
        send_error(socket, packet.header.packet_id, 0, &err, addr).await;
        return Ok(());
    }
    if packet.header.packet_type != PacketType::LocationRequest {
        send_error(
            socket,
            packet.header.packet_id,
            0,
            &WipError::UnknownPacketType(packet.header.packet_type as u8),
            addr,
        )
        .await;
        return Ok(());
    }

    let (Some(lat), Some(lon)) = (
        find_latitude(&packet.extended),
        find_longitude(&packet.extended),
    ) else {
        send_error(
            socket,
            packet.header.packet_id,
            0,
            &WipError::MissingRequiredData("latitude/longitude extended fields required".into()),
            addr,
        )
        .await;
        return Ok(());
    };

    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        send_error(
            socket,
            packet.header.packet_id,
            0,
            &WipError::InvalidValue(format!("coordinate ({lat}, {lon}) out of range")),
            addr,
        )
        .await;
        return Ok(());
    }

    match resolve_area(table, lat, lon) {
        Some(area_code) => {
            let response = Packet {
                header: Header {
                    packet_id: packet.header.packet_id,
                    packet_type: PacketType::LocationResponse,
                    flags: packet.header.flags,
                    ex_flag: false,
                    day: packet.header.day,
                    timestamp: now_secs(),
                    area_code,
                },
                body: ResponseBody::default().to_bytes().to_vec(),
                extended: vec![],
            };
            send_packet(socket, &response, addr).await;
        }
        None => {
            send_error(
                socket,
                packet.header.packet_id,
                0,
                &WipError::MissingRequiredData("no area contains this point".to_string()),
                addr,
            )
            .await;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Query server
// ---------------------------------------------------------------------

#[instrument(level = "info", skip_all)]
pub async fn query_server(config: CowCellReadTxn<ConfigFile>, cache: CacheHandle) -> std::io::Result<()> {
    let socket = UdpSocket::bind(config.listener_address(Role::Query)?).await?;
    info!(addr = %socket.local_addr()?, "query server listening");

    let mut buf = BytesMut::zeroed(codec::MAX_DATAGRAM_LEN);
    loop {
        let (len, addr) = socket.recv_from(&mut buf).await?;
        let packet = match codec::decode(&buf[..len]) {
            Ok(p) => p,
            Err(err) => {
                debug!(%err, "dropping an unparsable query request");
                continue;
            }
        };
        let cache = cache.clone();
        if let Err(err) = run_guarded(handle_query_request(&socket, &config, &cache, packet, addr)).await {
            error!(%err, "query handler failed");
        }
    }
}

/// Finds the longest JSON-encodable prefix of `landmarks` whose encoding
/// fits within `max_bytes`, via binary search on the element count (spec
/// §4.5 point 4, §9: "must be a binary search on element count... because
/// JSON encoding cost per element is non-uniform").
fn truncate_landmarks_to_fit(landmarks: &[String], max_bytes: usize) -> Option<Vec<String>> {
    if landmarks.is_empty() {
        return None;
    }
    let fits = |count: usize| -> bool {
        serde_json::to_vec(&landmarks[..count])
            .map(|bytes| bytes.len() <= max_bytes)
            .unwrap_or(false)
    };

    let mut lo = 1usize;
    let mut hi = landmarks.len();
    let mut best = 0usize;
    while lo <= hi {
        let mid = lo + (hi - lo) / 2;
        if fits(mid) {
            best = mid;
            lo = mid + 1;
        } else {
            if mid == 0 {
                break;
            }
            hi = mid - 1;
        }
    }
    if best == 0 {
        None
    } else {
        Some(landmarks[..best].to_vec())
    }
}

async fn handle_query_request(
    socket: &UdpSocket,
    config: &ConfigFile,
    cache: &CacheHandle,
    packet: Packet,
    addr: SocketAddr,
) -> Result<(), WipError> {
    if let Err(err) = authenticate(config, Role::Query, &packet) {
        send_error(socket, packet.header.packet_id, packet.header.area_code, &err, addr).await;
        return Ok(());
    }
    if packet.header.packet_type != PacketType::QueryRequest {
        send_error(
            socket,
            packet.header.packet_id,
            packet.header.area_code,
            &WipError::UnknownPacketType(packet.header.packet_type as u8),
            addr,
        )
        .await;
        return Ok(());
    }
    if packet.header.area_code == 0 {
        send_error(
            socket,
            packet.header.packet_id,
            0,
            &WipError::MissingRequiredData("area_code is required".to_string()),
            addr,
        )
        .await;
        return Ok(());
    }

    let area = match cache.get(packet.header.area_code).await? {
        Some(area) => area,
        None => {
            send_error(
                socket,
                packet.header.packet_id,
                packet.header.area_code,
                &WipError::MissingRequiredData("no cached data for this area_code".to_string()),
                addr,
            )
            .await;
            return Ok(());
        }
    };

    let flags = packet.header.flags;
    // Spec §4.5 point 2: all four body bytes are always emitted; fields
    // the request didn't ask for are left zero rather than the body
    // being variably shaped.
    let body = ResponseBody {
        weather_code: if flags.weather { area.weather_code } else { 0 },
        temperature: if flags.temperature {
            area.temperature.clamp(i8::MIN as i32, i8::MAX as i32) as i8
        } else {
            0
        },
        precipitation_prob: if flags.pop { area.precipitation_prob } else { 0 },
    };

    let mut extended = Vec::new();
    if flags.alert && !area.warnings.is_empty() {
        extended.push(ExtendedField::Alert(area.warnings.clone()));
    }
    if flags.disaster && !area.disaster.is_empty() {
        extended.push(ExtendedField::Disaster(area.disaster.clone()));
    }
    if let Some(landmarks) = &area.landmarks {
        if let Some(fitted) = truncate_landmarks_to_fit(landmarks, codec::extended::MAX_RECORD_VALUE_LEN) {
            extended.push(ExtendedField::Landmarks(fitted));
        }
    }

    let response = Packet {
        header: Header {
            packet_id: packet.header.packet_id,
            packet_type: PacketType::QueryResponse,
            flags,
            ex_flag: !extended.is_empty(),
            day: packet.header.day,
            timestamp: now_secs(),
            area_code: packet.header.area_code,
        },
        body: body.to_bytes().to_vec(),
        extended,
    };
    send_packet(socket, &response, addr).await;
    Ok(())
}

// ---------------------------------------------------------------------
// Report server
// ---------------------------------------------------------------------

/// An externally supplied enumeration of allowed `weather_code` values
/// (spec §4.6's "implementation-defined list loaded from a
/// collaborator"). Absent a table, any code is accepted — the
/// enumeration itself is an open question the spec explicitly defers.
#[derive(Debug, Clone, Default)]
pub struct WeatherCodeTable {
    allowed: Option<std::collections::HashSet<u16>>,
}

impl WeatherCodeTable {
    fn accepts(&self, code: u16) -> bool {
        match &self.allowed {
            Some(set) => set.contains(&code),
            None => true,
        }
    }
}

async fn load_weather_code_table(path: &Option<String>) -> WeatherCodeTable {
    let Some(path) = path else {
        return WeatherCodeTable::default();
    };
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(err) => {
            warn!(%err, %path, "failed to read weather-code table, accepting any code");
            return WeatherCodeTable::default();
        }
    };
    let mut allowed = std::collections::HashSet::new();
    for line in contents.lines() {
        if let Some(caps) = wip_validators::WEATHER_CODE_TABLE_LINE.captures(line) {
            if let Ok(code) = caps["code"].parse::<u16>() {
                allowed.insert(code);
            }
        }
    }
    WeatherCodeTable {
        allowed: Some(allowed),
    }
}

#[instrument(level = "info", skip_all)]
pub async fn report_server(config: CowCellReadTxn<ConfigFile>, cache: CacheHandle) -> std::io::Result<()> {
    let socket = UdpSocket::bind(config.listener_address(Role::Report)?).await?;
    info!(addr = %socket.local_addr()?, "report server listening");
    let codes = load_weather_code_table(&config.weather_code_table_path).await;

    let mut buf = BytesMut::zeroed(codec::MAX_DATAGRAM_LEN);
    loop {
        let (len, addr) = socket.recv_from(&mut buf).await?;
        let packet = match codec::decode(&buf[..len]) {
            Ok(p) => p,
            Err(err) => {
                debug!(%err, "dropping an unparsable report request");
                continue;
            }
        };
        let cache = cache.clone();
        if let Err(err) = run_guarded(handle_report_request(&socket, &config, &cache, &codes, packet, addr)).await {
            error!(%err, "report handler failed");
        }
    }
}

async fn handle_report_request(
    socket: &UdpSocket,
    config: &ConfigFile,
    cache: &CacheHandle,
    codes: &WeatherCodeTable,
    packet: Packet,
    addr: SocketAddr,
) -> Result<(), WipError> {
    if let Err(err) = authenticate(config, Role::Report, &packet) {
        send_error(socket, packet.header.packet_id, packet.header.area_code, &err, addr).await;
        return Ok(());
    }
    if packet.header.packet_type != PacketType::ReportRequest {
        send_error(
            socket,
            packet.header.packet_id,
            packet.header.area_code,
            &WipError::UnknownPacketType(packet.header.packet_type as u8),
            addr,
        )
        .await;
        return Ok(());
    }
    if packet.header.area_code == 0 {
        send_error(
            socket,
            packet.header.packet_id,
            0,
            &WipError::MissingRequiredData("area_code is required".to_string()),
            addr,
        )
        .await;
        return Ok(());
    }

    let body = match packet.response_body() {
        Ok(body) => body,
        Err(err) => {
            send_error(socket, packet.header.packet_id, packet.header.area_code, &err, addr).await;
            return Ok(());
        }
    };

    // Report's validation (spec §4.6): temperature within [-100, 100]°C
    // (always true once decoded from the wire's 0..=200 byte range, but
    // checked explicitly since a future wider body format could violate
    // it), pop within [0, 100], weather_code in the allowed enumeration.
    if !(-100..=100).contains(&(body.temperature as i32)) {
        send_error(
            socket,
            packet.header.packet_id,
            packet.header.area_code,
            &WipError::InvalidValue(format!("temperature {} outside [-100, 100]", body.temperature)),
            addr,
        )
        .await;
        return Ok(());
    }
    if body.precipitation_prob > 100 {
        send_error(
            socket,
            packet.header.packet_id,
            packet.header.area_code,
            &WipError::InvalidValue(format!("precipitation_prob {} outside [0, 100]", body.precipitation_prob)),
            addr,
        )
        .await;
        return Ok(());
    }
    if !codes.accepts(body.weather_code) {
        send_error(
            socket,
            packet.header.packet_id,
            packet.header.area_code,
            &WipError::InvalidValue(format!("weather_code {} not in the allowed table", body.weather_code)),
            addr,
        )
        .await;
        return Ok(());
    }

    let payload = ReportPayload {
        weather_code: body.weather_code,
        temperature: body.temperature as i32,
        precipitation_prob: body.precipitation_prob,
        warnings: find_alert(&packet.extended),
        disaster: find_disaster(&packet.extended),
        timestamp: packet.header.timestamp,
        source_origin: Some(addr.to_string()),
    };

    let merged = cache.merge_report(packet.header.area_code, payload).await?;

    let response = Packet {
        header: Header {
            packet_id: packet.header.packet_id,
            packet_type: PacketType::ReportResponse,
            flags: packet.header.flags,
            ex_flag: false,
            day: packet.header.day,
            timestamp: now_secs(),
            area_code: packet.header.area_code,
        },
        body: ResponseBody {
            weather_code: merged.weather_code,
            temperature: merged.temperature.clamp(i8::MIN as i32, i8::MAX as i32) as i8,
            precipitation_prob: merged.precipitation_prob,
        }
        .to_bytes()
        .to_vec(),
        extended: vec![],
    };
    send_packet(socket, &response, addr).await;
    Ok(())
}

// ---------------------------------------------------------------------
// Fleet: spawns every role as a task, for `wip serve all` / tests.
// ---------------------------------------------------------------------

/// A running set of role tasks plus the cache actor, mirroring goatns's
/// `Servers` bundle of `JoinHandle`s (`src/servers.rs`'s `Servers`
/// struct), generalized from DNS's fixed {datastore, udp, tcp, api} set
/// to WIP's four roles plus the cache.
pub struct Fleet {
    pub cache_join: JoinHandle<()>,
    pub role_joins: HashMap<Role, JoinHandle<std::io::Result<()>>>,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl Fleet {
    /// Spawns every role named in `roles`, all sharing one cache actor.
    ///
    /// Takes the owning `CowCell` rather than a single read-snapshot:
    /// each spawned role calls `config.read().await` for its own
    /// snapshot, the same pattern goatns's own startup code uses
    /// (`tokio::spawn(udp_server(config.read().await, ...))`) rather than
    /// fanning one snapshot out to every task.
    pub async fn spawn(
        config: &CowCell<ConfigFile>,
        roles: &[Role],
        cache_snapshot_path: Option<String>,
    ) -> Fleet {
        let (cache, cache_join) = crate::cache::spawn(cache_snapshot_path);
        let (shutdown_tx, _) = broadcast::channel(1);

        let mut role_joins = HashMap::new();
        for &role in roles {
            let join: JoinHandle<std::io::Result<()>> = match role {
                Role::Weather => tokio::spawn(weather_server(config.read().await)),
                Role::Location => tokio::spawn(location_server(config.read().await)),
                Role::Query => tokio::spawn(query_server(config.read().await, cache.clone())),
                Role::Report => tokio::spawn(report_server(config.read().await, cache.clone())),
            };
            role_joins.insert(role, join);
        }

        Fleet {
            cache_join,
            role_joins,
            shutdown_tx,
        }
    }

    /// True once every spawned role task has exited (normally only on
    /// error, since each role's loop runs forever otherwise).
    pub fn any_finished(&self) -> bool {
        self.role_joins.values().any(|j| j.is_finished())
    }
}
