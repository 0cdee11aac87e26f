//! The shared weather store (spec §3 "CachedArea entity", §4.7).
//!
//! A single-writer actor owns the map and is reached through a cloneable
//! [`CacheHandle`] — the same shape goatns uses for its datastore manager
//! (an `mpsc::Sender<Command>` paired with `oneshot` reply channels), just
//! backed by an in-memory `HashMap` instead of a SQL pool, since the cache
//! contract (spec §4.7) only demands atomic get/put keyed by area code.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::error::WipError;

/// The record the Query server reads and the Report server writes (spec
/// §3 "CachedArea entity").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CachedArea {
    pub weather_code: u16,
    pub temperature: i32,
    pub precipitation_prob: u8,
    pub warnings: Vec<String>,
    pub disaster: Vec<String>,
    pub landmarks: Option<Vec<String>>,
    pub last_updated_ts: u64,
    pub source_origin: Option<String>,
}

/// What a Report packet carries into a merge (spec §4.6).
#[derive(Debug, Clone, PartialEq)]
pub struct ReportPayload {
    pub weather_code: u16,
    pub temperature: i32,
    pub precipitation_prob: u8,
    pub warnings: Vec<String>,
    pub disaster: Vec<String>,
    pub timestamp: u64,
    pub source_origin: Option<String>,
}

/// Appends `incoming` onto `existing`, keeping the first occurrence of
/// each string and preserving insertion order across merges (spec §4.6).
fn union_preserving_order(existing: &mut Vec<String>, incoming: &[String]) {
    for item in incoming {
        if !existing.contains(item) {
            existing.push(item.clone());
        }
    }
}

impl CachedArea {
    /// Applies Report's merge semantics in place (spec §4.6): scalar
    /// fields overwrite, list fields set-union preserving order,
    /// `last_updated_ts` takes the max, `source_origin` overwrites.
    pub fn merge_report(&mut self, incoming: ReportPayload) {
        self.weather_code = incoming.weather_code;
        self.temperature = incoming.temperature;
        self.precipitation_prob = incoming.precipitation_prob;
        union_preserving_order(&mut self.warnings, &incoming.warnings);
        union_preserving_order(&mut self.disaster, &incoming.disaster);
        self.last_updated_ts = self.last_updated_ts.max(incoming.timestamp);
        self.source_origin = incoming.source_origin;
    }

    fn from_report(incoming: ReportPayload) -> CachedArea {
        CachedArea {
            weather_code: incoming.weather_code,
            temperature: incoming.temperature,
            precipitation_prob: incoming.precipitation_prob,
            warnings: incoming.warnings,
            disaster: incoming.disaster,
            landmarks: None,
            last_updated_ts: incoming.timestamp,
            source_origin: incoming.source_origin,
        }
    }
}

enum Command {
    Get {
        area_code: u32,
        reply: oneshot::Sender<Option<CachedArea>>,
    },
    Put {
        area_code: u32,
        area: CachedArea,
        reply: oneshot::Sender<()>,
    },
    MergeReport {
        area_code: u32,
        payload: ReportPayload,
        reply: oneshot::Sender<CachedArea>,
    },
    Shutdown,
}

/// A cheaply cloneable front for the cache actor. Every handler task
/// shares one of these; the actor serializes access, so callers never see
/// a torn read during a concurrent Report write.
#[derive(Clone)]
pub struct CacheHandle {
    tx: mpsc::Sender<Command>,
}

impl CacheHandle {
    pub async fn get(&self, area_code: u32) -> Result<Option<CachedArea>, WipError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Get { area_code, reply })
            .await
            .map_err(|_| WipError::ServerError("cache actor is gone".to_string()))?;
        rx.await
            .map_err(|_| WipError::ServerError("cache actor dropped the reply".to_string()))
    }

    pub async fn put(&self, area_code: u32, area: CachedArea) -> Result<(), WipError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Put {
                area_code,
                area,
                reply,
            })
            .await
            .map_err(|_| WipError::ServerError("cache actor is gone".to_string()))?;
        rx.await
            .map_err(|_| WipError::ServerError("cache actor dropped the reply".to_string()))
    }

    /// Applies [`CachedArea::merge_report`] for `area_code`, creating the
    /// entry if this is its first Report, and returns the post-merge
    /// record (a Report's reply doesn't need it, but tests and future
    /// callers do).
    pub async fn merge_report(
        &self,
        area_code: u32,
        payload: ReportPayload,
    ) -> Result<CachedArea, WipError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::MergeReport {
                area_code,
                payload,
                reply,
            })
            .await
            .map_err(|_| WipError::ServerError("cache actor is gone".to_string()))?;
        rx.await
            .map_err(|_| WipError::ServerError("cache actor dropped the reply".to_string()))
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

/// Spawns the cache actor, optionally loading a JSON snapshot first, and
/// returns a handle plus the actor's join handle so callers can await a
/// clean shutdown (and a final snapshot write) before exiting.
pub fn spawn(snapshot_path: Option<String>) -> (CacheHandle, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(256);
    let handle = CacheHandle { tx };

    let join = tokio::spawn(async move {
        let mut store: HashMap<u32, CachedArea> = match &snapshot_path {
            Some(path) => load_snapshot(path).await,
            None => HashMap::new(),
        };

        while let Some(command) = rx.recv().await {
            match command {
                Command::Get { area_code, reply } => {
                    let _ = reply.send(store.get(&area_code).cloned());
                }
                Command::Put {
                    area_code,
                    area,
                    reply,
                } => {
                    store.insert(area_code, area);
                    let _ = reply.send(());
                }
                Command::MergeReport {
                    area_code,
                    payload,
                    reply,
                } => {
                    let area = store
                        .entry(area_code)
                        .or_insert_with(|| CachedArea::from_report(payload.clone()));
                    area.merge_report(payload);
                    let _ = reply.send(area.clone());
                }
                Command::Shutdown => break,
            }
        }

        if let Some(path) = &snapshot_path {
            save_snapshot(path, &store).await;
        }
        info!(entries = store.len(), "cache actor shut down");
    });

    (handle, join)
}

async fn load_snapshot(path: &str) -> HashMap<u32, CachedArea> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(store) => store,
            Err(err) => {
                warn!(%path, %err, "failed to parse cache snapshot, starting empty");
                HashMap::new()
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
        Err(err) => {
            warn!(%path, %err, "failed to read cache snapshot, starting empty");
            HashMap::new()
        }
    }
}

async fn save_snapshot(path: &str, store: &HashMap<u32, CachedArea>) {
    match serde_json::to_string_pretty(store) {
        Ok(json) => {
            if let Err(err) = tokio::fs::write(path, json).await {
                error!(%path, %err, "failed to persist cache snapshot");
            }
        }
        Err(err) => error!(%err, "failed to serialize cache snapshot"),
    }
}
