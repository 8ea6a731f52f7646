//! Handshake strategy
//!
//! A node that only knows the cluster registration token announces itself
//! with `X-Cattle-*` headers. The server keeps one record per machine id and
//! waits, bounded by the handshake timeout, for something to stamp the
//! record with the machine it belongs to. A matched record is deleted so
//! it can resolve only once; an unmatched record is left in place for the
//! caller's retry and swept when it grows stale.
//!
//! Every wait is a [`HandshakeState`] machine driven by record events, the
//! deadline and cancellation. Concurrent requests for the same record share
//! one wait task.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::core::{DynamicObject, ObjectMeta};
use kube::ResourceExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trellis_common::labels::{
    MACHINE_NAMESPACE_LABEL, MACHINE_NAME_LABEL, MACHINE_REQUEST_LABEL,
    MACHINE_REQUEST_SECRET_TYPE,
};
use trellis_common::naming::sha256_hex;
use trellis_common::retry::retry_on_conflict;
use trellis_common::store::{selector, typed, ObjectStore, WatchEvent};
use trellis_common::{Error, Result};

use super::matcher::MachineIdentity;

/// Required header carrying the machine's self-reported id
pub const MACHINE_ID_HEADER: &str = "x-cattle-id";

/// Prefix of identifying headers
const HEADER_PREFIX: &str = "x-cattle-";

/// Record key holding the announced headers, JSON
pub const RECORD_DATA_KEY: &str = "data";

/// Name of the record for a machine id
pub fn record_name(machine_id: &str) -> String {
    format!("custom-{}", &sha256_hex(machine_id.as_bytes())[..12])
}

/// Identifying headers of a handshake request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Value of `X-Cattle-Id`
    pub id: String,
    /// Every `X-Cattle-*` header, prefix stripped and lowercased
    pub headers: BTreeMap<String, String>,
}

impl HandshakeRequest {
    /// Collect identifying headers; `None` without a machine id
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let collected: BTreeMap<String, String> = headers
            .iter()
            .filter_map(|(name, value)| {
                let key = name.as_str().strip_prefix(HEADER_PREFIX)?;
                Some((key.to_string(), value.to_str().ok()?.to_string()))
            })
            .collect();
        let id = collected.get("id").filter(|id| !id.is_empty())?.clone();
        Some(Self {
            id,
            headers: collected,
        })
    }
}

/// Where one handshake wait stands
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    /// Record exists, no machine stamped yet
    Waiting,
    /// Record stamped with a machine
    Matched(MachineIdentity),
    /// Deadline passed first
    TimedOut,
    /// Server shutdown, watch failure or record removed underneath
    Cancelled,
}

/// Inputs to a handshake wait
#[derive(Clone, Debug)]
pub enum HandshakeEvent {
    /// Current record content, with the machine it names if any
    Observed(Option<MachineIdentity>),
    /// Record no longer exists
    RecordGone,
    /// Wait deadline reached
    Deadline,
    /// Shutdown or transport failure
    Cancel,
}

impl HandshakeState {
    /// Whether the wait is over
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Waiting)
    }

    /// Apply an event; only `Waiting` ever transitions
    pub fn advance(self, event: HandshakeEvent) -> Self {
        match (self, event) {
            (Self::Waiting, HandshakeEvent::Observed(Some(identity))) => Self::Matched(identity),
            (Self::Waiting, HandshakeEvent::Observed(None)) => Self::Waiting,
            (Self::Waiting, HandshakeEvent::Deadline) => Self::TimedOut,
            (Self::Waiting, HandshakeEvent::RecordGone | HandshakeEvent::Cancel) => Self::Cancelled,
            (terminal, _) => terminal,
        }
    }
}

fn identity_of(record: &DynamicObject) -> Option<MachineIdentity> {
    let labels = record.metadata.labels.as_ref()?;
    let name = labels.get(MACHINE_NAME_LABEL).filter(|n| !n.is_empty())?;
    let namespace = labels
        .get(MACHINE_NAMESPACE_LABEL)
        .cloned()
        .or_else(|| record.metadata.namespace.clone())
        .unwrap_or_default();
    Some(MachineIdentity {
        namespace,
        name: name.clone(),
    })
}

type RecordKey = (String, String);

/// Handshake records and their in-flight waits
pub struct Handshakes {
    store: Arc<dyn ObjectStore>,
    timeout: Duration,
    cancel: CancellationToken,
    inflight: Arc<DashMap<RecordKey, Arc<watch::Sender<HandshakeState>>>>,
}

impl Handshakes {
    /// Handshakes over `store`, each wait bounded by `timeout`
    pub fn new(store: Arc<dyn ObjectStore>, timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            store,
            timeout,
            cancel,
            inflight: Arc::new(DashMap::new()),
        }
    }

    /// Resolve a handshake in `namespace` to the machine stamped on its record
    pub async fn resolve(&self, namespace: &str, request: &HandshakeRequest) -> Result<MachineIdentity> {
        let name = record_name(&request.id);
        self.ensure_record(namespace, &name, request).await?;

        let mut receiver = self.subscribe(namespace, &name);
        let state = receiver
            .wait_for(HandshakeState::is_terminal)
            .await
            .map(|state| (*state).clone())
            .map_err(|_| Error::NotMatched { id: name.clone() })?;

        match state {
            HandshakeState::Matched(identity) => Ok(identity),
            HandshakeState::TimedOut => Err(Error::HandshakeTimeout { id: name }),
            HandshakeState::Waiting | HandshakeState::Cancelled => Err(Error::NotMatched { id: name }),
        }
    }

    /// Number of callers waiting on a machine's record
    pub fn waiters(&self, namespace: &str, machine_id: &str) -> usize {
        self.inflight
            .get(&(namespace.to_string(), record_name(machine_id)))
            .map_or(0, |sender| sender.receiver_count())
    }

    async fn ensure_record(&self, namespace: &str, name: &str, request: &HandshakeRequest) -> Result<()> {
        let store = self.store.as_ref();
        if typed::get::<Secret>(store, namespace, name).await?.is_some() {
            return Ok(());
        }
        let record = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    MACHINE_REQUEST_LABEL.to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            },
            type_: Some(MACHINE_REQUEST_SECRET_TYPE.to_string()),
            data: Some(BTreeMap::from([(
                RECORD_DATA_KEY.to_string(),
                ByteString(serde_json::to_vec(&request.headers)?),
            )])),
            ..Default::default()
        };
        match typed::create(store, &record).await {
            Ok(_) => {
                info!(record = %name, machine_id = %request.id, "created handshake record");
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn subscribe(&self, namespace: &str, name: &str) -> watch::Receiver<HandshakeState> {
        let key = (namespace.to_string(), name.to_string());
        match self.inflight.entry(key.clone()) {
            Entry::Occupied(entry) => entry.get().subscribe(),
            Entry::Vacant(entry) => {
                let (sender, receiver) = watch::channel(HandshakeState::Waiting);
                let sender = Arc::new(sender);
                entry.insert(sender.clone());
                tokio::spawn(wait_for_match(
                    self.store.clone(),
                    key,
                    self.timeout,
                    self.cancel.child_token(),
                    sender,
                    self.inflight.clone(),
                ));
                receiver
            }
        }
    }
}

async fn wait_for_match(
    store: Arc<dyn ObjectStore>,
    key: RecordKey,
    timeout: Duration,
    cancel: CancellationToken,
    sender: Arc<watch::Sender<HandshakeState>>,
    inflight: Arc<DashMap<RecordKey, Arc<watch::Sender<HandshakeState>>>>,
) {
    let (namespace, name) = &key;
    let state = watch_record(store.as_ref(), namespace, name, timeout, &cancel).await;

    // Leave the map before touching the record: a later request either
    // starts its own wait or finds no record and creates a fresh one
    inflight.remove(&key);

    match &state {
        HandshakeState::Matched(identity) => {
            // Single use: the next request with this id starts over
            if let Err(e) = typed::delete::<Secret>(store.as_ref(), namespace, name).await {
                warn!(record = %name, error = %e, "failed to delete matched handshake record");
            }
            info!(record = %name, machine = %identity.name, "handshake matched");
        }
        other => debug!(record = %name, state = ?other, "handshake wait ended unmatched"),
    }

    sender.send_replace(state);
}

async fn watch_record(
    store: &dyn ObjectStore,
    namespace: &str,
    name: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> HandshakeState {
    let state = HandshakeState::Waiting;
    let mut events = match store
        .watch(&typed::api_resource::<Secret>(), namespace, name)
        .await
    {
        Ok(events) => events,
        Err(e) => {
            warn!(record = %name, error = %e, "cannot watch handshake record");
            return state.advance(HandshakeEvent::Cancel);
        }
    };

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut state = state;
    while !state.is_terminal() {
        let event = tokio::select! {
            _ = &mut deadline => HandshakeEvent::Deadline,
            _ = cancel.cancelled() => HandshakeEvent::Cancel,
            next = events.next() => match next {
                Some(Ok(WatchEvent::Applied(record))) => HandshakeEvent::Observed(identity_of(&record)),
                Some(Ok(WatchEvent::Deleted(_))) | None => HandshakeEvent::RecordGone,
                Some(Err(e)) => {
                    warn!(record = %name, error = %e, "handshake watch failed");
                    HandshakeEvent::Cancel
                }
            },
        };
        state = state.advance(event);
    }
    state
}

/// Stamp a handshake record with the machine it belongs to
pub async fn stamp(
    store: &dyn ObjectStore,
    namespace: &str,
    machine_id: &str,
    machine: &MachineIdentity,
) -> Result<()> {
    let name = record_name(machine_id);
    let record_key = name.as_str();
    retry_on_conflict("stamp_handshake_record", move || async move {
        let mut record = typed::get::<Secret>(store, namespace, record_key)
            .await?
            .ok_or_else(|| Error::not_found("Secret", format!("{}/{}", namespace, record_key)))?;
        let labels = record.labels_mut();
        labels.insert(MACHINE_NAME_LABEL.to_string(), machine.name.clone());
        labels.insert(MACHINE_NAMESPACE_LABEL.to_string(), machine.namespace.clone());
        typed::replace(store, &record).await
    })
    .await?;
    info!(record = %name, machine = %machine.name, "stamped handshake record");
    Ok(())
}

/// Delete handshake records older than `ttl`, returning how many went
pub async fn sweep(store: &dyn ObjectStore, ttl: Duration) -> Result<usize> {
    let records = typed::list::<Secret>(store, "", &selector(&[(MACHINE_REQUEST_LABEL, "true")])).await?;
    let now = Utc::now();
    let mut removed = 0;
    for record in records {
        let stale = record
            .metadata
            .creation_timestamp
            .as_ref()
            .and_then(|created| (now - created.0).to_std().ok())
            .is_some_and(|age| age >= ttl);
        if stale
            && typed::delete::<Secret>(store, &record.namespace().unwrap_or_default(), &record.name_any())
                .await?
        {
            removed += 1;
        }
    }
    if removed > 0 {
        info!(removed, "swept stale handshake records");
    }
    Ok(removed)
}

/// Sweep stale records every `interval` until cancelled
pub async fn run_sweeper(
    store: Arc<dyn ObjectStore>,
    ttl: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(e) = sweep(store.as_ref(), ttl).await {
                    warn!(error = %e, "handshake sweep failed");
                }
            }
        }
    }
}
