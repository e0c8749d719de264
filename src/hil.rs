//! Human-in-the-loop request orchestration
//!
//! Tools that need a human decision park a request here and return a
//! structured response carrying its id. The human-facing API later moves the
//! request to a terminal state; a retried tool call with the identical
//! `(user, tool, arguments)` fingerprint then observes the grant and
//! proceeds.
//!
//! State machine: pending -> approved | rejected | submitted | cancelled,
//! with automatic expiry. Terminal states are sticky.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum HilError {
    #[error("Request not found: {0}")]
    NotFound(String),

    #[error("Request {id} is already {state}")]
    AlreadyDecided { id: String, state: HilState },

    #[error("Invalid decision {decision} for request kind {kind}")]
    InvalidDecision { decision: String, kind: HilKind },
}

pub type Result<T> = std::result::Result<T, HilError>;

/// Interaction kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HilKind {
    Authorization,
    Input,
    Review,
    InputWithAuthorization,
}

impl fmt::Display for HilKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HilKind::Authorization => write!(f, "authorization"),
            HilKind::Input => write!(f, "input"),
            HilKind::Review => write!(f, "review"),
            HilKind::InputWithAuthorization => write!(f, "input_with_authorization"),
        }
    }
}

/// Request lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HilState {
    Pending,
    Approved,
    Rejected,
    Submitted,
    Cancelled,
    Expired,
}

impl HilState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, HilState::Pending)
    }
}

impl fmt::Display for HilState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HilState::Pending => write!(f, "pending"),
            HilState::Approved => write!(f, "approved"),
            HilState::Rejected => write!(f, "rejected"),
            HilState::Submitted => write!(f, "submitted"),
            HilState::Cancelled => write!(f, "cancelled"),
            HilState::Expired => write!(f, "expired"),
        }
    }
}

/// One parked request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HilRequest {
    pub id: String,
    pub kind: HilKind,
    pub user_id: String,
    pub tool_name: String,
    pub action: String,
    pub risk_level: String,
    pub options: Vec<String>,
    pub payload: JsonValue,
    pub fingerprint: String,
    pub state: HilState,
    pub submission: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl HilRequest {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.state == HilState::Pending && self.expires_at <= now
    }
}

/// What the gate told the caller
#[derive(Debug, Clone)]
pub enum GateDecision {
    /// An unexpired approval exists; proceed.
    Granted,
    /// A request is pending (possibly just created); caller must wait for a
    /// human decision.
    PendingRequest(HilRequest),
    /// The matching request was rejected; surfaced to the caller.
    Rejected(HilRequest),
}

/// Deterministic fingerprint over `(user, tool, arguments)`.
///
/// Arguments are hashed structurally with object keys visited in sorted
/// order, so two calls whose JSON maps differ only in key order fingerprint
/// identically.
pub fn fingerprint(user: &str, tool: &str, arguments: &JsonValue) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(user.as_bytes());
    hasher.update(b"\x00");
    hasher.update(tool.as_bytes());
    hasher.update(b"\x00");
    hash_value(&mut hasher, arguments);
    hasher.finalize().to_hex().to_string()
}

/// Feed one JSON value into the hasher. Strings and keys are length-prefixed
/// so adjacent values cannot collide by concatenation.
fn hash_value(hasher: &mut blake3::Hasher, value: &JsonValue) {
    match value {
        JsonValue::Null => {
            hasher.update(b"z");
        }
        JsonValue::Bool(flag) => {
            hasher.update(if *flag { b"t" } else { b"f" });
        }
        JsonValue::Number(number) => {
            hasher.update(b"#");
            hasher.update(number.to_string().as_bytes());
        }
        JsonValue::String(text) => {
            hasher.update(b"s");
            hasher.update(&(text.len() as u64).to_le_bytes());
            hasher.update(text.as_bytes());
        }
        JsonValue::Array(items) => {
            hasher.update(b"[");
            for item in items {
                hash_value(hasher, item);
            }
            hasher.update(b"]");
        }
        JsonValue::Object(fields) => {
            let mut keys: Vec<&String> = fields.keys().collect();
            keys.sort();
            hasher.update(b"{");
            for key in keys {
                hasher.update(&(key.len() as u64).to_le_bytes());
                hasher.update(key.as_bytes());
                hash_value(hasher, &fields[key.as_str()]);
            }
            hasher.update(b"}");
        }
    }
}

/// In-process HIL request broker
pub struct HilService {
    requests: DashMap<String, HilRequest>,
    expiry: ChronoDuration,
}

impl HilService {
    pub fn new(expiry: Duration) -> Self {
        HilService {
            requests: DashMap::new(),
            expiry: ChronoDuration::seconds(expiry.as_secs() as i64),
        }
    }

    /// Authorization gate for HIGH-security tools.
    ///
    /// Idempotence: the same fingerprint returns the same pending request;
    /// an unexpired approval grants; a rejection stays visible until the
    /// caller reissues, which creates a fresh pending request.
    pub fn authorize(
        &self,
        user_id: &str,
        tool_name: &str,
        arguments: &JsonValue,
        action: &str,
        risk_level: &str,
    ) -> GateDecision {
        let fp = fingerprint(user_id, tool_name, arguments);
        let now = Utc::now();

        let mut rejected = None;
        for entry in self.requests.iter() {
            if entry.fingerprint != fp {
                continue;
            }
            match entry.state {
                HilState::Approved if entry.expires_at > now => return GateDecision::Granted,
                HilState::Pending if !entry.expired(now) => {
                    return GateDecision::PendingRequest(entry.clone())
                }
                HilState::Rejected => rejected = Some(entry.clone()),
                _ => {}
            }
        }

        if let Some(rejected) = rejected.take() {
            // One rejection is reported once; reissuing afterwards starts a
            // fresh request.
            self.requests.remove(&rejected.id);
            return GateDecision::Rejected(rejected);
        }

        let request = self.create(
            HilKind::Authorization,
            user_id,
            tool_name,
            action,
            risk_level,
            vec!["approve".to_string(), "reject".to_string()],
            json!({"arguments": arguments}),
            fp,
        );
        GateDecision::PendingRequest(request)
    }

    /// Park an input request (optionally combined with authorization).
    #[allow(clippy::too_many_arguments)]
    pub fn request_input(
        &self,
        kind: HilKind,
        user_id: &str,
        tool_name: &str,
        prompt: &str,
        options: Vec<String>,
        payload: JsonValue,
    ) -> HilRequest {
        let fp = fingerprint(user_id, tool_name, &payload);
        self.create(kind, user_id, tool_name, prompt, "medium", options, payload, fp)
    }

    #[allow(clippy::too_many_arguments)]
    fn create(
        &self,
        kind: HilKind,
        user_id: &str,
        tool_name: &str,
        action: &str,
        risk_level: &str,
        options: Vec<String>,
        payload: JsonValue,
        fingerprint: String,
    ) -> HilRequest {
        let now = Utc::now();
        let request = HilRequest {
            id: Uuid::new_v4().to_string(),
            kind,
            user_id: user_id.to_string(),
            tool_name: tool_name.to_string(),
            action: action.to_string(),
            risk_level: risk_level.to_string(),
            options,
            payload,
            fingerprint,
            state: HilState::Pending,
            submission: None,
            created_at: now,
            decided_at: None,
            expires_at: now + self.expiry,
        };
        self.requests.insert(request.id.clone(), request.clone());
        info!(
            request_id = %request.id,
            kind = %request.kind,
            tool = %request.tool_name,
            "hil request created"
        );
        request
    }

    pub fn get(&self, id: &str) -> Result<HilRequest> {
        let mut entry = self
            .requests
            .get_mut(id)
            .ok_or_else(|| HilError::NotFound(id.to_string()))?;
        let now = Utc::now();
        if entry.expired(now) {
            entry.state = HilState::Expired;
            entry.decided_at = Some(now);
        }
        Ok(entry.clone())
    }

    /// Move a request to a terminal state. Terminal states are sticky.
    pub fn decide(
        &self,
        id: &str,
        decision: &str,
        submission: Option<JsonValue>,
    ) -> Result<HilRequest> {
        let mut entry = self
            .requests
            .get_mut(id)
            .ok_or_else(|| HilError::NotFound(id.to_string()))?;

        let now = Utc::now();
        if entry.expired(now) {
            entry.state = HilState::Expired;
            entry.decided_at = Some(now);
        }
        if entry.state.is_terminal() {
            return Err(HilError::AlreadyDecided {
                id: id.to_string(),
                state: entry.state,
            });
        }

        let next = match (entry.kind, decision) {
            (HilKind::Authorization, "approve") => HilState::Approved,
            (HilKind::Authorization, "reject") => HilState::Rejected,
            (HilKind::Input | HilKind::InputWithAuthorization, "submit") => HilState::Submitted,
            (HilKind::Input | HilKind::InputWithAuthorization, "cancel") => HilState::Cancelled,
            (HilKind::Review, "approve") => HilState::Approved,
            (HilKind::Review, "reject") => HilState::Rejected,
            (kind, other) => {
                return Err(HilError::InvalidDecision {
                    decision: other.to_string(),
                    kind,
                })
            }
        };

        entry.state = next;
        entry.decided_at = Some(now);
        if next == HilState::Submitted {
            entry.submission = submission;
        }

        info!(request_id = %id, state = %next, "hil request decided");
        Ok(entry.clone())
    }

    /// Submitted input for a fingerprint, consumed by the retried call.
    pub fn take_submission(&self, fp: &str) -> Option<JsonValue> {
        let id = self.requests.iter().find_map(|entry| {
            (entry.fingerprint == fp && entry.state == HilState::Submitted)
                .then(|| entry.id.clone())
        })?;
        self.requests
            .remove(&id)
            .and_then(|(_, request)| request.submission)
    }

    /// Transition overdue pending requests to expired.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut expired = 0;
        for mut entry in self.requests.iter_mut() {
            if entry.expired(now) {
                entry.state = HilState::Expired;
                entry.decided_at = Some(now);
                expired += 1;
            }
        }
        if expired > 0 {
            warn!(expired, "hil requests expired");
        }
        expired
    }

    /// Periodic expiry sweep until cancelled.
    pub async fn run_sweeper(self: std::sync::Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.sweep_expired();
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// Structured response returned to the caller when a tool is gated.
pub fn gated_response(request: &HilRequest) -> JsonValue {
    let status = match request.kind {
        HilKind::Authorization => "authorization_requested",
        _ => "human_input_requested",
    };
    json!({
        "status": status,
        "hil_type": request.kind,
        "request_id": request.id,
        "options": request.options,
        "data": request.payload,
    })
}
