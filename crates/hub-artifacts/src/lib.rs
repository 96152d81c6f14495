// SPDX-License-Identifier: MIT OR Apache-2.0
//! Artifact records and the one-shot ticketed upload/download side channel.
//!
//! [`ArtifactStore`] owns the relational side of an artifact's lifecycle
//! (record creation, finalization, sharing, task attachment). [`TicketIssuer`]
//! is the in-memory, single-use token map that authorizes exactly one
//! `POST /artifacts/upload/:id` or `GET /artifacts/download/:id` call; tickets
//! never touch the relational store and are swept on expiry by maintenance.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hub_core::{ArtifactRecord, ArtifactShare, ArtifactTicket, TaskArtifact, TicketKind};
use hub_error::{ErrorCode, HubError, HubResult};
use hub_store::{now_str, parse_ts, Store};
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

const MIN_TICKET_TTL_SECS: u64 = 30;
const MAX_TICKET_TTL_SECS: u64 = 86_400;

/// Clamps a caller-supplied ticket TTL to `[30s, 86400s]`.
pub fn normalize_ticket_ttl_secs(requested: u64) -> u64 {
    requested.clamp(MIN_TICKET_TTL_SECS, MAX_TICKET_TTL_SECS)
}

/// Fields a caller supplies to register a new artifact record before any
/// bytes exist.
#[derive(Debug, Clone, Default)]
pub struct CreateArtifactRequest {
    /// Agent creating the record; becomes the implicit access grantee.
    pub created_by: String,
    /// File name as the uploader intends to call it.
    pub name: String,
    /// Isolation tag; empty normalizes to `"default"`.
    pub namespace: Option<String>,
    /// Optional free-form summary.
    pub summary: Option<String>,
    /// Optional explicit expiry; absent means the config-level default TTL
    /// applies during maintenance sweeps.
    pub ttl_expires_at: Option<DateTime<Utc>>,
}

/// Fields supplied when the uploader finishes writing bytes and finalizes
/// the record.
#[derive(Debug, Clone)]
pub struct FinalizeUploadRequest {
    /// Artifact being finalized.
    pub artifact_id: Uuid,
    /// Final size in bytes.
    pub size_bytes: u64,
    /// SHA-256 of the finalized bytes, lowercase hex.
    pub sha256: String,
    /// Server-side storage path of the finalized bytes.
    pub storage_path: String,
    /// MIME type, if known.
    pub mime_type: Option<String>,
}

/// Relational side of artifact lifecycle: records, shares, task attachments.
#[derive(Clone)]
pub struct ArtifactStore {
    store: Store,
}

impl ArtifactStore {
    /// Wraps an already-open [`Store`].
    pub fn new(store: Store) -> ArtifactStore {
        ArtifactStore { store }
    }

    /// Registers a new artifact record with no bytes uploaded yet.
    pub async fn create(&self, req: CreateArtifactRequest) -> HubResult<ArtifactRecord> {
        if req.name.trim().is_empty() {
            return Err(HubError::new(ErrorCode::ArtifactNameRequired, "name must not be empty"));
        }
        let id = Uuid::new_v4();
        let namespace = hub_board_namespace(req.namespace.as_deref());
        let now = now_str();
        sqlx::query(
            "INSERT INTO artifacts (id, created_by, name, mime_type, size_bytes, sha256, storage_path, namespace, summary, access_count, ttl_expires_at, created_at, updated_at)
             VALUES (?, ?, ?, NULL, NULL, NULL, NULL, ?, ?, 0, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(&req.created_by)
        .bind(&req.name)
        .bind(&namespace)
        .bind(&req.summary)
        .bind(req.ttl_expires_at.map(|t| t.to_rfc3339()))
        .bind(&now)
        .bind(&now)
        .execute(self.store.pool())
        .await?;

        self.get(id).await?.ok_or_else(|| HubError::new(ErrorCode::Internal, "artifact vanished after insert"))
    }

    /// Writes the upload's final size/hash/storage path onto a previously
    /// created record.
    pub async fn finalize_upload(&self, req: FinalizeUploadRequest) -> HubResult<ArtifactRecord> {
        let now = now_str();
        let updated = sqlx::query(
            "UPDATE artifacts SET size_bytes = ?, sha256 = ?, storage_path = ?, mime_type = COALESCE(?, mime_type), updated_at = ? WHERE id = ?",
        )
        .bind(req.size_bytes as i64)
        .bind(&req.sha256)
        .bind(&req.storage_path)
        .bind(&req.mime_type)
        .bind(&now)
        .bind(req.artifact_id.to_string())
        .execute(self.store.pool())
        .await?;
        if updated.rows_affected() == 0 {
            return Err(HubError::new(ErrorCode::ArtifactNotFound, format!("no artifact with id {}", req.artifact_id)));
        }
        self.get(req.artifact_id).await?.ok_or_else(|| HubError::new(ErrorCode::Internal, "artifact vanished after finalize"))
    }

    /// Fetches one artifact by id.
    pub async fn get(&self, artifact_id: Uuid) -> HubResult<Option<ArtifactRecord>> {
        let row = sqlx::query(
            "SELECT id, created_by, name, mime_type, size_bytes, sha256, storage_path, namespace, summary, access_count, ttl_expires_at, created_at, updated_at
             FROM artifacts WHERE id = ?",
        )
        .bind(artifact_id.to_string())
        .fetch_optional(self.store.pool())
        .await?;
        row.map(row_to_artifact).transpose()
    }

    /// Increments the download/access counter for an artifact.
    pub async fn bump_access_count(&self, artifact_id: Uuid) -> HubResult<()> {
        sqlx::query("UPDATE artifacts SET access_count = access_count + 1 WHERE id = ?")
            .bind(artifact_id.to_string())
            .execute(self.store.pool())
            .await?;
        Ok(())
    }

    /// Lists artifacts, optionally restricted to one namespace, newest first.
    pub async fn list(&self, namespace: Option<&str>, limit: i64, offset: i64) -> HubResult<Vec<ArtifactRecord>> {
        let sql = if namespace.is_some() {
            "SELECT id, created_by, name, mime_type, size_bytes, sha256, storage_path, namespace, summary, access_count, ttl_expires_at, created_at, updated_at
             FROM artifacts WHERE namespace = ? ORDER BY created_at DESC LIMIT ? OFFSET ?"
        } else {
            "SELECT id, created_by, name, mime_type, size_bytes, sha256, storage_path, namespace, summary, access_count, ttl_expires_at, created_at, updated_at
             FROM artifacts ORDER BY created_at DESC LIMIT ? OFFSET ?"
        };
        let mut query = sqlx::query(sql);
        if let Some(ns) = namespace {
            query = query.bind(ns);
        }
        query = query.bind(limit).bind(offset);
        let rows = query.fetch_all(self.store.pool()).await?;
        rows.into_iter().map(row_to_artifact).collect()
    }

    /// Grants `agent_id` (or `"*"` for every agent) access beyond the creator.
    pub async fn share(&self, artifact_id: Uuid, agent_id: &str) -> HubResult<ArtifactShare> {
        if self.get(artifact_id).await?.is_none() {
            return Err(HubError::new(ErrorCode::ArtifactNotFound, format!("no artifact with id {artifact_id}")));
        }
        let now = now_str();
        sqlx::query("INSERT OR IGNORE INTO artifact_shares (artifact_id, agent_id, created_at) VALUES (?, ?, ?)")
            .bind(artifact_id.to_string())
            .bind(agent_id)
            .bind(&now)
            .execute(self.store.pool())
            .await?;
        Ok(ArtifactShare { artifact_id, agent_id: agent_id.to_string(), created_at: parse_ts(&now)? })
    }

    /// `creator OR a share row for (artifact, agent) OR (artifact, "*")`.
    pub async fn has_access(&self, agent_id: &str, artifact: &ArtifactRecord) -> HubResult<bool> {
        if artifact.created_by == agent_id {
            return Ok(true);
        }
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM artifact_shares WHERE artifact_id = ? AND (agent_id = ? OR agent_id = '*') LIMIT 1",
        )
        .bind(artifact.id.to_string())
        .bind(agent_id)
        .fetch_optional(self.store.pool())
        .await?;
        Ok(row.is_some())
    }

    /// Attaches an artifact to the task it was produced for.
    pub async fn attach_to_task(&self, task_id: i64, artifact_id: Uuid) -> HubResult<TaskArtifact> {
        if self.get(artifact_id).await?.is_none() {
            return Err(HubError::new(ErrorCode::ArtifactNotFound, format!("no artifact with id {artifact_id}")));
        }
        let now = now_str();
        sqlx::query("INSERT OR IGNORE INTO task_artifacts (task_id, artifact_id, created_at) VALUES (?, ?, ?)")
            .bind(task_id)
            .bind(artifact_id.to_string())
            .bind(&now)
            .execute(self.store.pool())
            .await?;
        Ok(TaskArtifact { task_id, artifact_id, created_at: parse_ts(&now)? })
    }

    /// Lists every artifact attached to `task_id`.
    pub async fn list_task_artifacts(&self, task_id: i64) -> HubResult<Vec<ArtifactRecord>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT artifact_id FROM task_artifacts WHERE task_id = ? ORDER BY created_at ASC",
        )
        .bind(task_id)
        .fetch_all(self.store.pool())
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for (id,) in rows {
            let id = Uuid::parse_str(&id).map_err(|e| HubError::new(ErrorCode::Internal, "stored artifact_id is not a valid UUID").with_source(e))?;
            if let Some(a) = self.get(id).await? {
                out.push(a);
            }
        }
        Ok(out)
    }

    /// Deletes artifacts past TTL (explicit `ttl_expires_at`, or the
    /// config-level default applied by the caller), returning the deleted
    /// records so the maintenance loop can best-effort unlink their files.
    pub async fn sweep_expired(&self, now: DateTime<Utc>, default_cutoff: DateTime<Utc>) -> HubResult<Vec<ArtifactRecord>> {
        let rows = sqlx::query(
            "SELECT id, created_by, name, mime_type, size_bytes, sha256, storage_path, namespace, summary, access_count, ttl_expires_at, created_at, updated_at
             FROM artifacts
             WHERE (ttl_expires_at IS NOT NULL AND ttl_expires_at < ?)
                OR (ttl_expires_at IS NULL AND created_at < ?)",
        )
        .bind(now.to_rfc3339())
        .bind(default_cutoff.to_rfc3339())
        .fetch_all(self.store.pool())
        .await?;
        let expired: Vec<ArtifactRecord> = rows.into_iter().map(row_to_artifact).collect::<HubResult<_>>()?;
        for a in &expired {
            sqlx::query("DELETE FROM artifacts WHERE id = ?").bind(a.id.to_string()).execute(self.store.pool()).await?;
        }
        Ok(expired)
    }
}

fn row_to_artifact(row: sqlx::sqlite::SqliteRow) -> HubResult<ArtifactRecord> {
    let id: String = row.get("id");
    let ttl_expires_at: Option<String> = row.get("ttl_expires_at");
    Ok(ArtifactRecord {
        id: Uuid::parse_str(&id).map_err(|e| HubError::new(ErrorCode::Internal, "stored artifact id is not a valid UUID").with_source(e))?,
        created_by: row.get("created_by"),
        name: row.get("name"),
        mime_type: row.get("mime_type"),
        size_bytes: row.get::<Option<i64>, _>("size_bytes").map(|v| v as u64),
        sha256: row.get("sha256"),
        storage_path: row.get("storage_path"),
        namespace: row.get("namespace"),
        summary: row.get("summary"),
        access_count: row.get::<i64, _>("access_count") as u64,
        ttl_expires_at: ttl_expires_at.map(|s| parse_ts(&s)).transpose()?,
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
    })
}

fn hub_board_namespace(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        Some(ns) if !ns.is_empty() => ns.to_string(),
        _ => "default".to_string(),
    }
}

/// In-memory, single-use authorization map for the artifact HTTP side
/// channel.
///
/// Tickets never touch the relational store; they live only in the issuing
/// process's memory and are swept on expiry via [`TicketIssuer::sweep_expired`].
#[derive(Default)]
pub struct TicketIssuer {
    tickets: Mutex<HashMap<String, ArtifactTicket>>,
}

impl TicketIssuer {
    /// Creates an empty issuer.
    pub fn new() -> TicketIssuer {
        TicketIssuer { tickets: Mutex::new(HashMap::new()) }
    }

    /// Issues a new single-use ticket, TTL clamped to `[30s, 86400s]`.
    pub fn issue(&self, kind: TicketKind, artifact_id: Uuid, agent_id: &str, ttl_secs: u64, max_bytes: Option<u64>) -> ArtifactTicket {
        let ttl_secs = normalize_ticket_ttl_secs(ttl_secs);
        let token = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        let ticket = ArtifactTicket {
            token: token.clone(),
            kind,
            artifact_id,
            agent_id: agent_id.to_string(),
            expires_at: Utc::now() + ChronoDuration::seconds(ttl_secs as i64),
            max_bytes,
        };
        self.tickets.lock().expect("ticket map poisoned").insert(token, ticket.clone());
        ticket
    }

    /// Validates and single-uses a ticket: kind and artifact id must match,
    /// it must not be expired, and it is removed from the map whether the
    /// call succeeds or the ticket turns out to be expired.
    pub fn consume(&self, token: &str, kind: TicketKind, artifact_id: Uuid) -> HubResult<ArtifactTicket> {
        let mut guard = self.tickets.lock().expect("ticket map poisoned");
        let Some(ticket) = guard.remove(token) else {
            return Err(HubError::new(ErrorCode::ArtifactAccessDenied, "ticket not found or already used"));
        };
        if ticket.expires_at < Utc::now() {
            return Err(HubError::new(ErrorCode::ArtifactAccessDenied, "ticket has expired"));
        }
        if ticket.kind != kind {
            return Err(HubError::new(ErrorCode::ArtifactAccessDenied, "ticket kind does not match this endpoint"));
        }
        if ticket.artifact_id != artifact_id {
            return Err(HubError::new(ErrorCode::ArtifactAccessDenied, "ticket does not authorize this artifact"));
        }
        Ok(ticket)
    }

    /// Removes every expired ticket, returning how many were swept.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut guard = self.tickets.lock().expect("ticket map poisoned");
        let before = guard.len();
        guard.retain(|_, t| t.expires_at >= now);
        before - guard.len()
    }

    /// Number of outstanding (unconsumed, not-yet-swept) tickets.
    pub fn len(&self) -> usize {
        self.tickets.lock().expect("ticket map poisoned").len()
    }

    /// Whether there are no outstanding tickets.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fresh_store() -> Store {
        Store::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn create_then_finalize_roundtrip() {
        let artifacts = ArtifactStore::new(fresh_store().await);
        let rec = artifacts
            .create(CreateArtifactRequest { created_by: "w1".into(), name: "out.txt".into(), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(rec.namespace, "default");
        assert!(rec.size_bytes.is_none());

        let finalized = artifacts
            .finalize_upload(FinalizeUploadRequest {
                artifact_id: rec.id,
                size_bytes: 42,
                sha256: "a".repeat(64),
                storage_path: "/tmp/out.txt".into(),
                mime_type: Some("text/plain".into()),
            })
            .await
            .unwrap();
        assert_eq!(finalized.size_bytes, Some(42));
        assert_eq!(finalized.sha256.as_deref(), Some("a".repeat(64).as_str()));
    }

    #[tokio::test]
    async fn create_rejects_empty_name() {
        let artifacts = ArtifactStore::new(fresh_store().await);
        let err = artifacts.create(CreateArtifactRequest { created_by: "w1".into(), name: "  ".into(), ..Default::default() }).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ArtifactNameRequired);
    }

    #[tokio::test]
    async fn access_control_creator_share_and_wildcard() {
        let artifacts = ArtifactStore::new(fresh_store().await);
        let rec = artifacts.create(CreateArtifactRequest { created_by: "w1".into(), name: "a".into(), ..Default::default() }).await.unwrap();
        assert!(artifacts.has_access("w1", &rec).await.unwrap());
        assert!(!artifacts.has_access("w2", &rec).await.unwrap());
        artifacts.share(rec.id, "w2").await.unwrap();
        assert!(artifacts.has_access("w2", &rec).await.unwrap());
        assert!(!artifacts.has_access("w3", &rec).await.unwrap());
        artifacts.share(rec.id, "*").await.unwrap();
        assert!(artifacts.has_access("w3", &rec).await.unwrap());
    }

    #[tokio::test]
    async fn task_attachment_round_trip() {
        let artifacts = ArtifactStore::new(fresh_store().await);
        let rec = artifacts.create(CreateArtifactRequest { created_by: "w1".into(), name: "a".into(), ..Default::default() }).await.unwrap();
        artifacts.attach_to_task(7, rec.id).await.unwrap();
        let listed = artifacts.list_task_artifacts(7).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, rec.id);
    }

    #[test]
    fn ticket_issue_and_consume_is_single_use() {
        let issuer = TicketIssuer::new();
        let artifact_id = Uuid::new_v4();
        let ticket = issuer.issue(TicketKind::Download, artifact_id, "w1", 60, None);
        assert_eq!(issuer.len(), 1);

        let consumed = issuer.consume(&ticket.token, TicketKind::Download, artifact_id).unwrap();
        assert_eq!(consumed.agent_id, "w1");
        assert!(issuer.is_empty());

        let err = issuer.consume(&ticket.token, TicketKind::Download, artifact_id).unwrap_err();
        assert_eq!(err.code, ErrorCode::ArtifactAccessDenied);
    }

    #[test]
    fn ticket_rejects_kind_and_artifact_mismatch() {
        let issuer = TicketIssuer::new();
        let artifact_id = Uuid::new_v4();
        let ticket = issuer.issue(TicketKind::Upload, artifact_id, "w1", 60, Some(1024));
        assert!(issuer.consume(&ticket.token, TicketKind::Download, artifact_id).is_err());
        assert_eq!(issuer.len(), 1);
        assert!(issuer.consume(&ticket.token, TicketKind::Upload, Uuid::new_v4()).is_err());
        assert_eq!(issuer.len(), 1);
        assert!(issuer.consume(&ticket.token, TicketKind::Upload, artifact_id).is_ok());
    }

    #[test]
    fn ttl_clamped_to_bounds() {
        assert_eq!(normalize_ticket_ttl_secs(1), 30);
        assert_eq!(normalize_ticket_ttl_secs(999_999), 86_400);
        assert_eq!(normalize_ticket_ttl_secs(120), 120);
    }

    #[test]
    fn sweep_expired_removes_only_past_tickets() {
        let issuer = TicketIssuer::new();
        let artifact_id = Uuid::new_v4();
        let t = issuer.issue(TicketKind::Download, artifact_id, "w1", 30, None);
        assert_eq!(issuer.sweep_expired(Utc::now()), 0);
        assert_eq!(issuer.sweep_expired(t.expires_at + ChronoDuration::seconds(1)), 1);
        assert!(issuer.is_empty());
    }
}
