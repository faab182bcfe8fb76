//! Workout session persistence boundary.
//!
//! The runner records through [`SessionStore`]; the on-disk format belongs to
//! whoever implements it. [`MemorySessionStore`] keeps everything in memory.

use crate::workouts::types::WorkoutPlan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Lifecycle of a recorded session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// In progress (or interrupted by a crash)
    Active,
    /// Ran to the end or was ended by the rider
    Completed,
    /// Given up
    Abandoned,
}

/// Metadata needed to resume a workout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutSession {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub plan_name: String,
    pub ftp: u16,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub current_block_index: usize,
    pub elapsed_ms: u64,
}

/// Position to persist alongside a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionProgress {
    pub current_block_index: usize,
    pub elapsed_ms: u64,
}

/// One recorded data point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutSample {
    /// Workout time of the sample
    pub elapsed_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub target_watts: Option<u16>,
    pub power_watts: Option<f32>,
    pub cadence_rpm: Option<f32>,
    pub heart_rate_bpm: Option<f32>,
    pub speed_kmh: Option<f32>,
}

/// Persistence errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Where workout sessions are recorded.
pub trait SessionStore: Send + Sync + 'static {
    /// Record a new active session.
    fn create_session(
        &self,
        plan: &WorkoutPlan,
        ftp: u16,
    ) -> impl Future<Output = Result<WorkoutSession, StorageError>> + Send;

    /// Load a session's metadata.
    fn load_session_metadata(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<WorkoutSession, StorageError>> + Send;

    /// Update status and position.
    fn update_session_status(
        &self,
        id: Uuid,
        status: SessionStatus,
        progress: SessionProgress,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Append samples in order.
    fn append_samples(
        &self,
        id: Uuid,
        samples: &[WorkoutSample],
    ) -> impl Future<Output = Result<(), StorageError>> + Send;
}

/// In-memory session store.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<Uuid, WorkoutSession>>,
    samples: RwLock<HashMap<Uuid, Vec<WorkoutSample>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples recorded for a session.
    pub async fn samples(&self, id: Uuid) -> Vec<WorkoutSample> {
        self.samples
            .read()
            .await
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Sessions still marked active, for crash recovery.
    pub async fn active_sessions(&self) -> Vec<WorkoutSession> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .cloned()
            .collect()
    }
}

impl SessionStore for MemorySessionStore {
    async fn create_session(
        &self,
        plan: &WorkoutPlan,
        ftp: u16,
    ) -> Result<WorkoutSession, StorageError> {
        let session = WorkoutSession {
            id: Uuid::new_v4(),
            plan_id: plan.id,
            plan_name: plan.name.clone(),
            ftp,
            started_at: Utc::now(),
            ended_at: None,
            status: SessionStatus::Active,
            current_block_index: 0,
            elapsed_ms: 0,
        };
        self.sessions
            .write()
            .await
            .insert(session.id, session.clone());
        Ok(session)
    }

    async fn load_session_metadata(&self, id: Uuid) -> Result<WorkoutSession, StorageError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StorageError::SessionNotFound(id))
    }

    async fn update_session_status(
        &self,
        id: Uuid,
        status: SessionStatus,
        progress: SessionProgress,
    ) -> Result<(), StorageError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&id)
            .ok_or(StorageError::SessionNotFound(id))?;

        session.status = status;
        session.current_block_index = progress.current_block_index;
        session.elapsed_ms = progress.elapsed_ms;
        if status != SessionStatus::Active && session.ended_at.is_none() {
            session.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn append_samples(
        &self,
        id: Uuid,
        samples: &[WorkoutSample],
    ) -> Result<(), StorageError> {
        if !self.sessions.read().await.contains_key(&id) {
            return Err(StorageError::SessionNotFound(id));
        }
        self.samples
            .write()
            .await
            .entry(id)
            .or_default()
            .extend_from_slice(samples);
        Ok(())
    }
}
