//! Application services.
//!
//! Each facade validates input, calls the repositories, then invalidates
//! affected context resolutions and publishes a change notification. HTTP
//! routes and MCP tools both go through these facades.

pub mod branches;
pub mod metrics;
pub mod progress;
pub mod projects;
pub mod subtasks;
pub mod tasks;

pub use branches::BranchService;
pub use metrics::{PerformanceMetrics, track_metrics};
pub use progress::TaskProgressService;
pub use projects::ProjectService;
pub use subtasks::SubtaskService;
pub use tasks::TaskService;

use crate::cache::Cache;
use crate::config::Config;
use crate::context::{ContextLevel, ContextService};
use crate::db::Database;
use crate::error::{ApiError, ApiResult};
use crate::notifications::{ChangeEvent, NotificationService};
use std::sync::Arc;
use tracing::warn;

/// Handles shared by every facade.
#[derive(Clone)]
pub(crate) struct Shared {
    pub db: Database,
    pub contexts: Arc<ContextService>,
    pub notifications: Arc<NotificationService>,
}

impl Shared {
    pub fn notify(&self, event: ChangeEvent) {
        self.notifications.publish(event);
    }

    /// Invalidate resolutions below an entity. A failure here must not undo
    /// the mutation that triggered it, so it is only logged.
    pub fn invalidate(&self, user_id: &str, level: ContextLevel, id: &str, reason: &str) {
        if let Err(e) = self.contexts.invalidate(user_id, level, id, reason) {
            warn!(user_id, level = %level, id, error = %e, "Context cache invalidation failed");
        }
    }
}

/// Trimmed, non-empty text field.
pub(crate) fn required_text(field: &str, value: &str) -> ApiResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiError::missing_field(field));
    }
    if trimmed.chars().count() > 255 {
        return Err(ApiError::invalid_value(field, format!("{} must be at most 255 characters", field)));
    }
    Ok(trimmed.to_string())
}

/// Every application service, wired to one database.
#[derive(Clone)]
pub struct Services {
    pub db: Database,
    pub cache: Arc<Cache>,
    pub contexts: Arc<ContextService>,
    pub notifications: Arc<NotificationService>,
    pub metrics: Arc<PerformanceMetrics>,
    pub projects: Arc<ProjectService>,
    pub branches: Arc<BranchService>,
    pub tasks: Arc<TaskService>,
    pub subtasks: Arc<SubtaskService>,
    pub progress: Arc<TaskProgressService>,
}

impl Services {
    pub fn new(
        db: Database,
        cache: Arc<Cache>,
        notifications: Arc<NotificationService>,
        config: &Config,
    ) -> Self {
        let contexts = Arc::new(ContextService::new(db.clone(), cache.clone(), config.context.clone()));
        let shared = Shared {
            db: db.clone(),
            contexts: contexts.clone(),
            notifications: notifications.clone(),
        };
        let progress = Arc::new(TaskProgressService::new(shared.clone()));

        Self {
            projects: Arc::new(ProjectService::new(shared.clone())),
            branches: Arc::new(BranchService::new(shared.clone())),
            tasks: Arc::new(TaskService::new(shared.clone())),
            subtasks: Arc::new(SubtaskService::new(shared, progress.clone())),
            progress,
            metrics: Arc::new(PerformanceMetrics::new()),
            db,
            cache,
            contexts,
            notifications,
        }
    }

    /// In-memory database and cache with default settings.
    pub fn in_memory() -> anyhow::Result<Self> {
        let config = Config::default();
        let cache = Arc::new(Cache::from_config(&config.cache));
        let notifications = Arc::new(NotificationService::new(&config.notifications));
        Ok(Self::new(Database::open_in_memory()?, cache, notifications, &config))
    }
}
