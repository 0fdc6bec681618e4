//! Context lifecycle, inheritance resolution and delegation.

use super::validator::{ContextHierarchyValidator, ValidationOutcome};
use super::{ContextLevel, ContextRecord, Delegation, DelegationStatus, ResolvedContext};
use crate::cache::Cache;
use crate::config::{ContextConfig, deep_merge, merge_patch};
use crate::db::{Database, now_ms};
use crate::error::{ApiError, ApiResult, ErrorCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Alias accepted in place of the caller's user id for the global context.
pub const GLOBAL_ALIAS: &str = "global";

/// Partial update of a context.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContextUpdate {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub local_overrides: Option<Value>,
    #[serde(default)]
    pub delegation_rules: Option<Value>,
    #[serde(default)]
    pub inheritance_disabled: Option<bool>,
    /// Merge `data` and `local_overrides` into the stored values instead of
    /// replacing them. Objects merge recursively and a null removes the key.
    #[serde(default = "default_merge")]
    pub merge: bool,
}

fn default_merge() -> bool {
    true
}

/// A created context and the parents created on its behalf.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedContext {
    pub context: ContextRecord,
    /// `level:id` of parent contexts created automatically, root first.
    pub auto_created: Vec<String>,
    /// Guidance for parents that are still missing.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct CachedResolution {
    resolved: Value,
    chain: Vec<String>,
}

fn cache_key(user_id: &str, level: ContextLevel, id: &str) -> String {
    format!("ctx:{}:{}:{}", user_id, level, id)
}

fn user_prefix(user_id: &str) -> String {
    format!("ctx:{}:", user_id)
}

fn ensure_object(field: &str, value: &Value) -> ApiResult<()> {
    if value.is_object() {
        Ok(())
    } else {
        Err(ApiError::invalid_value(field, format!("{} must be a JSON object", field)))
    }
}

pub struct ContextService {
    db: Database,
    cache: Arc<Cache>,
    validator: ContextHierarchyValidator,
    config: ContextConfig,
    /// Per-user count of invalidations. A resolution is only cached if no
    /// invalidation happened while it was being computed.
    generations: Mutex<HashMap<String, u64>>,
}

impl ContextService {
    pub fn new(db: Database, cache: Arc<Cache>, config: ContextConfig) -> Self {
        Self {
            validator: ContextHierarchyValidator::new(db.clone()),
            db,
            cache,
            config,
            generations: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// The stored id of a context. The global context of a user is keyed by
    /// the user id and may be addressed as `global`.
    pub fn context_id(&self, level: ContextLevel, id: &str, user_id: &str) -> ApiResult<String> {
        if level != ContextLevel::Global {
            return Ok(id.to_string());
        }
        if id == GLOBAL_ALIAS || id == user_id {
            Ok(user_id.to_string())
        } else {
            Err(ApiError::context_not_found(level.as_str(), id))
        }
    }

    pub fn validate(&self, user_id: &str, level: ContextLevel, id: &str) -> ApiResult<ValidationOutcome> {
        let id = self.context_id(level, id, user_id)?;
        self.validator.validate(level, &id, user_id)
    }

    /// Create a context, auto-creating missing parents when configured.
    pub fn create(
        &self,
        user_id: &str,
        level: ContextLevel,
        id: &str,
        data: Option<Value>,
    ) -> ApiResult<CreatedContext> {
        let id = self.context_id(level, id, user_id)?;
        if let Some(ref data) = data {
            ensure_object("data", data)?;
        }

        let outcome = self.validator.validate(level, &id, user_id)?;
        if self.db.get_context(level, &id, user_id)?.is_some() {
            return Err(ApiError::already_exists(format!("{} context {} already exists", level, id)));
        }

        let mut auto_created = Vec::new();
        let mut warnings = Vec::new();
        if !outcome.valid {
            if self.config.auto_create_parents {
                for missing in &outcome.missing {
                    self.insert_empty(user_id, missing.level, &missing.id)?;
                    auto_created.push(format!("{}:{}", missing.level, missing.id));
                }
                info!(user_id, level = %level, context_id = %id, created = ?auto_created, "Auto-created parent contexts");
            } else {
                warnings = outcome.guidance;
            }
        }

        let mut record = ContextRecord::new(level, &id, self.parent_link(user_id, level, &id)?, user_id, now_ms());
        if let Some(data) = data {
            record.data = data;
        }
        self.db.insert_context(&record)?;
        self.invalidate(user_id, level, &id, "context created")?;
        info!(user_id, level = %level, context_id = %id, "Context created");

        Ok(CreatedContext {
            context: record,
            auto_created,
            warnings,
        })
    }

    fn insert_empty(&self, user_id: &str, level: ContextLevel, id: &str) -> ApiResult<ContextRecord> {
        let record = ContextRecord::new(level, id, self.parent_link(user_id, level, id)?, user_id, now_ms());
        self.db.insert_context(&record)?;
        Ok(record)
    }

    /// Parent context id to store on a new row, only when that context exists.
    fn parent_link(&self, user_id: &str, level: ContextLevel, id: &str) -> ApiResult<Option<String>> {
        let Some(parent_level) = level.parent() else {
            return Ok(None);
        };
        let Some(parent_id) = self.db.context_entity_parent(level, id, user_id)? else {
            return Ok(None);
        };
        Ok(self
            .db
            .get_context(parent_level, &parent_id, user_id)?
            .map(|parent| parent.id))
    }

    /// Fetch a context, creating it (and its parents) when missing.
    pub fn get_or_create(&self, user_id: &str, level: ContextLevel, id: &str) -> ApiResult<ContextRecord> {
        let id = self.context_id(level, id, user_id)?;
        if let Some(record) = self.db.get_context(level, &id, user_id)? {
            return Ok(record);
        }
        match self.create(user_id, level, &id, None) {
            Ok(created) => Ok(created.context),
            // Lost a race with a concurrent create
            Err(e) if e.code == ErrorCode::AlreadyExists => self.get(user_id, level, &id),
            Err(e) => Err(e),
        }
    }

    pub fn get(&self, user_id: &str, level: ContextLevel, id: &str) -> ApiResult<ContextRecord> {
        let id = self.context_id(level, id, user_id)?;
        self.db
            .get_context(level, &id, user_id)?
            .ok_or_else(|| ApiError::context_not_found(level.as_str(), &id))
    }

    pub fn list(&self, user_id: &str, level: ContextLevel, limit: i64, offset: i64) -> ApiResult<Vec<ContextRecord>> {
        Ok(self.db.list_contexts(level, user_id, limit, offset.max(0))?)
    }

    /// Apply a partial update and bump the version.
    pub fn update(
        &self,
        user_id: &str,
        level: ContextLevel,
        id: &str,
        update: ContextUpdate,
    ) -> ApiResult<ContextRecord> {
        let mut record = self.get(user_id, level, id)?;

        if let Some(data) = update.data {
            ensure_object("data", &data)?;
            record.data = if update.merge {
                merge_patch(record.data, data)
            } else {
                data
            };
        }
        if let Some(overrides) = update.local_overrides {
            ensure_object("local_overrides", &overrides)?;
            record.local_overrides = if update.merge {
                merge_patch(record.local_overrides, overrides)
            } else {
                overrides
            };
        }
        if let Some(rules) = update.delegation_rules {
            ensure_object("delegation_rules", &rules)?;
            record.delegation_rules = rules;
        }
        if let Some(disabled) = update.inheritance_disabled {
            record.inheritance_disabled = disabled;
        }

        let saved = self
            .db
            .save_context(&record)?
            .ok_or_else(|| ApiError::context_not_found(level.as_str(), &record.id))?;
        self.invalidate(user_id, level, &saved.id, "context updated")?;
        info!(user_id, level = %level, context_id = %saved.id, version = saved.version, "Context updated");
        Ok(saved)
    }

    pub fn delete(&self, user_id: &str, level: ContextLevel, id: &str) -> ApiResult<()> {
        let id = self.context_id(level, id, user_id)?;
        if !self.db.delete_context(level, &id, user_id)? {
            return Err(ApiError::context_not_found(level.as_str(), &id));
        }
        self.invalidate(user_id, level, &id, "context deleted")?;
        info!(user_id, level = %level, context_id = %id, "Context deleted");
        Ok(())
    }

    /// Effective context of `(level, id)` after inheritance.
    ///
    /// Lookup order: in-process cache, persistent inheritance cache, then a
    /// fresh merge down the chain. `force_refresh` skips both caches.
    pub fn resolve(
        &self,
        user_id: &str,
        level: ContextLevel,
        id: &str,
        force_refresh: bool,
    ) -> ApiResult<ResolvedContext> {
        let id = self.context_id(level, id, user_id)?;
        let key = cache_key(user_id, level, &id);
        let seen = self.generation(user_id);

        if !force_refresh {
            if let Some(cached) = self.cache.get(&key)
                && let Ok(hit) = serde_json::from_value::<CachedResolution>(cached)
            {
                debug!(level = %level, context_id = %id, "Context resolved from memory cache");
                return Ok(ResolvedContext {
                    level,
                    id,
                    resolved: hit.resolved,
                    chain: hit.chain,
                    source: "memory".to_string(),
                });
            }
            if let Some((resolved, chain)) = self.db.cached_resolution(level, &id, user_id)? {
                self.cache_resolution(user_id, seen, level, &id, &resolved, &chain, false)?;
                return Ok(ResolvedContext {
                    level,
                    id,
                    resolved,
                    chain,
                    source: "database".to_string(),
                });
            }
        }

        let (resolved, chain) = self.compute(user_id, level, &id)?;
        self.cache_resolution(user_id, seen, level, &id, &resolved, &chain, true)?;

        Ok(ResolvedContext {
            level,
            id,
            resolved,
            chain,
            source: "computed".to_string(),
        })
    }

    fn generation(&self, user_id: &str) -> u64 {
        let generations = self.generations.lock().unwrap_or_else(PoisonError::into_inner);
        generations.get(user_id).copied().unwrap_or(0)
    }

    /// Store a resolution in the memory cache, and in the persistent cache
    /// when `persist` is set, unless the user's contexts were invalidated
    /// since `seen`. Returns whether it was stored.
    #[allow(clippy::too_many_arguments)]
    fn cache_resolution(
        &self,
        user_id: &str,
        seen: u64,
        level: ContextLevel,
        id: &str,
        resolved: &Value,
        chain: &[String],
        persist: bool,
    ) -> ApiResult<bool> {
        // Held across the writes so an invalidation either lands first and
        // is seen here, or lands after and deletes what was written.
        let generations = self.generations.lock().unwrap_or_else(PoisonError::into_inner);
        if generations.get(user_id).copied().unwrap_or(0) != seen {
            debug!(level = %level, context_id = %id, "Discarding resolution computed before an invalidation");
            return Ok(false);
        }
        if persist {
            self.db.store_resolution(
                level,
                id,
                user_id,
                resolved,
                chain,
                self.config.inheritance_cache_ttl_seconds.saturating_mul(1000),
            )?;
        }
        self.cache
            .set(&cache_key(user_id, level, id), &json!({ "resolved": resolved, "chain": chain }));
        Ok(true)
    }

    /// Merge the chain root first. Each context contributes `data` then
    /// `local_overrides`; a context with inheritance disabled starts a new
    /// chain. Missing intermediate contexts are skipped.
    fn compute(&self, user_id: &str, level: ContextLevel, id: &str) -> ApiResult<(Value, Vec<String>)> {
        let target = self.get(user_id, level, id)?;
        let mut records = vec![target];

        if !records[0].inheritance_disabled {
            for (ancestor_level, ancestor_id) in self.validator.ancestors(level, id, user_id)? {
                let Some(ancestor) = self.db.get_context(ancestor_level, &ancestor_id, user_id)? else {
                    continue;
                };
                let stop = ancestor.inheritance_disabled;
                records.push(ancestor);
                if stop {
                    break;
                }
            }
        }

        let mut resolved = Value::Object(Default::default());
        let mut chain = Vec::with_capacity(records.len());
        for record in records.into_iter().rev() {
            chain.push(format!("{}:{}", record.level, record.id));
            resolved = deep_merge(resolved, record.data);
            resolved = deep_merge(resolved, record.local_overrides);
        }
        Ok((resolved, chain))
    }

    /// Drop cached resolutions of a context and everything below it.
    ///
    /// Returns the number of persistent cache rows invalidated.
    pub fn invalidate(&self, user_id: &str, level: ContextLevel, id: &str, reason: &str) -> ApiResult<usize> {
        *self
            .generations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(user_id.to_string())
            .or_insert(0) += 1;

        if level == ContextLevel::Global {
            self.cache.delete_prefix(&user_prefix(user_id));
            let changed = self.db.invalidate_user_resolutions(user_id, reason)?;
            debug!(user_id, reason, changed, "Invalidated all context resolutions");
            return Ok(changed);
        }

        let mut targets = vec![(level, id.to_string())];
        targets.extend(self.db.context_descendants(level, id, user_id)?);
        for (target_level, target_id) in &targets {
            self.cache.delete(&cache_key(user_id, *target_level, target_id));
        }
        let changed = self.db.invalidate_resolutions(user_id, &targets, reason)?;
        debug!(user_id, level = %level, context_id = %id, reason, changed, "Invalidated context resolutions");
        Ok(changed)
    }

    /// Propose pushing `data` from a context up to a higher level.
    pub fn delegate(
        &self,
        user_id: &str,
        from_level: ContextLevel,
        from_id: &str,
        to_level: ContextLevel,
        data: Value,
        reason: &str,
    ) -> ApiResult<Delegation> {
        if !to_level.is_above(from_level) {
            return Err(ApiError::invalid_value(
                "target_level",
                format!("Cannot delegate from {} to {}: target must be a higher level", from_level, to_level),
            ));
        }
        ensure_object("data", &data)?;
        let from_id = self.context_id(from_level, from_id, user_id)?;
        if !self.db.context_entity_exists(from_level, &from_id, user_id)? {
            return Err(ApiError::context_not_found(from_level.as_str(), &from_id));
        }

        let target_id = self
            .validator
            .ancestors(from_level, &from_id, user_id)?
            .into_iter()
            .find(|(level, _)| *level == to_level)
            .map(|(_, id)| id)
            .ok_or_else(|| ApiError::context_not_found(to_level.as_str(), "(ancestor)"))?;

        let delegation =
            self.db
                .insert_delegation(user_id, from_level, &from_id, to_level, &target_id, &data, reason)?;
        info!(
            user_id,
            delegation_id = %delegation.id,
            from = %format!("{}:{}", from_level, from_id),
            to = %format!("{}:{}", to_level, target_id),
            "Delegation requested"
        );
        Ok(delegation)
    }

    /// Approve or reject a pending delegation. Approval merges the delegated
    /// data into the target context, creating it when needed.
    pub fn process_delegation(&self, user_id: &str, delegation_id: &str, approve: bool) -> ApiResult<Delegation> {
        let delegation = self.get_delegation(user_id, delegation_id)?;
        if delegation.status != DelegationStatus::Pending {
            return Err(ApiError::invalid_state(format!(
                "Delegation {} is already {}",
                delegation_id, delegation.status
            )));
        }

        if approve {
            let mut target = self.get_or_create(user_id, delegation.target_level, &delegation.target_id)?;
            target.data = deep_merge(target.data, delegation.delegated_data.clone());
            self.db.save_context(&target)?;
            self.invalidate(user_id, target.level, &target.id, "delegation approved")?;
        }

        let status = if approve {
            DelegationStatus::Approved
        } else {
            DelegationStatus::Rejected
        };
        if !self.db.finish_delegation(user_id, delegation_id, status)? {
            return Err(ApiError::invalid_state(format!(
                "Delegation {} was processed concurrently",
                delegation_id
            )));
        }
        info!(user_id, delegation_id, status = %status, "Delegation processed");
        self.get_delegation(user_id, delegation_id)
    }

    pub fn get_delegation(&self, user_id: &str, delegation_id: &str) -> ApiResult<Delegation> {
        self.db.get_delegation(user_id, delegation_id)?.ok_or_else(|| {
            ApiError::new(
                ErrorCode::DelegationNotFound,
                format!("Delegation not found: {}", delegation_id),
            )
        })
    }

    pub fn list_delegations(
        &self,
        user_id: &str,
        status: Option<DelegationStatus>,
        limit: i64,
    ) -> ApiResult<Vec<Delegation>> {
        Ok(self.db.list_delegations(user_id, status, limit)?)
    }

    /// Append an insight to a context, creating the context when needed.
    pub fn add_insight(
        &self,
        user_id: &str,
        level: ContextLevel,
        id: &str,
        content: &str,
        category: Option<&str>,
        importance: Option<&str>,
    ) -> ApiResult<ContextRecord> {
        if content.trim().is_empty() {
            return Err(ApiError::missing_field("content"));
        }
        let mut record = self.get_or_create(user_id, level, id)?;
        record.insights.push(json!({
            "content": content,
            "category": category.unwrap_or("general"),
            "importance": importance.unwrap_or("medium"),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }));
        self.save_entries(user_id, record)
    }

    /// Append a progress note to a context, creating the context when needed.
    pub fn add_progress(
        &self,
        user_id: &str,
        level: ContextLevel,
        id: &str,
        content: &str,
        agent: Option<&str>,
    ) -> ApiResult<ContextRecord> {
        if content.trim().is_empty() {
            return Err(ApiError::missing_field("content"));
        }
        let mut record = self.get_or_create(user_id, level, id)?;
        record.progress.push(json!({
            "content": content,
            "agent": agent,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }));
        self.save_entries(user_id, record)
    }

    fn save_entries(&self, user_id: &str, record: ContextRecord) -> ApiResult<ContextRecord> {
        let (level, id) = (record.level, record.id.clone());
        let saved = self
            .db
            .save_context(&record)?
            .ok_or_else(|| ApiError::context_not_found(level.as_str(), &id))?;
        self.invalidate(user_id, level, &id, "context entries added")?;
        Ok(saved)
    }
}
