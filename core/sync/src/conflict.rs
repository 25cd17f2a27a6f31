//! Conflict detection and resolution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use fieldsync_common::Error;

use crate::merge::{FieldRulesMerge, MergeStrategy, ShallowMerge};
use crate::remote::{RemoteEntity, RemoteEntityClient};

/// How a detected conflict is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictPolicy {
    /// Local mutation proceeds and overwrites the server.
    ClientWins,
    /// Local mutation is discarded; the server state stands.
    ServerWins,
    /// Local and remote states are combined field by field.
    Merge,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictPolicy::ClientWins => "CLIENT_WINS",
            ConflictPolicy::ServerWins => "SERVER_WINS",
            ConflictPolicy::Merge => "MERGE",
        };
        f.write_str(name)
    }
}

impl FromStr for ConflictPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "client_wins" | "client" => Ok(ConflictPolicy::ClientWins),
            "server_wins" | "server" => Ok(ConflictPolicy::ServerWins),
            "merge" => Ok(ConflictPolicy::Merge),
            other => Err(Error::InvalidInput(format!("Unknown conflict policy: {}", other))),
        }
    }
}

/// Result of comparing a local mutation with the server's entity state.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictOutcome {
    /// The server changed the entity after the mutation was made.
    pub has_conflict: bool,
    /// Policy to apply. `ClientWins` when there is no conflict.
    pub resolution: ConflictPolicy,
    /// Combined payload; always present when `resolution` is `Merge`.
    pub merged_payload: Option<Value>,
    /// The entity does not exist on the server.
    pub remote_missing: bool,
}

impl ConflictOutcome {
    /// Nothing to resolve; the local mutation proceeds.
    pub fn no_conflict() -> Self {
        Self {
            has_conflict: false,
            resolution: ConflictPolicy::ClientWins,
            merged_payload: None,
            remote_missing: false,
        }
    }

    /// The server has no such entity. Not a conflict.
    pub fn remote_missing() -> Self {
        Self {
            remote_missing: true,
            ..Self::no_conflict()
        }
    }
}

/// Default policy per entity type.
///
/// Attendance records are owned by the server (clock-in/out is audited
/// there); work records merge; anything unlisted lets the client win.
pub fn default_policies() -> HashMap<String, ConflictPolicy> {
    [
        ("tasks", ConflictPolicy::Merge),
        ("daily_reports", ConflictPolicy::Merge),
        ("inventory", ConflictPolicy::Merge),
        ("attendance", ConflictPolicy::ServerWins),
        ("expenses", ConflictPolicy::ClientWins),
    ]
    .into_iter()
    .map(|(entity_type, policy)| (entity_type.to_string(), policy))
    .collect()
}

/// Conflict detector and resolver.
///
/// Holds the policy table and the merge strategy registered per entity
/// type. Entity types without a registered strategy use `ShallowMerge`.
#[derive(Clone)]
pub struct ConflictResolver {
    policies: HashMap<String, ConflictPolicy>,
    merges: HashMap<String, Arc<dyn MergeStrategy>>,
    fallback_merge: Arc<dyn MergeStrategy>,
}

impl ConflictResolver {
    /// Create a resolver with an empty policy table (everything CLIENT_WINS).
    pub fn new() -> Self {
        Self {
            policies: HashMap::new(),
            merges: HashMap::new(),
            fallback_merge: Arc::new(ShallowMerge),
        }
    }

    /// Create a resolver with the default policy table and domain merges.
    pub fn standard() -> Self {
        let mut resolver = Self::new();
        resolver.policies = default_policies();
        resolver
            .with_merge(
                "tasks",
                FieldRulesMerge::new()
                    .max("progress")
                    .append_text("notes", "\n---\n"),
            )
            .with_merge(
                "daily_reports",
                FieldRulesMerge::new().append_text("notes", "\n---\n"),
            )
            .with_merge(
                "inventory",
                FieldRulesMerge::new().additive_quantity("items", "sku", "quantity"),
            )
    }

    /// Set the default policy for an entity type.
    pub fn with_policy(mut self, entity_type: impl Into<String>, policy: ConflictPolicy) -> Self {
        self.policies.insert(entity_type.into(), policy);
        self
    }

    /// Register the merge strategy for an entity type.
    pub fn with_merge(
        mut self,
        entity_type: impl Into<String>,
        strategy: impl MergeStrategy + 'static,
    ) -> Self {
        self.merges.insert(entity_type.into(), Arc::new(strategy));
        self
    }

    /// Policy for an entity type, honoring a per-item override.
    pub fn policy_for(&self, entity_type: &str, overridden: Option<ConflictPolicy>) -> ConflictPolicy {
        overridden
            .or_else(|| self.policies.get(entity_type).copied())
            .unwrap_or(ConflictPolicy::ClientWins)
    }

    fn merge_strategy(&self, entity_type: &str) -> &dyn MergeStrategy {
        self.merges
            .get(entity_type)
            .map(|s| s.as_ref())
            .unwrap_or(self.fallback_merge.as_ref())
    }

    /// Fetch the server state of an entity and compare it with a local mutation.
    ///
    /// A missing entity is reported via `remote_missing`. Any other read
    /// failure fails open: the local mutation proceeds as if unopposed so a
    /// flaky read never blocks the queue.
    pub async fn check(
        &self,
        remote: &dyn RemoteEntityClient,
        entity_type: &str,
        entity_id: &str,
        local_payload: &Value,
        client_timestamp: DateTime<Utc>,
        overridden: Option<ConflictPolicy>,
    ) -> ConflictOutcome {
        match remote.read(entity_type, entity_id).await {
            Ok(entity) => self.resolve(
                entity_type,
                local_payload,
                &entity,
                client_timestamp,
                overridden,
            ),
            Err(e) if e.is_not_found() => {
                debug!("{}/{} does not exist remotely", entity_type, entity_id);
                ConflictOutcome::remote_missing()
            }
            Err(e) => {
                warn!(
                    "Conflict check for {}/{} failed, proceeding with local state: {}",
                    entity_type, entity_id, e
                );
                ConflictOutcome::no_conflict()
            }
        }
    }

    /// Decide the outcome for a local mutation against a known server state.
    ///
    /// Only a remote timestamp strictly newer than `client_timestamp` is a
    /// conflict. A remote entity without a timestamp never conflicts.
    pub fn resolve(
        &self,
        entity_type: &str,
        local_payload: &Value,
        remote: &RemoteEntity,
        client_timestamp: DateTime<Utc>,
        overridden: Option<ConflictPolicy>,
    ) -> ConflictOutcome {
        let remote_newer = remote
            .updated_at
            .map(|updated_at| updated_at > client_timestamp)
            .unwrap_or(false);

        if !remote_newer {
            return ConflictOutcome::no_conflict();
        }

        let resolution = self.policy_for(entity_type, overridden);
        let merged_payload = match resolution {
            ConflictPolicy::Merge => Some(
                self.merge_strategy(entity_type)
                    .merge(local_payload, &remote.data),
            ),
            _ => None,
        };

        debug!(
            "Conflict on {}/{}: resolving with {}",
            entity_type,
            remote.id.as_deref().unwrap_or("?"),
            resolution
        );

        ConflictOutcome {
            has_conflict: true,
            resolution,
            merged_payload,
            remote_missing: false,
        }
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}
