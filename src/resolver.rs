//! Conflict resolution strategies.
//!
//! When the detector finds divergent lineages, a resolution strategy
//! decides which side of each contested path survives, or refuses and
//! escalates to manual resolution. A new version is only ever written
//! from a resolution with `needs_manual == false`.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::delta::{compute_delta, paths, ConfigDelta};
use crate::snapshot::DeviceId;

/// Everything a resolver may consult about a divergence.
#[derive(Debug, Clone)]
pub struct ConflictContext {
    /// The local working tree.
    pub local_tree: Value,
    /// The remote head tree.
    pub remote_tree: Value,
    /// The common ancestor both sides diverged from, when the lineage
    /// still holds one. Required by the three-way strategy.
    pub base_tree: Option<Value>,
    /// Paths the local side changed since the common ancestor.
    pub local_paths: BTreeSet<String>,
    /// Paths the remote side changed since the common ancestor.
    pub remote_paths: BTreeSet<String>,
    pub local_modified: DateTime<Utc>,
    pub remote_modified: DateTime<Utc>,
    pub local_device: DeviceId,
    pub remote_device: DeviceId,
}

impl ConflictContext {
    /// Contested regions: for every pair of overlapping paths across the
    /// two sides, the shallower path identifies the region in dispute.
    pub fn contested_regions(&self) -> BTreeSet<String> {
        let mut regions = BTreeSet::new();
        for lp in &self.local_paths {
            for rp in &self.remote_paths {
                if paths::overlaps(lp, rp) {
                    let region = if lp == rp || paths::is_ancestor(lp, rp) {
                        lp
                    } else {
                        rp
                    };
                    regions.insert(region.clone());
                }
            }
        }
        regions
    }

    /// A deleted subtree with edits inside it on the other side cannot be
    /// merged path-wise. Returns the offending region, if any.
    fn structurally_incompatible(&self) -> Option<String> {
        for lp in &self.local_paths {
            for rp in &self.remote_paths {
                if paths::is_ancestor(lp, rp) && paths::get(&self.local_tree, lp).is_none() {
                    return Some(lp.clone());
                }
                if paths::is_ancestor(rp, lp) && paths::get(&self.remote_tree, rp).is_none() {
                    return Some(rp.clone());
                }
            }
        }
        None
    }

    /// Side-level tie-break for contested regions: the later writer wins;
    /// an exact millisecond tie falls to the smaller device id, so every
    /// device reaches the same answer.
    fn local_wins_tie(&self) -> bool {
        let local_ms = self.local_modified.timestamp_millis();
        let remote_ms = self.remote_modified.timestamp_millis();
        match local_ms.cmp(&remote_ms) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => {
                self.local_device.to_string() < self.remote_device.to_string()
            }
        }
    }
}

/// Outcome of a resolution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// The merged tree; absent when manual intervention is required.
    pub merged: Option<Value>,
    pub needs_manual: bool,
    /// Paths both sides touched, sorted, for reporting.
    pub conflict_paths: Vec<String>,
    pub strategy: ResolutionStrategy,
}

impl Resolution {
    fn resolved(merged: Value, conflict_paths: Vec<String>, strategy: ResolutionStrategy) -> Self {
        Self {
            merged: Some(merged),
            needs_manual: false,
            conflict_paths,
            strategy,
        }
    }

    fn manual(conflict_paths: Vec<String>, strategy: ResolutionStrategy) -> Self {
        Self {
            merged: None,
            needs_manual: true,
            conflict_paths,
            strategy,
        }
    }
}

/// Predefined conflict resolution strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Discard local changes, take the remote head
    RemoteWins,
    /// Keep local changes, overwrite the remote head
    LocalWins,
    /// Path-level merge with a deterministic tie-break (default)
    Auto,
    /// Never merge; always escalate
    Manual,
    /// Three-way merge against the common ancestor
    Merge,
}

impl ResolutionStrategy {
    /// Create a resolver for this strategy
    pub fn create_resolver(&self) -> Arc<dyn ConflictResolver> {
        match self {
            ResolutionStrategy::RemoteWins => Arc::new(RemoteWinsResolver),
            ResolutionStrategy::LocalWins => Arc::new(LocalWinsResolver),
            ResolutionStrategy::Auto => Arc::new(AutoResolver),
            ResolutionStrategy::Manual => Arc::new(ManualResolver),
            ResolutionStrategy::Merge => Arc::new(ThreeWayResolver),
        }
    }
}

/// Trait for conflict resolution strategies
#[async_trait::async_trait]
pub trait ConflictResolver: Send + Sync {
    /// Resolve a divergence between the local and remote trees
    async fn resolve(&self, ctx: &ConflictContext) -> Resolution;

    /// Get the name of this resolver
    fn name(&self) -> &'static str;
}

/// Takes the remote head wholesale; local edits on contested paths are
/// reported but discarded.
pub struct RemoteWinsResolver;

#[async_trait::async_trait]
impl ConflictResolver for RemoteWinsResolver {
    async fn resolve(&self, ctx: &ConflictContext) -> Resolution {
        let contested = ctx.contested_regions().into_iter().collect();
        Resolution::resolved(ctx.remote_tree.clone(), contested, ResolutionStrategy::RemoteWins)
    }

    fn name(&self) -> &'static str {
        "remote_wins"
    }
}

/// Keeps the local working tree wholesale.
pub struct LocalWinsResolver;

#[async_trait::async_trait]
impl ConflictResolver for LocalWinsResolver {
    async fn resolve(&self, ctx: &ConflictContext) -> Resolution {
        let contested = ctx.contested_regions().into_iter().collect();
        Resolution::resolved(ctx.local_tree.clone(), contested, ResolutionStrategy::LocalWins)
    }

    fn name(&self) -> &'static str {
        "local_wins"
    }
}

/// Path-level merge: paths touched by exactly one side take that side's
/// value; contested regions go to the tie-break winner.
pub struct AutoResolver;

#[async_trait::async_trait]
impl ConflictResolver for AutoResolver {
    async fn resolve(&self, ctx: &ConflictContext) -> Resolution {
        if let Some(region) = ctx.structurally_incompatible() {
            return Resolution::manual(vec![region], ResolutionStrategy::Auto);
        }

        let contested = ctx.contested_regions();
        let mut merged = ctx.remote_tree.clone();

        // Local-exclusive paths always take the local side.
        for path in &ctx.local_paths {
            let exclusive = !ctx.remote_paths.iter().any(|rp| paths::overlaps(path, rp));
            if exclusive {
                if apply_path_state(&mut merged, &ctx.local_tree, path).is_err() {
                    return Resolution::manual(vec![path.clone()], ResolutionStrategy::Auto);
                }
            }
        }

        // Contested regions go to the winning side; the merged tree
        // already carries the remote state, so only a local win writes.
        if ctx.local_wins_tie() {
            for region in &contested {
                if apply_path_state(&mut merged, &ctx.local_tree, region).is_err() {
                    return Resolution::manual(vec![region.clone()], ResolutionStrategy::Auto);
                }
            }
        }

        Resolution::resolved(merged, contested.into_iter().collect(), ResolutionStrategy::Auto)
    }

    fn name(&self) -> &'static str {
        "auto"
    }
}

/// Keeps both versions apart and always escalates.
pub struct ManualResolver;

#[async_trait::async_trait]
impl ConflictResolver for ManualResolver {
    async fn resolve(&self, ctx: &ConflictContext) -> Resolution {
        let contested = ctx.contested_regions().into_iter().collect();
        Resolution::manual(contested, ResolutionStrategy::Manual)
    }

    fn name(&self) -> &'static str {
        "manual"
    }
}

/// Three-way merge against the common ancestor. Identical changes on both
/// sides are not conflicts; paths changed differently escalate.
pub struct ThreeWayResolver;

#[async_trait::async_trait]
impl ConflictResolver for ThreeWayResolver {
    async fn resolve(&self, ctx: &ConflictContext) -> Resolution {
        let base = match &ctx.base_tree {
            Some(base) => base,
            None => {
                // No ancestor to diff against; refuse rather than guess.
                let contested = ctx.contested_regions().into_iter().collect();
                return Resolution::manual(contested, ResolutionStrategy::Merge);
            }
        };

        let local_delta = compute_delta(base, &ctx.local_tree);
        let remote_delta = compute_delta(base, &ctx.remote_tree);

        let mut escalated: BTreeSet<String> = BTreeSet::new();
        for lp in local_delta.changed_paths() {
            for rp in remote_delta.changed_paths() {
                if paths::overlaps(&lp, &rp)
                    && !identical_change(&local_delta, &remote_delta, &lp, &rp)
                {
                    let region = if lp == rp || paths::is_ancestor(&lp, &rp) {
                        lp.clone()
                    } else {
                        rp.clone()
                    };
                    escalated.insert(region);
                }
            }
        }

        if !escalated.is_empty() {
            return Resolution::manual(
                escalated.into_iter().collect(),
                ResolutionStrategy::Merge,
            );
        }

        // Every overlap is an identical change, so the union delta is
        // overlap-free and applies cleanly to the ancestor.
        let mut combined = ConfigDelta::default();
        combined.added.extend(local_delta.added);
        combined.added.extend(remote_delta.added);
        combined.modified.extend(local_delta.modified);
        combined.modified.extend(remote_delta.modified);
        combined.deleted.extend(local_delta.deleted);
        combined.deleted.extend(remote_delta.deleted);

        match crate::delta::apply_delta(base, &combined) {
            Ok(merged) => Resolution::resolved(merged, Vec::new(), ResolutionStrategy::Merge),
            Err(err) => Resolution::manual(
                vec![err.to_string()],
                ResolutionStrategy::Merge,
            ),
        }
    }

    fn name(&self) -> &'static str {
        "merge"
    }
}

/// Whether two overlapping changed paths describe the same change on both
/// sides: the identical path, with the identical outcome.
fn identical_change(local: &ConfigDelta, remote: &ConfigDelta, lp: &str, rp: &str) -> bool {
    if lp != rp {
        return false;
    }
    let local_value = local.added.get(lp).or_else(|| local.modified.get(lp));
    let remote_value = remote.added.get(rp).or_else(|| remote.modified.get(rp));
    match (local_value, remote_value) {
        (Some(a), Some(b)) => a == b,
        (None, None) => local.deleted.contains(lp) && remote.deleted.contains(rp),
        _ => false,
    }
}

/// Copy one side's state at `path` into `merged`: set when present,
/// remove when the side deleted it.
fn apply_path_state(
    merged: &mut Value,
    source: &Value,
    path: &str,
) -> Result<(), crate::delta::DeltaError> {
    match paths::get(source, path) {
        Some(value) => paths::set(merged, path, value.clone()),
        None => match paths::remove(merged, path) {
            Ok(_) => Ok(()),
            // Already absent on the other side as well.
            Err(crate::delta::DeltaError::PathNotFound(_)) => Ok(()),
            Err(err) => Err(err),
        },
    }
}

/// Convenience function to resolve a conflict using a strategy
pub async fn resolve_with(strategy: ResolutionStrategy, ctx: &ConflictContext) -> Resolution {
    let resolver = strategy.create_resolver();
    resolver.resolve(ctx).await
}
