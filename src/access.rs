//! # Access Control
//!
//! Rules decide which captures an audience may see. A rule names a set of
//! SURT prefixes, a capture-time window, an access-time window, and a policy;
//! a policy maps named access points (`public`, `staff`, …) to allow/deny.
//!
//! ## Decision Algorithm
//!
//! For a capture at `url`/`capture_time` seen through `access_point` at
//! `access_time`:
//!
//! 1. canonicalize `url` to its SURT key
//! 2. collect rules with a prefix of that key (an empty prefix list matches
//!    everything)
//! 3. keep rules whose `period` contains the capture time and whose
//!    `access_period` contains the access time
//! 4. order by `(pinned desc, matched-prefix length desc, id asc)` — most
//!    specific wins, pinning overrides specificity, ids break ties so the
//!    result is deterministic
//! 5. the first rule's policy answers; no match means allowed
//!
//! ## Storage
//!
//! Rules and policies persist as JSON values in their own keyspaces and flow
//! through the normal batch/changelog path, so secondaries replicate them
//! like any other record. A full copy lives in memory (rule counts are tiny
//! next to capture counts) and is rebuilt from the keyspaces at open.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::codec::{id_from_key, policy_key, rule_key, BatchOp, NS_POLICY, NS_RULE};
use crate::error::{Error, Result, RuleViolation};
use crate::index::Index;
use crate::records::{now_ts14, validate_timestamp};
use crate::surt::Canonicalizer;

// =============================================================================
// Domain Types
// =============================================================================

/// A closed time window over 14-digit timestamps; `None` bounds are open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Period {
    pub from: Option<u64>,
    pub to: Option<u64>,
}

impl Period {
    pub fn contains(&self, timestamp: u64) -> bool {
        self.from.map_or(true, |from| timestamp >= from)
            && self.to.map_or(true, |to| timestamp <= to)
    }

    fn violations(&self, field: &str, out: &mut Vec<RuleViolation>) {
        for bound in [self.from, self.to].into_iter().flatten() {
            if validate_timestamp(bound).is_err() {
                out.push(RuleViolation::new(field, format!("timestamp out of range: {bound}")));
            }
        }
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                out.push(RuleViolation::new(field, format!("inverted period: {from} > {to}")));
            }
        }
    }
}

/// Audit stamp on a rule: who touched it and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleStamp {
    /// 14-digit UTC timestamp.
    pub date: u64,
    pub user: String,
}

/// One access rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessRule {
    /// Server-assigned id; absent on first submission.
    pub id: Option<u64>,
    /// The policy this rule selects.
    pub policy_id: u64,
    /// SURT prefixes this rule covers; empty matches any capture.
    pub surts: Vec<String>,
    /// Capture-time window.
    pub period: Period,
    /// Access-time window.
    pub access_period: Period,
    /// Pinned rules sort ahead of everything else.
    pub pinned: bool,
    pub private_comment: Option<String>,
    pub public_comment: Option<String>,
    pub created: Option<RuleStamp>,
    pub modified: Option<RuleStamp>,
}

impl AccessRule {
    /// Length of the longest prefix matching `surt`, or `None` when the rule
    /// does not cover it. An empty prefix list covers everything at
    /// specificity zero.
    fn matched_prefix_len(&self, surt: &str) -> Option<usize> {
        if self.surts.is_empty() {
            return Some(0);
        }
        self.surts
            .iter()
            .filter(|prefix| surt.starts_with(prefix.as_str()))
            .map(|prefix| prefix.len())
            .max()
    }

    /// Substring search over the rule's visible text, for listing filters.
    pub fn contains(&self, search: &str) -> bool {
        let search = search.to_ascii_lowercase();
        self.surts.iter().any(|s| s.to_ascii_lowercase().contains(&search))
            || self
                .public_comment
                .as_deref()
                .is_some_and(|c| c.to_ascii_lowercase().contains(&search))
            || self
                .private_comment
                .as_deref()
                .is_some_and(|c| c.to_ascii_lowercase().contains(&search))
    }

    /// First SURT prefix in sorted order, used by surt-ordered listings.
    fn first_surt(&self) -> &str {
        self.surts.iter().map(String::as_str).min().unwrap_or("")
    }
}

/// A named mapping from access points to allow/deny.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessPolicy {
    /// Server-assigned id; absent on first submission.
    pub id: Option<u64>,
    pub name: String,
    /// Allowed access points; anything absent is denied.
    pub access_points: BTreeMap<String, bool>,
}

/// The outcome of an access check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDecision {
    pub allowed: bool,
    pub rule_id: Option<u64>,
    pub policy_id: Option<u64>,
    pub public_comment: Option<String>,
}

impl AccessDecision {
    fn allow_by_default() -> Self {
        Self {
            allowed: true,
            rule_id: None,
            policy_id: None,
            public_comment: None,
        }
    }
}

/// Sort orders for rule listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSort {
    Id,
    IdDescending,
    /// `(pinned, first SURT prefix, id)`.
    Surt,
    SurtDescending,
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// In-memory mirror of the rule and policy keyspaces.
pub(crate) struct AccessStore {
    inner: RwLock<AccessInner>,
}

#[derive(Default)]
struct AccessInner {
    rules: BTreeMap<u64, AccessRule>,
    policies: BTreeMap<u64, AccessPolicy>,
}

impl AccessStore {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(AccessInner::default()),
        }
    }

    /// Mirrors one committed op into memory. Called for every rule/policy op
    /// on the commit and replication paths.
    pub(crate) fn apply_op(&self, op: &BatchOp) {
        let Some(&ns) = op.key().first() else { return };
        let Ok(id) = id_from_key(op.key()) else {
            warn!("ignoring malformed access-control key");
            return;
        };
        let mut inner = self.inner.write();
        match (ns, op) {
            (NS_RULE, BatchOp::Put { value, .. }) => match serde_json::from_slice::<AccessRule>(value) {
                Ok(mut rule) => {
                    rule.id = Some(id);
                    inner.rules.insert(id, rule);
                }
                Err(e) => warn!(id, error = %e, "ignoring undecodable access rule"),
            },
            (NS_RULE, BatchOp::Delete { .. }) => {
                inner.rules.remove(&id);
            }
            (NS_POLICY, BatchOp::Put { value, .. }) => {
                match serde_json::from_slice::<AccessPolicy>(value) {
                    Ok(mut policy) => {
                        policy.id = Some(id);
                        inner.policies.insert(id, policy);
                    }
                    Err(e) => warn!(id, error = %e, "ignoring undecodable access policy"),
                }
            }
            (NS_POLICY, BatchOp::Delete { .. }) => {
                inner.policies.remove(&id);
            }
            _ => {}
        }
    }

    fn next_rule_id(&self) -> u64 {
        self.inner.read().rules.keys().max().copied().unwrap_or(0) + 1
    }

    fn next_policy_id(&self) -> u64 {
        self.inner.read().policies.keys().max().copied().unwrap_or(0) + 1
    }
}

// =============================================================================
// Index Operations
// =============================================================================

impl Index {
    /// Lists rules, optionally substring-filtered, in the requested order.
    pub fn list_rules(&self, search: Option<&str>, sort: RuleSort) -> Vec<AccessRule> {
        let inner = self.access_store().inner.read();
        let mut rules: Vec<AccessRule> = inner
            .rules
            .values()
            .filter(|rule| search.map_or(true, |s| rule.contains(s)))
            .cloned()
            .collect();
        drop(inner);

        match sort {
            RuleSort::Id | RuleSort::IdDescending => {
                rules.sort_by_key(|r| r.id);
            }
            RuleSort::Surt | RuleSort::SurtDescending => {
                rules.sort_by(|a, b| {
                    (!a.pinned, a.first_surt(), a.id).cmp(&(!b.pinned, b.first_surt(), b.id))
                });
            }
        }
        if matches!(sort, RuleSort::IdDescending | RuleSort::SurtDescending) {
            rules.reverse();
        }
        rules
    }

    /// Fetches one rule.
    pub fn rule(&self, id: u64) -> Option<AccessRule> {
        self.access_store().inner.read().rules.get(&id).cloned()
    }

    /// Creates or updates a rule, returning its id.
    ///
    /// Validation reports every violation at once as [`Error::RuleInvalid`].
    pub fn put_rule(&self, mut rule: AccessRule, user: &str) -> Result<u64> {
        let violations = self.validate_rule(&rule);
        if !violations.is_empty() {
            return Err(Error::RuleInvalid(violations));
        }

        let store = self.access_store();
        let id = match rule.id {
            Some(id) => {
                let existing = store.inner.read().rules.get(&id).cloned();
                match existing {
                    Some(existing) => rule.created = existing.created,
                    None => return Err(Error::NotFound(format!("rule {id}"))),
                }
                id
            }
            None => store.next_rule_id(),
        };
        rule.id = Some(id);

        let stamp = RuleStamp {
            date: now_ts14(),
            user: user.to_string(),
        };
        if rule.created.is_none() {
            rule.created = Some(stamp.clone());
        }
        rule.modified = Some(stamp);

        let value = serde_json::to_vec(&rule)
            .map_err(|e| Error::Internal(format!("rule encoding: {e}")))?;
        let mut batch = self.begin_update()?;
        batch.put_raw(rule_key(id), value)?;
        batch.commit()?;
        Ok(id)
    }

    /// Deletes a rule; false when it did not exist.
    pub fn delete_rule(&self, id: u64) -> Result<bool> {
        if self.access_store().inner.read().rules.get(&id).is_none() {
            return Ok(false);
        }
        let mut batch = self.begin_update()?;
        batch.delete_raw(rule_key(id))?;
        batch.commit()?;
        Ok(true)
    }

    /// Lists policies in id order.
    pub fn list_policies(&self) -> Vec<AccessPolicy> {
        self.access_store().inner.read().policies.values().cloned().collect()
    }

    /// Fetches one policy.
    pub fn policy(&self, id: u64) -> Option<AccessPolicy> {
        self.access_store().inner.read().policies.get(&id).cloned()
    }

    /// Creates or updates a policy, returning its id.
    pub fn put_policy(&self, mut policy: AccessPolicy) -> Result<u64> {
        let mut violations = Vec::new();
        if policy.name.trim().is_empty() {
            violations.push(RuleViolation::new("name", "policy name must not be empty"));
        }
        if let Some(id) = policy.id {
            if self.access_store().inner.read().policies.get(&id).is_none() {
                return Err(Error::NotFound(format!("policy {id}")));
            }
        }
        if !violations.is_empty() {
            return Err(Error::RuleInvalid(violations));
        }

        let id = policy.id.unwrap_or_else(|| self.access_store().next_policy_id());
        policy.id = Some(id);

        let value = serde_json::to_vec(&policy)
            .map_err(|e| Error::Internal(format!("policy encoding: {e}")))?;
        let mut batch = self.begin_update()?;
        batch.put_raw(policy_key(id), value)?;
        batch.commit()?;
        Ok(id)
    }

    fn validate_rule(&self, rule: &AccessRule) -> Vec<RuleViolation> {
        let mut violations = Vec::new();

        for surt in &rule.surts {
            if surt.is_empty() {
                violations.push(RuleViolation::new("surts", "empty prefix"));
            } else if surt.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
                violations.push(RuleViolation::new(
                    "surts",
                    format!("malformed prefix: {surt:?}"),
                ));
            }
        }
        rule.period.violations("period", &mut violations);
        rule.access_period.violations("access_period", &mut violations);
        if self.policy(rule.policy_id).is_none() {
            violations.push(RuleViolation::new(
                "policy_id",
                format!("no such policy: {}", rule.policy_id),
            ));
        }
        violations
    }

    /// Decides whether `access_point` may see the capture of `url` taken at
    /// `capture_time`, evaluated at `access_time`.
    pub fn check_access(
        &self,
        canonicalizer: &Canonicalizer,
        access_point: &str,
        url: &str,
        capture_time: u64,
        access_time: u64,
    ) -> Result<AccessDecision> {
        let surt = canonicalizer.surt(url)?;
        self.check_access_surt(access_point, &surt, capture_time, access_time)
    }

    /// Decision over an already-canonicalized key.
    pub fn check_access_surt(
        &self,
        access_point: &str,
        surt: &str,
        capture_time: u64,
        access_time: u64,
    ) -> Result<AccessDecision> {
        let inner = self.access_store().inner.read();

        let mut matches: Vec<(&AccessRule, usize)> = inner
            .rules
            .values()
            .filter_map(|rule| rule.matched_prefix_len(surt).map(|len| (rule, len)))
            .filter(|(rule, _)| {
                rule.period.contains(capture_time) && rule.access_period.contains(access_time)
            })
            .collect();

        // pinned first, then most specific prefix, then lowest id
        matches.sort_by_key(|(rule, len)| (!rule.pinned, std::cmp::Reverse(*len), rule.id));

        let Some((rule, _)) = matches.first() else {
            return Ok(AccessDecision::allow_by_default());
        };

        let allowed = inner
            .policies
            .get(&rule.policy_id)
            .and_then(|policy| policy.access_points.get(access_point).copied())
            .unwrap_or(false);

        Ok(AccessDecision {
            allowed,
            rule_id: rule.id,
            policy_id: Some(rule.policy_id),
            public_comment: rule.public_comment.clone(),
        })
    }

    /// Bulk decision check; results in input order.
    pub fn check_access_bulk(
        &self,
        canonicalizer: &Canonicalizer,
        access_point: &str,
        queries: &[(String, u64)],
        access_time: u64,
    ) -> Result<Vec<AccessDecision>> {
        queries
            .iter()
            .map(|(url, capture_time)| {
                self.check_access(canonicalizer, access_point, url, *capture_time, access_time)
            })
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
