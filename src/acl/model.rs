//! # ACL Model
//!
//! Policy nodes and their quota entries.
//!
//! Entries arrive over the wire (or from config) as loosely typed
//! [`AclEntrySpec`] values and are resolved once, when the ACL is stored, into
//! the closed [`AclEntry`] form. Evaluation never re-parses selector strings.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{AclError, AclResult};

/// ACL identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AclId(pub u64);

impl fmt::Display for AclId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to an ACL by id or by name.
///
/// Accepts a JSON number or a string; numeric strings (as produced by query
/// parameters) are taken as ids.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "AclRefRepr")]
pub enum AclRef {
    Id(AclId),
    Name(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AclRefRepr {
    Id(u64),
    Text(String),
}

impl From<AclRefRepr> for AclRef {
    fn from(repr: AclRefRepr) -> Self {
        match repr {
            AclRefRepr::Id(id) => AclRef::Id(AclId(id)),
            AclRefRepr::Text(text) => AclRef::parse(&text),
        }
    }
}

impl AclRef {
    pub fn parse(text: &str) -> Self {
        match text.trim().parse::<u64>() {
            Ok(id) => AclRef::Id(AclId(id)),
            Err(_) => AclRef::Name(text.to_string()),
        }
    }
}

impl fmt::Display for AclRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AclRef::Id(id) => write!(f, "{}", id),
            AclRef::Name(name) => write!(f, "{}", name),
        }
    }
}

/// Whom an entry applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// A single user id
    User(String),
    /// Every (transitive) member of a group
    Group(String),
    /// Every requester. Group limits cap the usage of all pool users together.
    Default,
}

impl Selector {
    pub fn kind(&self) -> &'static str {
        match self {
            Selector::User(_) => "user",
            Selector::Group(_) => "group",
            Selector::Default => "default",
        }
    }

    pub fn principal(&self) -> Option<&str> {
        match self {
            Selector::User(id) | Selector::Group(id) => Some(id),
            Selector::Default => None,
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.principal() {
            Some(principal) => write!(f, "{}:{}", self.kind(), principal),
            None => f.write_str(self.kind()),
        }
    }
}

/// Numeric constraints of an entry. Absent means unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryLimits {
    pub group_limit: Option<u64>,
    pub group_percent: Option<u64>,
    pub user_limit: Option<u64>,
    pub user_percent: Option<u64>,
    pub max_lease_hours: Option<u64>,
}

/// Constraint that rejected a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    MaxLeaseHours,
    UserLimit,
    UserPercent,
    GroupLimit,
    GroupPercent,
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Constraint::MaxLeaseHours => "maxLeaseHours",
            Constraint::UserLimit => "userLimit",
            Constraint::UserPercent => "userPercent",
            Constraint::GroupLimit => "groupLimit",
            Constraint::GroupPercent => "groupPercent",
        };
        f.write_str(name)
    }
}

/// A failed constraint check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub constraint: Constraint,
    /// Effective limit (percentages already converted to a resource count)
    pub limit: u64,
    /// Usage counted against the limit before this request
    pub used: u64,
    /// Amount requested (resources, or lease hours)
    pub requested: u64,
}

/// Usage figures an entry is checked against
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryUsage {
    /// Size of the ACL's pool
    pub pool_size: u64,
    /// Resources currently held by the requesting user
    pub user: u64,
    /// Resources currently held by all members of the entry's group
    pub group: u64,
}

/// Floor of `pool_size * percent / 100`.
pub fn percent_of_pool(pool_size: u64, percent: u64) -> u64 {
    pool_size.saturating_mul(percent) / 100
}

/// One resolved quota rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "AclEntrySpec", into = "AclEntrySpec")]
pub struct AclEntry {
    pub priority: u32,
    pub selector: Selector,
    pub limits: EntryLimits,
    /// Stored and returned; admission does not consult it.
    pub preemptable_use: bool,
}

impl AclEntry {
    fn new(selector: Selector, limits: EntryLimits) -> Self {
        Self {
            priority: 0,
            selector,
            limits,
            preemptable_use: false,
        }
    }

    pub fn user(id: impl Into<String>, limits: EntryLimits) -> Self {
        Self::new(Selector::User(id.into()), limits)
    }

    pub fn group(name: impl Into<String>, limits: EntryLimits) -> Self {
        Self::new(Selector::Group(name.into()), limits)
    }

    /// Entry applying to every requester.
    pub fn everyone(limits: EntryLimits) -> Self {
        Self::new(Selector::Default, limits)
    }

    /// Whether this entry governs `user`, given the user's transitive groups.
    pub fn applies_to(&self, user: &str, groups: &HashSet<String>) -> bool {
        match &self.selector {
            Selector::User(id) => id == user,
            Selector::Group(group) => groups.contains(group),
            Selector::Default => true,
        }
    }

    /// Check a request of `delta` resources (and optional lease length).
    ///
    /// User entries cap the requester's own usage. Group and default entries
    /// cap the aggregate usage they cover and, when they carry user limits,
    /// each covered user's own usage.
    pub fn check(&self, usage: &EntryUsage, delta: u64, lease_hours: Option<u64>) -> Option<Violation> {
        let limits = &self.limits;

        if let (Some(max), Some(hours)) = (limits.max_lease_hours, lease_hours) {
            if hours > max {
                return Some(Violation {
                    constraint: Constraint::MaxLeaseHours,
                    limit: max,
                    used: 0,
                    requested: hours,
                });
            }
        }

        if !matches!(self.selector, Selector::User(_)) {
            let group_checks = [
                (Constraint::GroupLimit, limits.group_limit),
                (
                    Constraint::GroupPercent,
                    limits.group_percent.map(|p| percent_of_pool(usage.pool_size, p)),
                ),
            ];
            if let Some(violation) = first_exceeded(&group_checks, usage.group, delta) {
                return Some(violation);
            }
        }

        let user_checks = [
            (Constraint::UserLimit, limits.user_limit),
            (
                Constraint::UserPercent,
                limits.user_percent.map(|p| percent_of_pool(usage.pool_size, p)),
            ),
        ];
        first_exceeded(&user_checks, usage.user, delta)
    }
}

fn first_exceeded(checks: &[(Constraint, Option<u64>)], used: u64, delta: u64) -> Option<Violation> {
    checks.iter().find_map(|&(constraint, limit)| {
        let limit = limit?;
        (used.saturating_add(delta) > limit).then_some(Violation {
            constraint,
            limit,
            used,
            requested: delta,
        })
    })
}

/// Wire form of an entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AclEntrySpec {
    #[serde(default)]
    pub priority: i64,
    /// `user`, `group` or `default`
    #[serde(rename = "type")]
    pub kind: String,
    /// User id or group name. Ignored for `default`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_percent: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_percent: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_lease_hours: Option<i64>,
    #[serde(default, alias = "preemptableuse", skip_serializing_if = "std::ops::Not::not")]
    pub preemptable_use: bool,
}

fn non_negative(field: &str, value: Option<i64>) -> AclResult<Option<u64>> {
    match value {
        None => Ok(None),
        Some(v) if v < 0 => Err(AclError::configuration(
            None,
            format!("{} must be non-negative, got {}", field, v),
        )),
        Some(v) => Ok(Some(v as u64)),
    }
}

fn percentage(field: &str, value: Option<i64>) -> AclResult<Option<u64>> {
    let value = non_negative(field, value)?;
    match value {
        Some(v) if v > 100 => Err(AclError::configuration(
            None,
            format!("{} must be at most 100, got {}", field, v),
        )),
        other => Ok(other),
    }
}

impl TryFrom<AclEntrySpec> for AclEntry {
    type Error = AclError;

    fn try_from(spec: AclEntrySpec) -> AclResult<Self> {
        let principal = spec
            .principal
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());

        let selector = match (spec.kind.as_str(), principal) {
            ("user", Some(id)) => Selector::User(id),
            ("group", Some(group)) => Selector::Group(group),
            ("default", _) => Selector::Default,
            ("user" | "group", None) => {
                return Err(AclError::configuration(
                    None,
                    format!("{} entry has no principal", spec.kind),
                ))
            }
            (other, _) => {
                return Err(AclError::configuration(
                    None,
                    format!("unknown selector type '{}'", other),
                ))
            }
        };

        let priority = non_negative("priority", Some(spec.priority))?.unwrap_or(0);
        let priority = u32::try_from(priority).map_err(|_| {
            AclError::configuration(None, format!("priority {} is out of range", priority))
        })?;

        Ok(Self {
            priority,
            selector,
            limits: EntryLimits {
                group_limit: non_negative("groupLimit", spec.group_limit)?,
                group_percent: percentage("groupPercent", spec.group_percent)?,
                user_limit: non_negative("userLimit", spec.user_limit)?,
                user_percent: percentage("userPercent", spec.user_percent)?,
                max_lease_hours: non_negative("maxLeaseHours", spec.max_lease_hours)?,
            },
            preemptable_use: spec.preemptable_use,
        })
    }
}

impl From<AclEntry> for AclEntrySpec {
    fn from(entry: AclEntry) -> Self {
        let signed = |v: Option<u64>| v.map(|v| v as i64);
        Self {
            priority: entry.priority as i64,
            kind: entry.selector.kind().to_string(),
            principal: entry.selector.principal().map(str::to_string),
            group_limit: signed(entry.limits.group_limit),
            group_percent: signed(entry.limits.group_percent),
            user_limit: signed(entry.limits.user_limit),
            user_percent: signed(entry.limits.user_percent),
            max_lease_hours: signed(entry.limits.max_lease_hours),
            preemptable_use: entry.preemptable_use,
        }
    }
}

/// Resolve a list of wire entries, sorted by priority.
pub fn resolve_entries(specs: Vec<AclEntrySpec>) -> AclResult<Vec<AclEntry>> {
    let mut entries = specs
        .into_iter()
        .map(AclEntry::try_from)
        .collect::<AclResult<Vec<_>>>()?;
    entries.sort_by_key(|e| e.priority);
    Ok(entries)
}

/// Policy node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Acl {
    pub id: AclId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<AclId>,
    pub owner: String,
    pub name: String,
    pub entries: Vec<AclEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Acl {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// Request to create an ACL
#[derive(Debug, Clone, Deserialize)]
pub struct NewAcl {
    pub name: String,
    pub owner: String,
    #[serde(default)]
    pub parent: Option<AclRef>,
    #[serde(default)]
    pub entries: Vec<AclEntrySpec>,
}

/// Partial update of an ACL. Entries, when given, replace the existing set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateAcl {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub parent: Option<AclRef>,
    #[serde(default)]
    pub entries: Option<Vec<AclEntrySpec>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(kind: &str, principal: &str) -> AclEntrySpec {
        AclEntrySpec {
            kind: kind.to_string(),
            principal: Some(principal.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_percent_floor() {
        assert_eq!(percent_of_pool(6, 70), 4);
        assert_eq!(percent_of_pool(6, 50), 3);
        assert_eq!(percent_of_pool(6, 84), 5);
        assert_eq!(percent_of_pool(0, 100), 0);
    }

    #[test]
    fn test_resolve_user_and_group() {
        let entry = AclEntry::try_from(AclEntrySpec {
            user_limit: Some(5),
            ..spec("user", "alice")
        })
        .unwrap();
        assert_eq!(entry.selector, Selector::User("alice".into()));
        assert_eq!(entry.limits.user_limit, Some(5));

        let entry = AclEntry::try_from(spec("group", "qa")).unwrap();
        assert_eq!(entry.selector, Selector::Group("qa".into()));
    }

    #[test]
    fn test_resolve_default_entry() {
        let entry = AclEntry::try_from(AclEntrySpec {
            principal: None,
            user_limit: Some(5),
            preemptable_use: true,
            ..spec("default", "")
        })
        .unwrap();
        assert_eq!(entry.selector, Selector::Default);
        assert!(entry.preemptable_use);
        assert!(entry.applies_to("anyone", &HashSet::new()));
        assert_eq!(entry.selector.to_string(), "default");

        // A stray principal on a default entry is ignored.
        let entry = AclEntry::try_from(spec("default", "qa")).unwrap();
        assert_eq!(entry.selector, Selector::Default);
        assert!(!entry.preemptable_use);
    }

    #[test]
    fn test_default_entry_json_shape() {
        let entry: AclEntry =
            serde_json::from_str(r#"{"type": "default", "group_percent": 84, "preemptableuse": true}"#)
                .unwrap();
        assert_eq!(entry.limits.group_percent, Some(84));
        assert!(entry.preemptable_use);

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "default");
        assert!(json.get("principal").is_none());
        assert_eq!(json["preemptable_use"], true);

        let plain = serde_json::to_value(AclEntry::user("alice", EntryLimits::default())).unwrap();
        assert!(plain.get("preemptable_use").is_none());
    }

    #[test]
    fn test_default_group_limit_counts_everyone() {
        let entry = AclEntry::everyone(EntryLimits {
            group_limit: Some(5),
            ..Default::default()
        });
        let usage = EntryUsage {
            pool_size: 6,
            user: 1,
            group: 3,
        };
        assert!(entry.check(&usage, 2, None).is_none());
        let violation = entry.check(&usage, 3, None).unwrap();
        assert_eq!(violation.constraint, Constraint::GroupLimit);
        assert_eq!(violation.used, 3);
    }

    #[test]
    fn test_malformed_entries_are_configuration_errors() {
        let unknown = AclEntry::try_from(spec("team", "qa")).unwrap_err();
        assert!(matches!(unknown, AclError::Configuration { .. }));

        let negative = AclEntry::try_from(AclEntrySpec {
            group_limit: Some(-1),
            ..spec("group", "qa")
        })
        .unwrap_err();
        assert!(negative.to_string().contains("groupLimit"));

        let over = AclEntry::try_from(AclEntrySpec {
            user_percent: Some(101),
            ..spec("user", "alice")
        })
        .unwrap_err();
        assert!(over.to_string().contains("userPercent"));

        let missing = AclEntry::try_from(AclEntrySpec {
            principal: None,
            ..spec("user", "")
        })
        .unwrap_err();
        assert!(matches!(missing, AclError::Configuration { .. }));
    }

    #[test]
    fn test_entries_sorted_by_priority() {
        let entries = resolve_entries(vec![
            AclEntrySpec {
                priority: 5,
                ..spec("user", "bob")
            },
            AclEntrySpec {
                priority: 1,
                ..spec("group", "qa")
            },
        ])
        .unwrap();
        assert_eq!(entries[0].selector, Selector::Group("qa".into()));
        assert_eq!(entries[1].priority, 5);
    }

    #[test]
    fn test_entry_json_shape() {
        let entry: AclEntry = serde_json::from_str(
            r#"{"type": "group", "principal": "qa", "group_percent": 70, "max_lease_hours": 12}"#,
        )
        .unwrap();
        assert_eq!(entry.limits.group_percent, Some(70));

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "group");
        assert_eq!(json["principal"], "qa");
        assert!(json.get("user_limit").is_none());

        let bad: Result<AclEntry, _> = serde_json::from_str(r#"{"type": "role", "principal": "x"}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_acl_ref_parsing() {
        let by_id: AclRef = serde_json::from_str("12").unwrap();
        assert_eq!(by_id, AclRef::Id(AclId(12)));
        let numeric_text: AclRef = serde_json::from_str(r#""12""#).unwrap();
        assert_eq!(numeric_text, AclRef::Id(AclId(12)));
        let by_name: AclRef = serde_json::from_str(r#""lab-a""#).unwrap();
        assert_eq!(by_name, AclRef::Name("lab-a".into()));
    }

    #[test]
    fn test_lease_hours_check() {
        let entry = AclEntry::group(
            "qa",
            EntryLimits {
                max_lease_hours: Some(12),
                ..Default::default()
            },
        );
        let usage = EntryUsage::default();
        assert!(entry.check(&usage, 1, Some(12)).is_none());
        assert!(entry.check(&usage, 5, Some(12)).is_none());
        assert!(entry.check(&usage, 1, None).is_none());
        let violation = entry.check(&usage, 1, Some(13)).unwrap();
        assert_eq!(violation.constraint, Constraint::MaxLeaseHours);
    }
}
