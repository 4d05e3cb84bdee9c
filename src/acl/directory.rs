//! # Directory
//!
//! Group membership resolution. The real directory lives outside the service;
//! [`StaticDirectory`] serves membership from configuration.

use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Group membership lookups
pub trait Directory: Send + Sync {
    /// Every group `user` belongs to, directly or through nested groups.
    fn groups_for_user(&self, user: &str) -> HashSet<String>;

    /// Every user in `group`, directly or through nested groups.
    fn users_in_group(&self, group: &str) -> BTreeSet<String>;
}

/// Marker for a nested group in a member list, e.g. `@qa`.
const GROUP_PREFIX: char = '@';

/// Directory backed by a fixed group → members table.
///
/// A member written as `@name` pulls in every member of group `name`.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    groups: BTreeMap<String, Vec<String>>,
}

impl StaticDirectory {
    pub fn new(groups: BTreeMap<String, Vec<String>>) -> Self {
        Self { groups }
    }

    pub fn with_group<I, S>(mut self, group: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups
            .insert(group.into(), members.into_iter().map(Into::into).collect());
        self
    }

    fn collect_users(&self, group: &str, visited: &mut HashSet<String>, users: &mut BTreeSet<String>) {
        if !visited.insert(group.to_string()) {
            return;
        }
        let Some(members) = self.groups.get(group) else {
            return;
        };
        for member in members {
            match member.strip_prefix(GROUP_PREFIX) {
                Some(nested) => self.collect_users(nested, visited, users),
                None => {
                    users.insert(member.clone());
                }
            }
        }
    }
}

impl Directory for StaticDirectory {
    fn groups_for_user(&self, user: &str) -> HashSet<String> {
        self.groups
            .keys()
            .filter(|group| self.users_in_group(group).contains(user))
            .cloned()
            .collect()
    }

    fn users_in_group(&self, group: &str) -> BTreeSet<String> {
        let mut users = BTreeSet::new();
        self.collect_users(group, &mut HashSet::new(), &mut users);
        users
    }
}
