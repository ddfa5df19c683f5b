//! Role-based access evaluation.
//!
//! Every cluster-bound operation is described as an [`AccessRequest`] and
//! checked against the roles assigned to its subject. Rules only grant; the
//! absence of a matching rule is the only way to be denied.

use crate::{credential::UserId, Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    convert::Infallible,
    fmt,
    str::FromStr,
    sync::Arc,
};

/// Matches a single field of a request.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Pattern {
    /// Written as `*`.
    Any,
    Exact(String),
}

/// A grant: `verb` on `kind` objects matching `namespace`/`name` in clusters
/// matching `cluster`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessRule {
    pub kind: Pattern,
    pub verb: Pattern,
    #[serde(default)]
    pub namespace: Pattern,
    #[serde(default)]
    pub name: Pattern,
    #[serde(default)]
    pub cluster: Pattern,
}

/// Roles and their assignment to subjects.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleTable {
    #[serde(default)]
    pub roles: BTreeMap<String, Vec<AccessRule>>,
    #[serde(default)]
    pub assignments: BTreeMap<UserId, BTreeSet<String>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Role {
    pub name: String,
    pub rules: Vec<AccessRule>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequest {
    pub subject: UserId,
    pub cluster: String,
    pub verb: String,
    pub kind: String,
    /// Empty for cluster-scoped targets.
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow { role: String, rule: usize },
    Deny,
}

/// Evaluates requests against a shared, replaceable [`RoleTable`].
///
/// Clones share the same table, so an update through any handle is visible
/// to every subsequent evaluation.
#[derive(Clone, Debug, Default)]
pub struct Authorizer(Arc<RwLock<RoleTable>>);

// === impl Pattern ===

impl Pattern {
    pub fn exact(value: impl Into<String>) -> Self {
        Self::Exact(value.into())
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(v) => v == value,
        }
    }
}

impl Default for Pattern {
    fn default() -> Self {
        Self::Any
    }
}

impl FromStr for Pattern {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s.to_string()))
    }
}

impl From<String> for Pattern {
    fn from(s: String) -> Self {
        if s == "*" {
            Self::Any
        } else {
            Self::Exact(s)
        }
    }
}

impl From<Pattern> for String {
    fn from(p: Pattern) -> Self {
        p.to_string()
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Exact(v) => v.fmt(f),
        }
    }
}

// === impl AccessRule ===

impl AccessRule {
    pub fn new(verb: &str, kind: &str) -> Self {
        Self {
            kind: Pattern::from(kind.to_string()),
            verb: Pattern::from(verb.to_string()),
            namespace: Pattern::Any,
            name: Pattern::Any,
            cluster: Pattern::Any,
        }
    }

    pub fn in_namespace(mut self, namespace: &str) -> Self {
        self.namespace = Pattern::from(namespace.to_string());
        self
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Pattern::from(name.to_string());
        self
    }

    pub fn in_cluster(mut self, cluster: &str) -> Self {
        self.cluster = Pattern::from(cluster.to_string());
        self
    }

    pub fn matches(&self, req: &AccessRequest) -> bool {
        self.cluster.matches(&req.cluster)
            && self.verb.matches(&req.verb)
            && self.kind.matches(&req.kind)
            && self.namespace.matches(&req.namespace)
            && self.name.matches(&req.name)
    }
}

// === impl RoleTable ===

impl RoleTable {
    pub fn evaluate(&self, req: &AccessRequest) -> Decision {
        let Some(assigned) = self.assignments.get(&req.subject) else {
            return Decision::Deny;
        };

        for role in assigned {
            // An assignment to a role that doesn't exist grants nothing.
            let Some(rules) = self.roles.get(role) else {
                continue;
            };
            if let Some(rule) = rules.iter().position(|r| r.matches(req)) {
                return Decision::Allow {
                    role: role.clone(),
                    rule,
                };
            }
        }

        Decision::Deny
    }

    pub fn roles_for(&self, subject: &UserId) -> Vec<Role> {
        self.assignments
            .get(subject)
            .into_iter()
            .flatten()
            .filter_map(|name| {
                self.roles.get(name).map(|rules| Role {
                    name: name.clone(),
                    rules: rules.clone(),
                })
            })
            .collect()
    }
}

// === impl AccessRequest ===

impl AccessRequest {
    pub fn new(
        subject: UserId,
        cluster: impl Into<String>,
        verb: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            subject,
            cluster: cluster.into(),
            verb: verb.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn pod_logs(subject: UserId, cluster: &str, namespace: &str, pod: &str) -> Self {
        Self::new(subject, cluster, "get", "pods/log", namespace, pod)
    }

    pub fn pod_exec(subject: UserId, cluster: &str, namespace: &str, pod: &str) -> Self {
        Self::new(subject, cluster, "create", "pods/exec", namespace, pod)
    }

    pub fn node_terminal(subject: UserId, cluster: &str, node: &str) -> Self {
        Self::new(subject, cluster, "create", "nodes/terminal", "", node)
    }

    /// Registry operations are authorized against the `clusters` kind.
    pub fn cluster(subject: UserId, verb: &str, cluster: &str) -> Self {
        Self::new(subject, cluster, verb, "clusters", "", cluster)
    }

    pub fn credentials(subject: UserId, cluster: &str) -> Self {
        Self::new(subject, cluster, "update", "credentials", "", cluster)
    }
}

impl fmt::Display for AccessRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} may not {} {} ", self.subject, self.verb, self.kind)?;
        if !self.namespace.is_empty() {
            write!(f, "{}/", self.namespace)?;
        }
        write!(f, "{} in cluster {}", self.name, self.cluster)
    }
}

// === impl Decision ===

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

// === impl Authorizer ===

impl Authorizer {
    pub fn new(table: RoleTable) -> Self {
        Self(Arc::new(RwLock::new(table)))
    }

    pub fn authorize(&self, req: &AccessRequest) -> Decision {
        self.0.read().evaluate(req)
    }

    /// Fails closed with [`Error::PermissionDenied`] unless `req` is allowed.
    pub fn check(&self, req: &AccessRequest) -> Result<()> {
        match self.authorize(req) {
            Decision::Allow { role, rule } => {
                tracing::trace!(subject = %req.subject, %role, rule, "Allowed");
                Ok(())
            }
            Decision::Deny => {
                tracing::info!(
                    target: "kubedeck::audit",
                    subject = %req.subject,
                    cluster = %req.cluster,
                    verb = %req.verb,
                    kind = %req.kind,
                    namespace = %req.namespace,
                    name = %req.name,
                    "Denied"
                );
                Err(Error::PermissionDenied(req.to_string()))
            }
        }
    }

    pub fn replace(&self, table: RoleTable) {
        *self.0.write() = table;
    }

    pub fn snapshot(&self) -> RoleTable {
        self.0.read().clone()
    }

    pub fn put_role(&self, name: impl Into<String>, rules: Vec<AccessRule>) {
        self.0.write().roles.insert(name.into(), rules);
    }

    pub fn remove_role(&self, name: &str) {
        let mut table = self.0.write();
        table.roles.remove(name);
        for roles in table.assignments.values_mut() {
            roles.remove(name);
        }
    }

    pub fn assign(&self, subject: UserId, role: impl Into<String>) {
        self.0
            .write()
            .assignments
            .entry(subject)
            .or_default()
            .insert(role.into());
    }

    pub fn unassign(&self, subject: &UserId, role: &str) {
        let mut table = self.0.write();
        if let Some(roles) = table.assignments.get_mut(subject) {
            roles.remove(role);
            if roles.is_empty() {
                table.assignments.remove(subject);
            }
        }
    }
}
