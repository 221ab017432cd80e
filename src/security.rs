//! Security Hook
//!
//! Authorization seam consulted before any operation executes. Denial
//! surfaces as an authorization error to the caller; it is never
//! silently dropped.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::replication::Operation;

/// Permission check over an operation and the identity submitting it
pub trait Authorizer: Send + Sync {
    fn authorize(&self, caller: Uuid, op: &Operation) -> Result<()>;
}

/// Permits everything; the default when no security collaborator is wired
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _caller: Uuid, _op: &Operation) -> Result<()> {
        Ok(())
    }
}

/// Per-resource allow list: resources with a rule admit only the listed
/// callers; resources without one stay open.
#[derive(Default)]
pub struct ResourceAcl {
    rules: HashMap<String, HashSet<Uuid>>,
}

impl ResourceAcl {
    /// Create an empty (fully open) ACL
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict a resource (lock namespace or map name) to a caller
    pub fn allow(&mut self, resource: impl Into<String>, caller: Uuid) {
        self.rules.entry(resource.into()).or_default().insert(caller);
    }

    fn resource_of(op: &Operation) -> &str {
        match op {
            Operation::Lock { namespace, .. } | Operation::Unlock { namespace, .. } => namespace,
            Operation::Put { map, .. } | Operation::Get { map, .. } => map,
        }
    }
}

impl Authorizer for ResourceAcl {
    fn authorize(&self, caller: Uuid, op: &Operation) -> Result<()> {
        let resource = Self::resource_of(op);
        match self.rules.get(resource) {
            None => Ok(()),
            Some(allowed) if allowed.contains(&caller) => Ok(()),
            Some(_) => Err(Error::AuthorizationDenied(format!(
                "{} may not {} on {}",
                caller,
                op.kind(),
                resource
            ))),
        }
    }
}
