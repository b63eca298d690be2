use std::collections::{HashMap, HashSet};

use crate::{AccessError, Datasource, QueryContext};

/// Permission checks run before any query of a context is fetched.
pub trait SecurityManager: Send + Sync {
    /// Fails when the acting principal may not read the context's datasource.
    fn raise_for_access(&self, context: &QueryContext) -> Result<(), AccessError>;

    /// Row-level-security filter ids applying to the principal on `datasource`.
    fn row_level_security_ids(&self, datasource: &dyn Datasource) -> Vec<i64>;
}

/// Grants everything and applies no row-level filters.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl SecurityManager for AllowAll {
    fn raise_for_access(&self, _context: &QueryContext) -> Result<(), AccessError> {
        Ok(())
    }

    fn row_level_security_ids(&self, _datasource: &dyn Datasource) -> Vec<i64> {
        Vec::new()
    }
}

/// Fixed grant list keyed by datasource uid.
#[derive(Debug, Clone, Default)]
pub struct StaticAccessPolicy {
    allowed: HashSet<String>,
    row_level_security: HashMap<String, Vec<i64>>,
}

impl StaticAccessPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(mut self, datasource_uid: impl Into<String>) -> Self {
        self.allowed.insert(datasource_uid.into());
        self
    }

    pub fn with_row_level_security(
        mut self,
        datasource_uid: impl Into<String>,
        filter_ids: Vec<i64>,
    ) -> Self {
        self.row_level_security
            .insert(datasource_uid.into(), filter_ids);
        self
    }
}

impl SecurityManager for StaticAccessPolicy {
    fn raise_for_access(&self, context: &QueryContext) -> Result<(), AccessError> {
        let uid = context.datasource().uid();
        if self.allowed.contains(&uid) {
            Ok(())
        } else {
            Err(AccessError::DatasourceDenied { datasource: uid })
        }
    }

    fn row_level_security_ids(&self, datasource: &dyn Datasource) -> Vec<i64> {
        let mut ids = self
            .row_level_security
            .get(&datasource.uid())
            .cloned()
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }
}
