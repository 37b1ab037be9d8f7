use std::collections::HashMap;
use std::sync::RwLock;

use agentbox_types::{Environment, EnvironmentStatus};

use crate::selector::Selector;

/// Filters applied by `list`, in order: status equality, label selector,
/// pagination window.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<EnvironmentStatus>,
    pub selector: Option<Selector>,
    pub limit: usize,
    pub offset: usize,
}

/// In-memory authoritative map of environment records.
///
/// `get` and `list` hand out deep copies so callers (including JSON encoders
/// on other tasks) can never observe a partially-mutated record; pod-phase
/// refresh writes into a record while a handler may be serialising it.
pub struct Registry {
    envs: RwLock<HashMap<String, Environment>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            envs: RwLock::new(HashMap::new()),
        }
    }

    /// Insert-if-absent. A duplicate ID is rejected, which is what stops two
    /// provisioning workflows from ever targeting the same environment.
    pub fn insert(&self, env: Environment) -> Result<(), Environment> {
        let mut envs = self.envs.write().expect("registry lock poisoned");
        if envs.contains_key(&env.id) {
            return Err(env);
        }
        envs.insert(env.id.clone(), env);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Environment> {
        self.envs
            .read()
            .expect("registry lock poisoned")
            .get(id)
            .cloned()
    }

    /// Snapshot listing. Results are ordered by creation time (then ID, for
    /// records created in the same instant) so pagination windows compose.
    /// `total` counts every record matching the non-pagination filters.
    pub fn list(&self, filter: &ListFilter) -> (Vec<Environment>, usize) {
        let envs = self.envs.read().expect("registry lock poisoned");
        let mut matched: Vec<&Environment> = envs
            .values()
            .filter(|e| filter.status.is_none_or(|s| e.status == s))
            .filter(|e| {
                filter
                    .selector
                    .as_ref()
                    .is_none_or(|sel| sel.matches(&e.labels))
            })
            .collect();
        matched.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        let total = matched.len();
        let page = matched
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .cloned()
            .collect();
        (page, total)
    }

    /// Apply `f` to the record under the write lock. Returns the mutated
    /// snapshot, or None for an unknown ID.
    pub fn mutate<F>(&self, id: &str, f: F) -> Option<Environment>
    where
        F: FnOnce(&mut Environment),
    {
        let mut envs = self.envs.write().expect("registry lock poisoned");
        let env = envs.get_mut(id)?;
        f(env);
        Some(env.clone())
    }

    pub fn remove(&self, id: &str) -> Option<Environment> {
        self.envs
            .write()
            .expect("registry lock poisoned")
            .remove(id)
    }

    pub fn len(&self) -> usize {
        self.envs.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
