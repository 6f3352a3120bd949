//! Task catalog.
//!
//! The set of diagnostic tasks is closed: it is built once at startup
//! ([`TaskCatalog::builtin`]) and shared read-only by every session.
//! Order is stable and ids are unique.

mod builtin;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{DiagError, DiagResult};
use crate::executor::TaskAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    System,
    Hardware,
    Network,
    Storage,
    Services,
    Logs,
    Drivers,
    Other,
}

/// An immutable task definition bound to its executable content.
pub struct TaskDescriptor {
    /// Stable key derived from the display name
    pub id: String,
    pub display_name: String,
    pub description: String,
    pub category: TaskCategory,
    pub requires_elevation: bool,
    action: Arc<dyn TaskAction>,
}

impl std::fmt::Debug for TaskDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("requires_elevation", &self.requires_elevation)
            .finish_non_exhaustive()
    }
}

impl TaskDescriptor {
    pub fn new(
        display_name: &str,
        description: &str,
        category: TaskCategory,
        action: impl TaskAction + 'static,
    ) -> Self {
        Self {
            id: task_id_for(display_name),
            display_name: display_name.to_string(),
            description: description.to_string(),
            category,
            requires_elevation: false,
            action: Arc::new(action),
        }
    }

    /// Mark the task as needing an elevated process.
    pub fn elevated(mut self) -> Self {
        self.requires_elevation = true;
        self
    }

    pub fn action(&self) -> &dyn TaskAction {
        self.action.as_ref()
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id.clone(),
            name: self.display_name.clone(),
            description: self.description.clone(),
            category: self.category,
            admin_required: self.requires_elevation,
        }
    }
}

/// `"Physical Memory"` -> `"physical_memory"`.
pub fn task_id_for(display_name: &str) -> String {
    display_name.trim().to_lowercase().replace(' ', "_")
}

/// Catalog entry as shown to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: TaskCategory,
    pub admin_required: bool,
}

pub struct TaskCatalog {
    tasks: Vec<Arc<TaskDescriptor>>,
    index: HashMap<String, usize>,
}

impl TaskCatalog {
    /// Build a catalog. Fails if two descriptors share an id.
    pub fn new(descriptors: Vec<TaskDescriptor>) -> DiagResult<Self> {
        let mut index = HashMap::with_capacity(descriptors.len());
        let mut duplicates = Vec::new();
        for (i, descriptor) in descriptors.iter().enumerate() {
            if index.insert(descriptor.id.clone(), i).is_some() && !duplicates.contains(&descriptor.id) {
                duplicates.push(descriptor.id.clone());
            }
        }
        if !duplicates.is_empty() {
            return Err(DiagError::DuplicateTaskIds(duplicates));
        }

        Ok(Self {
            tasks: descriptors.into_iter().map(Arc::new).collect(),
            index,
        })
    }

    /// The catalog for the current platform. Its ids are unique by construction.
    pub fn builtin() -> Self {
        let tasks: Vec<_> = builtin::descriptors().into_iter().map(Arc::new).collect();
        let index = tasks
            .iter()
            .enumerate()
            .map(|(i, d)| (d.id.clone(), i))
            .collect();
        Self { tasks, index }
    }

    pub fn list(&self) -> &[Arc<TaskDescriptor>] {
        &self.tasks
    }

    pub fn infos(&self) -> Vec<TaskInfo> {
        self.tasks.iter().map(|t| t.info()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<TaskDescriptor>> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Descriptors for `ids`, in the given order.
    ///
    /// Fails with `UnknownTaskIds` naming every id not in the catalog.
    pub fn resolve(&self, ids: &[String]) -> DiagResult<Vec<Arc<TaskDescriptor>>> {
        let mut unknown = Vec::new();
        let mut resolved = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get(id) {
                Some(descriptor) => resolved.push(descriptor.clone()),
                None if !unknown.contains(id) => unknown.push(id.clone()),
                None => {}
            }
        }
        if !unknown.is_empty() {
            return Err(DiagError::UnknownTaskIds(unknown));
        }
        Ok(resolved)
    }

    /// Ids of the tasks runnable at the given privilege level, in catalog order.
    pub fn available(&self, elevated: bool) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| elevated || !t.requires_elevation)
            .map(|t| t.id.clone())
            .collect()
    }
}

/// Ids that appear more than once in `ids`, in first-repeat order.
pub(crate) fn duplicate_ids(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut duplicates = Vec::new();
    for id in ids {
        if !seen.insert(id.as_str()) && !duplicates.contains(id) {
            duplicates.push(id.clone());
        }
    }
    duplicates
}
