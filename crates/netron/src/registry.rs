//! Context registry: name → stub and id → stub tables of one node.

use crate::context::Context;
use crate::stub::Stub;
use netron_types::{DefinitionId, NetronError, NetronResult};
use netron_wire::NamedDefinition;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    names: HashMap<String, DefinitionId>,
    stubs: HashMap<DefinitionId, Arc<Stub>>,
}

impl Tables {
    /// Remove `root` and every weak stub descending from it.
    fn remove_tree(&mut self, root: DefinitionId) -> Vec<Arc<Stub>> {
        let mut doomed: HashSet<DefinitionId> = HashSet::from([root]);
        loop {
            let before = doomed.len();
            for stub in self.stubs.values() {
                if let Some(parent) = stub.definition().parent_id {
                    if doomed.contains(&parent) {
                        doomed.insert(stub.id());
                    }
                }
            }
            if doomed.len() == before {
                break;
            }
        }
        doomed
            .into_iter()
            .filter_map(|id| self.stubs.remove(&id))
            .collect()
    }
}

#[derive(Default)]
pub(crate) struct ContextRegistry {
    tables: RwLock<Tables>,
}

impl ContextRegistry {
    /// Register a stub under `name`.
    pub(crate) fn attach(&self, name: &str, stub: Arc<Stub>) -> NetronResult<()> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        if tables.names.contains_key(name) {
            return Err(NetronError::Exists(format!(
                "Context '{name}' already attached"
            )));
        }
        tables.names.insert(name.to_string(), stub.id());
        tables.stubs.insert(stub.id(), stub);
        Ok(())
    }

    /// Unregister `name`, dropping its stub and the weak stubs it produced.
    pub(crate) fn detach(&self, name: &str) -> NetronResult<Arc<Stub>> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let id = tables
            .names
            .remove(name)
            .ok_or_else(|| NetronError::Unknown(format!("Unknown context '{name}'")))?;
        let removed = tables.remove_tree(id);
        removed
            .into_iter()
            .find(|stub| stub.id() == id)
            .ok_or_else(|| NetronError::IllegalState(format!("Context '{name}' has no stub")))
    }

    /// Register a stub by id only.
    pub(crate) fn insert(&self, stub: Arc<Stub>) {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        tables.stubs.insert(stub.id(), stub);
    }

    /// Drop an id-only stub and its weak descendants.
    pub(crate) fn remove(&self, id: DefinitionId) -> usize {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        tables.remove_tree(id).len()
    }

    pub(crate) fn stub(&self, id: DefinitionId) -> Option<Arc<Stub>> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.stubs.get(&id).cloned()
    }

    pub(crate) fn stub_by_name(&self, name: &str) -> Option<Arc<Stub>> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let id = tables.names.get(name)?;
        tables.stubs.get(id).cloned()
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.names.contains_key(name)
    }

    pub(crate) fn names(&self) -> Vec<String> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = tables.names.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every named context, for a handshake ack.
    pub(crate) fn named_definitions(&self) -> Vec<NamedDefinition> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<NamedDefinition> = tables
            .names
            .iter()
            .filter_map(|(name, id)| {
                tables.stubs.get(id).map(|stub| NamedDefinition {
                    name: name.clone(),
                    definition: stub.definition().clone(),
                })
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// The weak stub `found` picks, or the one `mint` builds. Lookup and
    /// insertion happen under one lock.
    pub(crate) fn weak_or_insert(
        &self,
        found: impl Fn(&Stub) -> bool,
        mint: impl FnOnce() -> NetronResult<Stub>,
    ) -> NetronResult<Arc<Stub>> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        if let Some(stub) = tables.stubs.values().find(|s| s.is_weak() && found(s)) {
            return Ok(Arc::clone(stub));
        }
        let stub = Arc::new(mint()?);
        tables.stubs.insert(stub.id(), Arc::clone(&stub));
        Ok(stub)
    }

    /// Drop the weak stub `id` and its descendants, provided it was handed
    /// to `owner`.
    pub(crate) fn release_weak(&self, id: DefinitionId, owner: Option<Uuid>) -> Vec<Arc<Stub>> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let releasable = tables
            .stubs
            .get(&id)
            .is_some_and(|stub| stub.is_weak() && stub.owner() == owner);
        if !releasable {
            return Vec::new();
        }
        tables.remove_tree(id)
    }

    /// Drop every weak stub serving `instance`, whoever it was handed to.
    pub(crate) fn release_instance(&self, instance: &Arc<dyn Context>) -> Vec<Arc<Stub>> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let roots: Vec<DefinitionId> = tables
            .stubs
            .values()
            .filter(|stub| stub.is_weak() && stub.serves(instance))
            .map(|stub| stub.id())
            .collect();
        roots
            .into_iter()
            .flat_map(|id| tables.remove_tree(id))
            .collect()
    }

    /// Drop every weak stub handed to `owner`.
    pub(crate) fn release_owned_by(&self, owner: Uuid) -> Vec<Arc<Stub>> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let roots: Vec<DefinitionId> = tables
            .stubs
            .values()
            .filter(|stub| stub.is_weak() && stub.owner() == Some(owner))
            .map(|stub| stub.id())
            .collect();
        roots
            .into_iter()
            .flat_map(|id| tables.remove_tree(id))
            .collect()
    }

    /// Whether any stub still relays context `def_id` of peer `origin`.
    pub(crate) fn relays(&self, origin: Uuid, def_id: DefinitionId) -> bool {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables
            .stubs
            .values()
            .any(|stub| stub.relay_target() == Some((origin, def_id)))
    }

    /// Names of relayed contexts that live on peer `uid`.
    pub(crate) fn names_relayed_from(&self, uid: Uuid) -> Vec<String> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = tables
            .names
            .iter()
            .filter(|(_, id)| {
                tables
                    .stubs
                    .get(id)
                    .is_some_and(|stub| stub.remote_origin() == Some(uid))
            })
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub(crate) fn stub_count(&self) -> usize {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.stubs.len()
    }
}
