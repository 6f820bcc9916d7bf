//! The vistrail: a version tree of pipelines.
//!
//! Each node of the tree is an [`Action`] and its id is the version it
//! produces. Version [`VersionId::ROOT`] is the empty pipeline; any other
//! version is materialized by replaying the actions on the path from the root.
//! Tags are unique names for versions.
//!
//! Actions are immutable once added: edits always produce new versions.

use crate::action::{Action, create_diff_action};
use crate::errors::WorkflowError;
use crate::id_scope::{EntityKind, IdScope};
use crate::ids::VersionId;
use crate::pipeline::Pipeline;
use anyhow::{Context, Result, bail};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A version addressed by number or by tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VersionRef {
    Id(VersionId),
    Tag(String),
}

impl From<VersionId> for VersionRef {
    fn from(v: VersionId) -> Self {
        Self::Id(v)
    }
}

impl From<&str> for VersionRef {
    fn from(tag: &str) -> Self {
        Self::Tag(tag.to_string())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Vistrail {
    actions: BTreeMap<VersionId, Action>,
    tags: BTreeMap<String, VersionId>,
    /// Scope for action, operation and pipeline-object ids of this vistrail.
    id_scope: IdScope,
}

impl Default for Vistrail {
    fn default() -> Self {
        let mut id_scope = IdScope::new();
        id_scope.reserve(EntityKind::Action, VersionId::ROOT.raw());
        Self {
            actions: BTreeMap::new(),
            tags: BTreeMap::new(),
            id_scope,
        }
    }
}

impl Vistrail {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn has_version(&self, version: VersionId) -> bool {
        version == VersionId::ROOT || self.actions.contains_key(&version)
    }

    fn check_version(&self, version: VersionId) -> Result<()> {
        if !self.has_version(version) {
            bail!(WorkflowError::not_found(format!("version {version}")));
        }
        Ok(())
    }

    /// Attach `action` under `parent` and return the new version id.
    ///
    /// The action receives a fresh version id and fresh operation ids from
    /// this vistrail's scope. It must apply cleanly to the parent pipeline.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown parent, or the action's structural
    /// error if it does not apply.
    pub fn add_action(&mut self, mut action: Action, parent: VersionId) -> Result<VersionId> {
        let mut pipeline = self.get_pipeline(parent)?;
        action
            .apply(&mut pipeline)
            .with_context(|| format!("action does not apply to version {parent}"))?;
        pipeline.reserve_ids(&mut self.id_scope);
        let version = VersionId::new(self.id_scope.get_new_id(EntityKind::Action));
        action.id = version;
        action.prev_id = parent;
        action.renumber_operations(&mut self.id_scope);
        info!(
            "version {version} added under {parent} ({} operations)",
            action.operations.len()
        );
        self.actions.insert(version, action);
        Ok(version)
    }

    /// Name `version` with `tag`. A tag names one version only.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown version and a structural error if the
    /// tag already names a different version.
    pub fn add_tag(&mut self, version: VersionId, tag: &str) -> Result<()> {
        self.check_version(version)?;
        match self.tags.get(tag) {
            Some(v) if *v == version => Ok(()),
            Some(v) => bail!(WorkflowError::structure(format!(
                "tag '{tag}' already names version {v}"
            ))),
            None => {
                self.tags.insert(tag.to_string(), version);
                Ok(())
            }
        }
    }

    /// Drop a tag, returning the version it named.
    pub fn remove_tag(&mut self, tag: &str) -> Option<VersionId> {
        self.tags.remove(tag)
    }

    /// # Errors
    ///
    /// Returns `NotFound` for an unknown tag.
    pub fn get_version_number(&self, tag: &str) -> Result<VersionId> {
        self.tags
            .get(tag)
            .copied()
            .ok_or_else(|| WorkflowError::not_found(format!("tag '{tag}'")).into())
    }

    #[must_use]
    pub fn get_tag(&self, version: VersionId) -> Option<&str> {
        self.tags
            .iter()
            .find_map(|(t, v)| (*v == version).then_some(t.as_str()))
    }

    /// # Errors
    ///
    /// Returns `NotFound` for an unknown version or tag.
    pub fn resolve(&self, version: impl Into<VersionRef>) -> Result<VersionId> {
        match version.into() {
            VersionRef::Id(v) => {
                self.check_version(v)?;
                Ok(v)
            }
            VersionRef::Tag(t) => self.get_version_number(&t),
        }
    }

    /// Actions from the root down to `version`, in replay order.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown version.
    pub fn action_chain(&self, version: VersionId) -> Result<Vec<&Action>> {
        self.check_version(version)?;
        let mut chain = Vec::new();
        let mut cur = version;
        while cur != VersionId::ROOT {
            let action = self
                .actions
                .get(&cur)
                .ok_or_else(|| WorkflowError::not_found(format!("version {cur}")))?;
            chain.push(action);
            cur = action.prev_id;
        }
        chain.reverse();
        Ok(chain)
    }

    /// Materialize a version by replaying its actions from the root.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown versions or tags, and the failing
    /// action's error if the history does not replay.
    pub fn get_pipeline(&self, version: impl Into<VersionRef>) -> Result<Pipeline> {
        let version = self.resolve(version)?;
        let mut pipeline = Pipeline::new();
        for action in self.action_chain(version)? {
            action.apply(&mut pipeline)?;
        }
        Ok(pipeline)
    }

    #[must_use]
    pub fn action(&self, version: VersionId) -> Option<&Action> {
        self.actions.get(&version)
    }

    /// Parent of `version`; `None` for the root or unknown versions.
    #[must_use]
    pub fn parent(&self, version: VersionId) -> Option<VersionId> {
        self.actions.get(&version).map(|a| a.prev_id)
    }

    #[must_use]
    pub fn children(&self, version: VersionId) -> Vec<VersionId> {
        self.actions
            .values()
            .filter(|a| a.prev_id == version)
            .map(|a| a.id)
            .collect()
    }

    /// Every version but the root, in creation order.
    pub fn versions(&self) -> impl Iterator<Item = VersionId> + '_ {
        self.actions.keys().copied()
    }

    #[must_use]
    pub fn latest_version(&self) -> VersionId {
        self.actions.keys().next_back().copied().unwrap_or(VersionId::ROOT)
    }

    pub fn tags(&self) -> impl Iterator<Item = (&str, VersionId)> {
        self.tags.iter().map(|(t, v)| (t.as_str(), *v))
    }

    /// The action turning version `from` into version `to`.
    ///
    /// # Errors
    ///
    /// Returns an error if either version cannot be materialized.
    pub fn diff(&self, from: impl Into<VersionRef>, to: impl Into<VersionRef>) -> Result<Action> {
        let a = self.get_pipeline(from)?;
        let b = self.get_pipeline(to)?;
        Ok(create_diff_action(&a, &b))
    }

    #[must_use]
    pub fn id_scope(&self) -> &IdScope {
        &self.id_scope
    }

    /// Scope used to mint ids for new pipeline objects of this vistrail.
    pub fn id_scope_mut(&mut self) -> &mut IdScope {
        &mut self.id_scope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionItem, DataObject, create_action};
    use crate::module::Module;
    use crate::registry::basic;

    fn add_module(id: u64) -> Action {
        create_action(vec![ActionItem::add(DataObject::Module(Module::new(
            id,
            basic::PACKAGE,
            "String",
        )))])
        .unwrap()
    }

    #[test]
    fn versions_replay_from_root() {
        let mut vt = Vistrail::new();
        let v1 = vt.add_action(add_module(0), VersionId::ROOT).unwrap();
        let v2 = vt.add_action(add_module(1), v1).unwrap();
        let branch = vt.add_action(add_module(5), v1).unwrap();
        assert_eq!(vt.get_pipeline(v2).unwrap().module_count(), 2);
        assert_eq!(vt.get_pipeline(branch).unwrap().module_count(), 2);
        assert_eq!(vt.get_pipeline(VersionId::ROOT).unwrap().module_count(), 0);
        assert_eq!(vt.children(v1), vec![v2, branch]);
    }

    #[test]
    fn tags_are_unique() {
        let mut vt = Vistrail::new();
        let v1 = vt.add_action(add_module(0), VersionId::ROOT).unwrap();
        let v2 = vt.add_action(add_module(1), v1).unwrap();
        vt.add_tag(v1, "first").unwrap();
        assert!(vt.add_tag(v2, "first").is_err());
        assert_eq!(vt.get_pipeline("first").unwrap().module_count(), 1);
        assert_eq!(vt.get_tag(v1), Some("first"));
    }

    #[test]
    fn action_that_does_not_apply_is_rejected() {
        let mut vt = Vistrail::new();
        let v1 = vt.add_action(add_module(0), VersionId::ROOT).unwrap();
        assert!(vt.add_action(add_module(0), v1).is_err());
        assert_eq!(vt.latest_version(), v1);
    }
}
