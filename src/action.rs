//! Actions: atomic, replayable steps of pipeline history.
//!
//! An [`Operation`] adds, deletes or changes one [`DataObject`] (a module,
//! connection, function, annotation or port spec). An [`Action`] is an ordered
//! list of operations applied all-or-nothing to one pipeline version to produce
//! the next.
//!
//! Actions are built with one of the constructors below:
//!
//! - [`create_action`] from explicit [`ActionItem`]s,
//! - [`create_action_from_ops`] from ready-made operations,
//! - [`create_paste_action`] to paste a copy of a pipeline with fresh ids,
//! - [`create_diff_action`] from the difference between two pipeline states.
//!
//! [`Action::inverse`] builds the action that undoes another one.

use crate::connection::Connection;
use crate::errors::WorkflowError;
use crate::id_scope::{EntityKind, IdScope};
use crate::ids::{AnnotationId, ConnectionId, FunctionId, ModuleId, OperationId, PortSpecId, VersionId};
use crate::module::{Annotation, IdRemap, Module, ModuleFunction};
use crate::pipeline::Pipeline;
use crate::port::PortSpec;
use anyhow::{Result, bail};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter, Result as FormatResult};
use std::time::{SystemTime, UNIX_EPOCH};

/// Layout offset applied to pasted modules.
pub const PASTE_OFFSET: f64 = 10.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Add,
    Delete,
    Change,
}

impl Display for OpKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        match self {
            Self::Add => write!(f, "add"),
            Self::Delete => write!(f, "delete"),
            Self::Change => write!(f, "change"),
        }
    }
}

/// An object an operation acts on. Objects owned by a module carry its id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "what", content = "data", rename_all = "snake_case")]
pub enum DataObject {
    Module(Module),
    Connection(Connection),
    Function { module_id: ModuleId, function: ModuleFunction },
    Annotation { module_id: ModuleId, annotation: Annotation },
    PortSpec { module_id: ModuleId, spec: PortSpec },
}

/// Address of a [`DataObject`] inside a pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "what", rename_all = "snake_case")]
pub enum ObjectRef {
    Module { id: ModuleId },
    Connection { id: ConnectionId },
    Function { module_id: ModuleId, id: FunctionId },
    Annotation { module_id: ModuleId, id: AnnotationId },
    PortSpec { module_id: ModuleId, id: PortSpecId },
}

impl Display for ObjectRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        match self {
            Self::Module { id } => write!(f, "module {id}"),
            Self::Connection { id } => write!(f, "connection {id}"),
            Self::Function { module_id, id } => write!(f, "function {id} of module {module_id}"),
            Self::Annotation { module_id, id } => write!(f, "annotation {id} of module {module_id}"),
            Self::PortSpec { module_id, id } => write!(f, "port spec {id} of module {module_id}"),
        }
    }
}

impl DataObject {
    #[must_use]
    pub fn object_ref(&self) -> ObjectRef {
        match self {
            Self::Module(m) => ObjectRef::Module { id: m.id },
            Self::Connection(c) => ObjectRef::Connection { id: c.id },
            Self::Function { module_id, function } => ObjectRef::Function {
                module_id: *module_id,
                id: function.id,
            },
            Self::Annotation { module_id, annotation } => ObjectRef::Annotation {
                module_id: *module_id,
                id: annotation.id,
            },
            Self::PortSpec { module_id, spec } => ObjectRef::PortSpec {
                module_id: *module_id,
                id: spec.id,
            },
        }
    }

    /// Short type name, used in messages.
    #[must_use]
    pub fn vt_type(&self) -> &'static str {
        match self {
            Self::Module(_) => "module",
            Self::Connection(_) => "connection",
            Self::Function { .. } => "function",
            Self::Annotation { .. } => "annotation",
            Self::PortSpec { .. } => "port_spec",
        }
    }

    fn add_to(self, pipeline: &mut Pipeline) -> Result<()> {
        match self {
            Self::Module(m) => pipeline.add_module(m),
            Self::Connection(c) => pipeline.add_connection(c),
            Self::Function { module_id, function } => pipeline.add_function(module_id, function),
            Self::Annotation { module_id, annotation } => pipeline.add_annotation(module_id, annotation),
            Self::PortSpec { module_id, spec } => pipeline.add_port_spec(module_id, spec),
        }
    }
}

impl ObjectRef {
    #[must_use]
    pub fn vt_type(&self) -> &'static str {
        match self {
            Self::Module { .. } => "module",
            Self::Connection { .. } => "connection",
            Self::Function { .. } => "function",
            Self::Annotation { .. } => "annotation",
            Self::PortSpec { .. } => "port_spec",
        }
    }

    fn delete_from(self, pipeline: &mut Pipeline) -> Result<DataObject> {
        Ok(match self {
            Self::Module { id } => DataObject::Module(pipeline.delete_module(id)?),
            Self::Connection { id } => DataObject::Connection(pipeline.delete_connection(id)?),
            Self::Function { module_id, id } => DataObject::Function {
                module_id,
                function: pipeline.delete_function(module_id, id)?,
            },
            Self::Annotation { module_id, id } => DataObject::Annotation {
                module_id,
                annotation: pipeline.delete_annotation(module_id, id)?,
            },
            Self::PortSpec { module_id, id } => DataObject::PortSpec {
                module_id,
                spec: pipeline.delete_port_spec(module_id, id)?,
            },
        })
    }

    /// Replace the referenced object with `new`, returning the old one.
    fn change_in(self, new: DataObject, pipeline: &mut Pipeline) -> Result<DataObject> {
        Ok(match (self, new) {
            (Self::Module { id }, DataObject::Module(m)) => DataObject::Module(pipeline.change_module(id, m)?),
            (Self::Connection { id }, DataObject::Connection(c)) => {
                DataObject::Connection(pipeline.change_connection(id, c)?)
            }
            (Self::Function { module_id, id }, DataObject::Function { module_id: m2, function }) if m2 == module_id => {
                DataObject::Function {
                    module_id,
                    function: pipeline.change_function(module_id, id, function)?,
                }
            }
            (Self::Annotation { module_id, id }, DataObject::Annotation { module_id: m2, annotation })
                if m2 == module_id =>
            {
                DataObject::Annotation {
                    module_id,
                    annotation: pipeline.change_annotation(module_id, id, annotation)?,
                }
            }
            (Self::PortSpec { module_id, id }, DataObject::PortSpec { module_id: m2, spec }) if m2 == module_id => {
                DataObject::PortSpec {
                    module_id,
                    spec: pipeline.change_port_spec(module_id, id, spec)?,
                }
            }
            (old, new) => bail!(WorkflowError::structure(format!(
                "cannot change {old} into a {} of {:?}",
                new.vt_type(),
                new.object_ref()
            ))),
        })
    }
}

/// One primitive edit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    Add { id: OperationId, object: DataObject },
    Delete { id: OperationId, target: ObjectRef },
    Change { id: OperationId, old: ObjectRef, new: DataObject },
}

impl Operation {
    #[must_use]
    pub fn id(&self) -> OperationId {
        match self {
            Self::Add { id, .. } | Self::Delete { id, .. } | Self::Change { id, .. } => *id,
        }
    }

    fn set_id(&mut self, new_id: OperationId) {
        match self {
            Self::Add { id, .. } | Self::Delete { id, .. } | Self::Change { id, .. } => *id = new_id,
        }
    }

    #[must_use]
    pub fn kind(&self) -> OpKind {
        match self {
            Self::Add { .. } => OpKind::Add,
            Self::Delete { .. } => OpKind::Delete,
            Self::Change { .. } => OpKind::Change,
        }
    }

    /// The object this operation leaves behind (`None` for deletes).
    #[must_use]
    pub fn object(&self) -> Option<&DataObject> {
        match self {
            Self::Add { object, .. } => Some(object),
            Self::Change { new, .. } => Some(new),
            Self::Delete { .. } => None,
        }
    }

    /// The object this operation reads or removes.
    #[must_use]
    pub fn target(&self) -> ObjectRef {
        match self {
            Self::Add { object, .. } => object.object_ref(),
            Self::Delete { target, .. } => *target,
            Self::Change { old, .. } => *old,
        }
    }

    /// Apply to `pipeline`, returning what was removed or replaced.
    fn apply_to(&self, pipeline: &mut Pipeline) -> Result<Option<DataObject>> {
        match self {
            Self::Add { object, .. } => {
                object.clone().add_to(pipeline)?;
                Ok(None)
            }
            Self::Delete { target, .. } => target.delete_from(pipeline).map(Some),
            Self::Change { old, new, .. } => old.change_in(new.clone(), pipeline).map(Some),
        }
    }
}

/// One `(kind, object)` entry handed to [`create_action`]. Changes also name
/// the object they replace.
#[derive(Clone, Debug, PartialEq)]
pub struct ActionItem {
    pub kind: OpKind,
    pub object: DataObject,
    pub replaced: Option<DataObject>,
}

impl ActionItem {
    #[must_use]
    pub fn add(object: DataObject) -> Self {
        Self {
            kind: OpKind::Add,
            object,
            replaced: None,
        }
    }

    #[must_use]
    pub fn delete(object: DataObject) -> Self {
        Self {
            kind: OpKind::Delete,
            object,
            replaced: None,
        }
    }

    #[must_use]
    pub fn change(old: DataObject, new: DataObject) -> Self {
        Self {
            kind: OpKind::Change,
            object: new,
            replaced: Some(old),
        }
    }
}

/// An ordered set of operations forming one history step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Version id this action produces; assigned when added to a vistrail.
    pub id: VersionId,
    /// Version the action applies to.
    pub prev_id: VersionId,
    pub operations: Vec<Operation>,
    /// Creation time, milliseconds since the Unix epoch.
    pub date: u64,
    #[serde(default)]
    pub user: Option<String>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

impl Action {
    /// Apply every operation to `pipeline`, or none of them.
    ///
    /// # Errors
    ///
    /// Returns the first failing operation's error, annotated with its index;
    /// `pipeline` is left untouched in that case.
    pub fn apply(&self, pipeline: &mut Pipeline) -> Result<()> {
        let mut working = pipeline.clone();
        for (i, op) in self.operations.iter().enumerate() {
            op.apply_to(&mut working).map_err(|e| {
                e.context(format!(
                    "operation {i} ({} {}) of action {}",
                    op.kind(),
                    op.target(),
                    self.id
                ))
            })?;
        }
        *pipeline = working;
        Ok(())
    }

    /// The action that undoes this one, given the pipeline it applies to.
    ///
    /// Applying `self` and then the inverse to `before` yields `before` again.
    ///
    /// # Errors
    ///
    /// Returns an error if `self` does not apply to `before`.
    pub fn inverse(&self, before: &Pipeline) -> Result<Self> {
        let mut state = before.clone();
        let mut undo = Vec::with_capacity(self.operations.len());
        for op in &self.operations {
            let removed = op.apply_to(&mut state)?;
            let inv = match (op, removed) {
                (Operation::Add { id, object }, _) => Operation::Delete {
                    id: *id,
                    target: object.object_ref(),
                },
                (Operation::Delete { id, .. }, Some(old)) => Operation::Add { id: *id, object: old },
                (Operation::Change { id, new, .. }, Some(old)) => Operation::Change {
                    id: *id,
                    old: new.object_ref(),
                    new: old,
                },
                (op, None) => bail!(WorkflowError::structure(format!(
                    "{} of {} removed nothing",
                    op.kind(),
                    op.target()
                ))),
            };
            undo.push(inv);
        }
        undo.reverse();
        Ok(Self {
            id: VersionId::ROOT,
            prev_id: self.id,
            operations: undo,
            date: now_millis(),
            user: self.user.clone(),
        })
    }

    /// Renumber operation ids from `id_scope`.
    pub fn renumber_operations(&mut self, id_scope: &mut IdScope) {
        for op in &mut self.operations {
            op.set_id(OperationId::new(id_scope.get_new_id(EntityKind::Operation)));
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Build an action from ready-made operations.
#[must_use]
pub fn create_action_from_ops(ops: Vec<Operation>) -> Action {
    Action {
        id: VersionId::ROOT,
        prev_id: VersionId::ROOT,
        operations: ops,
        date: now_millis(),
        user: None,
    }
}

/// Build an action from explicit `(kind, object)` items.
///
/// # Errors
///
/// Returns a structural error for a malformed item: a change that does not
/// name the object it replaces, an add or delete that does, or a change
/// between objects of different types or owners.
pub fn create_action(action_list: Vec<ActionItem>) -> Result<Action> {
    let mut ops = Vec::with_capacity(action_list.len());
    for (i, item) in action_list.into_iter().enumerate() {
        let id = OperationId::new(i as u64);
        let op = match (item.kind, item.replaced) {
            (OpKind::Add, None) => Operation::Add { id, object: item.object },
            (OpKind::Delete, None) => Operation::Delete {
                id,
                target: item.object.object_ref(),
            },
            (OpKind::Change, Some(old)) => {
                let (old_ref, new_ref) = (old.object_ref(), item.object.object_ref());
                if std::mem::discriminant(&old_ref) != std::mem::discriminant(&new_ref)
                    || owner(&old_ref) != owner(&new_ref)
                {
                    bail!(WorkflowError::structure(format!(
                        "item {i}: cannot change {old_ref} into {new_ref}"
                    )));
                }
                Operation::Change {
                    id,
                    old: old_ref,
                    new: item.object,
                }
            }
            (OpKind::Change, None) => bail!(WorkflowError::structure(format!(
                "item {i}: change of {} does not name the replaced object",
                item.object.object_ref()
            ))),
            (kind, Some(_)) => bail!(WorkflowError::structure(format!(
                "item {i}: {kind} takes a single object"
            ))),
        };
        ops.push(op);
    }
    Ok(create_action_from_ops(ops))
}

fn owner(r: &ObjectRef) -> Option<ModuleId> {
    match r {
        ObjectRef::Function { module_id, .. }
        | ObjectRef::Annotation { module_id, .. }
        | ObjectRef::PortSpec { module_id, .. } => Some(*module_id),
        ObjectRef::Module { .. } | ObjectRef::Connection { .. } => None,
    }
}

/// Build an add-only action that pastes a copy of `pipeline`.
///
/// Every module and connection is copied with fresh ids from `id_scope`; the
/// old → new pairs are recorded in `id_remap` and connection endpoints are
/// rewritten through it. Pasted modules are shifted by [`PASTE_OFFSET`] in
/// both directions. `pipeline` is not modified.
#[must_use]
pub fn create_paste_action(pipeline: &Pipeline, id_scope: &mut IdScope, id_remap: &mut IdRemap) -> Action {
    let mut ops = Vec::with_capacity(pipeline.module_count() + pipeline.connection_count());
    for module in pipeline.modules() {
        let mut cp = module.do_copy(true, id_scope, id_remap);
        if let Some(loc) = &mut cp.location {
            loc.x += PASTE_OFFSET;
            loc.y += PASTE_OFFSET;
        }
        ops.push(DataObject::Module(cp));
    }
    for connection in pipeline.connections() {
        ops.push(DataObject::Connection(connection.do_copy(true, id_scope, id_remap)));
    }
    debug!("paste action: {} objects", ops.len());
    let ops = ops
        .into_iter()
        .map(|object| Operation::Add {
            id: OperationId::new(id_scope.get_new_id(EntityKind::Operation)),
            object,
        })
        .collect();
    create_action_from_ops(ops)
}

/// Build the action that turns `from` into `to`, matching objects by id.
///
/// Operations are ordered so the action applies cleanly: connections are
/// deleted first, then module-level objects change, modules are deleted and
/// added, and new connections come last.
#[must_use]
pub fn create_diff_action(from: &Pipeline, to: &Pipeline) -> Action {
    let mut out: Vec<Operation> = Vec::new();
    let mut next = 0u64;
    let mut id = || {
        next += 1;
        OperationId::new(next - 1)
    };

    for c in from.connections() {
        match to.connection(c.id) {
            Some(t) if t == c => {}
            _ => out.push(Operation::Delete {
                id: id(),
                target: ObjectRef::Connection { id: c.id },
            }),
        }
    }

    for m in from.modules() {
        let Some(t) = to.module(m.id) else { continue };
        if !same_module_shell(m, t) {
            out.push(Operation::Change {
                id: id(),
                old: ObjectRef::Module { id: m.id },
                new: DataObject::Module(t.clone()),
            });
            continue;
        }
        diff_children(
            &m.functions,
            &t.functions,
            |f| f.id,
            |fid| ObjectRef::Function { module_id: m.id, id: fid },
            |f| DataObject::Function {
                module_id: m.id,
                function: f.clone(),
            },
            &mut out,
            &mut id,
        );
        diff_children(
            &m.annotations,
            &t.annotations,
            |a| a.id,
            |aid| ObjectRef::Annotation { module_id: m.id, id: aid },
            |a| DataObject::Annotation {
                module_id: m.id,
                annotation: a.clone(),
            },
            &mut out,
            &mut id,
        );
        diff_children(
            &m.port_specs,
            &t.port_specs,
            |p| p.id,
            |pid| ObjectRef::PortSpec { module_id: m.id, id: pid },
            |p| DataObject::PortSpec {
                module_id: m.id,
                spec: p.clone(),
            },
            &mut out,
            &mut id,
        );
    }

    for m in from.modules() {
        if to.module(m.id).is_none() {
            out.push(Operation::Delete {
                id: id(),
                target: ObjectRef::Module { id: m.id },
            });
        }
    }
    for m in to.modules() {
        if from.module(m.id).is_none() {
            out.push(Operation::Add {
                id: id(),
                object: DataObject::Module(m.clone()),
            });
        }
    }
    for c in to.connections() {
        match from.connection(c.id) {
            Some(f) if f == c => {}
            _ => out.push(Operation::Add {
                id: id(),
                object: DataObject::Connection(c.clone()),
            }),
        }
    }
    create_action_from_ops(out)
}

/// Modules equal apart from their functions, annotations and port specs.
fn same_module_shell(a: &Module, b: &Module) -> bool {
    a.package == b.package && a.name == b.name && a.cache == b.cache && a.location == b.location && a.kind == b.kind
}

fn diff_children<T: PartialEq, K: Ord + Copy>(
    from: &[T],
    to: &[T],
    key: impl Fn(&T) -> K,
    make_ref: impl Fn(K) -> ObjectRef,
    make_obj: impl Fn(&T) -> DataObject,
    out: &mut Vec<Operation>,
    id: &mut impl FnMut() -> OperationId,
) {
    let to_keys: BTreeSet<K> = to.iter().map(&key).collect();
    for f in from {
        if !to_keys.contains(&key(f)) {
            out.push(Operation::Delete {
                id: id(),
                target: make_ref(key(f)),
            });
        }
    }
    for t in to {
        match from.iter().find(|f| key(*f) == key(t)) {
            Some(f) if f == t => {}
            Some(f) => out.push(Operation::Change {
                id: id(),
                old: make_ref(key(f)),
                new: make_obj(t),
            }),
            None => out.push(Operation::Add {
                id: id(),
                object: make_obj(t),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::basic;

    fn module(id: u64) -> Module {
        Module::new(id, basic::PACKAGE, "Float").at(0.0, 0.0)
    }

    #[test]
    fn change_without_replaced_object_is_malformed() {
        let item = ActionItem {
            kind: OpKind::Change,
            object: DataObject::Module(module(1)),
            replaced: None,
        };
        let err = create_action(vec![item]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::Structure(_))
        ));
    }

    #[test]
    fn change_across_types_is_malformed() {
        let conn = Connection::new(0, ModuleId::new(0), "value", ModuleId::new(1), "value");
        let item = ActionItem::change(DataObject::Module(module(1)), DataObject::Connection(conn));
        assert!(create_action(vec![item]).is_err());
    }

    #[test]
    fn failed_apply_leaves_pipeline_untouched() {
        let action = create_action(vec![
            ActionItem::add(DataObject::Module(module(0))),
            ActionItem::delete(DataObject::Module(module(7))),
        ])
        .unwrap();
        let mut p = Pipeline::new();
        assert!(action.apply(&mut p).is_err());
        assert!(p.is_empty());
    }

    #[test]
    fn inverse_restores_previous_state() {
        let mut before = Pipeline::new();
        before.add_module(module(0)).unwrap();
        let action = create_action(vec![
            ActionItem::add(DataObject::Module(module(1))),
            ActionItem::add(DataObject::Connection(Connection::new(
                0,
                ModuleId::new(0),
                "value",
                ModuleId::new(1),
                "value",
            ))),
        ])
        .unwrap();
        let mut after = before.clone();
        action.apply(&mut after).unwrap();
        let undo = action.inverse(&before).unwrap();
        undo.apply(&mut after).unwrap();
        assert_eq!(after, before);
    }
}
