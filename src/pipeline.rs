//! The pipeline: one buildable, executable workflow snapshot.
//!
//! A [`Pipeline`] owns its modules and connections in two id-indexed arenas.
//! Connections name their endpoints by [`ModuleId`]; they are resolved through
//! the pipeline, never through references held by modules.
//!
//! Structural edits are checked eagerly: a connection must join two modules
//! that exist, a module cannot be deleted while connections still touch it, and
//! ids are unique per arena. [`Pipeline::validate`] additionally checks ports
//! against the registry, and [`Pipeline::topological_order`] rejects cycles.
//!
//! ```
//! use vistrail::connection::Connection;
//! use vistrail::ids::ModuleId;
//! use vistrail::module::Module;
//! use vistrail::pipeline::Pipeline;
//! use vistrail::registry::{ModuleRegistry, basic};
//!
//! # fn main() -> anyhow::Result<()> {
//! let registry = ModuleRegistry::standard();
//! let mut p = Pipeline::new();
//! p.add_module(Module::new(0, basic::PACKAGE, "Integer"))?;
//! p.add_module(Module::new(1, basic::PACKAGE, "Float"))?;
//! p.add_connection(Connection::new(0, ModuleId::new(0), "value", ModuleId::new(1), "value"))?;
//! p.validate(&registry)?;
//! assert_eq!(p.topological_order()?, vec![ModuleId::new(0), ModuleId::new(1)]);
//! # Ok(())
//! # }
//! ```

use crate::connection::Connection;
use crate::errors::WorkflowError;
use crate::id_scope::{EntityKind, IdScope};
use crate::ids::{AnnotationId, ConnectionId, FunctionId, ModuleId, PortSpecId};
use crate::module::{Annotation, Module, ModuleFunction};
use crate::port::{PortKind, PortSpec, Signature, find_signature};
use crate::registry::{ModuleRegistry, SELF_PORT, basic};
use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Identifier of the module placed inside a group to expose one of its inputs.
pub const INPUT_PORT_MODULE: &str = "InputPort";
/// Identifier of the module placed inside a group to expose one of its outputs.
pub const OUTPUT_PORT_MODULE: &str = "OutputPort";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "PipelineDoc", into = "PipelineDoc")]
pub struct Pipeline {
    modules: BTreeMap<ModuleId, Module>,
    connections: BTreeMap<ConnectionId, Connection>,
}

/// Serialized shape of a pipeline: plain lists, ordered by id.
#[derive(Serialize, Deserialize)]
struct PipelineDoc {
    #[serde(default)]
    modules: Vec<Module>,
    #[serde(default)]
    connections: Vec<Connection>,
}

impl From<PipelineDoc> for Pipeline {
    fn from(doc: PipelineDoc) -> Self {
        Self {
            modules: doc.modules.into_iter().map(|m| (m.id, m)).collect(),
            connections: doc.connections.into_iter().map(|c| (c.id, c)).collect(),
        }
    }
}

impl From<Pipeline> for PipelineDoc {
    fn from(p: Pipeline) -> Self {
        Self {
            modules: p.modules.into_values().collect(),
            connections: p.connections.into_values().collect(),
        }
    }
}

fn missing_module(id: ModuleId) -> anyhow::Error {
    WorkflowError::not_found(format!("module {id}")).into()
}

impl Pipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.values()
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    #[must_use]
    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    #[must_use]
    pub fn module(&self, id: ModuleId) -> Option<&Module> {
        self.modules.get(&id)
    }

    /// # Errors
    ///
    /// Returns `NotFound` if no module has this id.
    pub fn get_module(&self, id: ModuleId) -> Result<&Module> {
        self.modules.get(&id).ok_or_else(|| missing_module(id))
    }

    fn get_module_mut(&mut self, id: ModuleId) -> Result<&mut Module> {
        self.modules.get_mut(&id).ok_or_else(|| missing_module(id))
    }

    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Connections whose destination is `module_id`.
    pub fn incoming(&self, module_id: ModuleId) -> impl Iterator<Item = &Connection> {
        self.connections
            .values()
            .filter(move |c| c.destination.module_id == module_id)
    }

    /// Connections whose source is `module_id`.
    pub fn outgoing(&self, module_id: ModuleId) -> impl Iterator<Item = &Connection> {
        self.connections
            .values()
            .filter(move |c| c.source.module_id == module_id)
    }

    /// Every module `module_id` transitively depends on, excluding itself.
    #[must_use]
    pub fn upstream(&self, module_id: ModuleId) -> BTreeSet<ModuleId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![module_id];
        while let Some(cur) = stack.pop() {
            for c in self.incoming(cur) {
                if seen.insert(c.source.module_id) {
                    stack.push(c.source.module_id);
                }
            }
        }
        seen.remove(&module_id);
        seen
    }

    // ---- modules ----

    /// # Errors
    ///
    /// Returns a structural error if the id is already used.
    pub fn add_module(&mut self, module: Module) -> Result<()> {
        if self.modules.contains_key(&module.id) {
            bail!(WorkflowError::structure(format!("duplicate module id {}", module.id)));
        }
        self.modules.insert(module.id, module);
        Ok(())
    }

    /// Remove a module. It must not be the endpoint of any connection.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids and a structural error if
    /// connections still reference the module.
    pub fn delete_module(&mut self, id: ModuleId) -> Result<Module> {
        if !self.modules.contains_key(&id) {
            return Err(missing_module(id));
        }
        if let Some(c) = self.connections.values().find(|c| c.touches(id)) {
            bail!(WorkflowError::structure(format!(
                "cannot delete module {id}: connection {} still references it",
                c.id
            )));
        }
        self.modules.remove(&id).ok_or_else(|| missing_module(id))
    }

    /// Replace module `old` with `module`. Connections follow only when the id
    /// is unchanged.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `old` is absent, or a structural error when the id
    /// changes while connections reference `old` or collides with another module.
    pub fn change_module(&mut self, old: ModuleId, module: Module) -> Result<Module> {
        if module.id != old {
            if self.modules.contains_key(&module.id) {
                bail!(WorkflowError::structure(format!("duplicate module id {}", module.id)));
            }
            let removed = self.delete_module(old)?;
            self.modules.insert(module.id, module);
            return Ok(removed);
        }
        let slot = self.get_module_mut(old)?;
        Ok(std::mem::replace(slot, module))
    }

    // ---- connections ----

    /// # Errors
    ///
    /// Returns a structural error for duplicate ids or endpoints that name
    /// modules absent from the pipeline.
    pub fn add_connection(&mut self, connection: Connection) -> Result<()> {
        if self.connections.contains_key(&connection.id) {
            bail!(WorkflowError::structure(format!("duplicate connection id {}", connection.id)));
        }
        for end in [&connection.source, &connection.destination] {
            if !self.modules.contains_key(&end.module_id) {
                bail!(WorkflowError::structure(format!(
                    "dangling endpoint: module {} of {connection} is not in the pipeline",
                    end.module_id
                )));
            }
        }
        self.connections.insert(connection.id, connection);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids.
    pub fn delete_connection(&mut self, id: ConnectionId) -> Result<Connection> {
        self.connections
            .remove(&id)
            .ok_or_else(|| WorkflowError::not_found(format!("connection {id}")).into())
    }

    /// # Errors
    ///
    /// Fails like [`delete_connection`](Self::delete_connection) followed by
    /// [`add_connection`](Self::add_connection); the pipeline is unchanged on failure.
    pub fn change_connection(&mut self, old: ConnectionId, connection: Connection) -> Result<Connection> {
        let removed = self.delete_connection(old)?;
        if let Err(e) = self.add_connection(connection) {
            self.connections.insert(removed.id, removed);
            return Err(e);
        }
        Ok(removed)
    }

    // ---- functions ----

    /// # Errors
    ///
    /// Returns `NotFound` for an unknown module and a structural error for a
    /// function id already present on the module.
    pub fn add_function(&mut self, module_id: ModuleId, function: ModuleFunction) -> Result<()> {
        let module = self.get_module_mut(module_id)?;
        if module.functions.iter().any(|f| f.id == function.id) {
            bail!(WorkflowError::structure(format!(
                "duplicate function id {} on module {module_id}",
                function.id
            )));
        }
        module.functions.push(function);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `NotFound` if the module or the function is absent.
    pub fn delete_function(&mut self, module_id: ModuleId, id: FunctionId) -> Result<ModuleFunction> {
        let module = self.get_module_mut(module_id)?;
        let pos = module
            .functions
            .iter()
            .position(|f| f.id == id)
            .ok_or_else(|| WorkflowError::not_found(format!("function {id} on module {module_id}")))?;
        Ok(module.functions.remove(pos))
    }

    /// Replace function `old` in place.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the module or the function is absent.
    pub fn change_function(
        &mut self,
        module_id: ModuleId,
        old: FunctionId,
        function: ModuleFunction,
    ) -> Result<ModuleFunction> {
        let module = self.get_module_mut(module_id)?;
        let slot = module
            .functions
            .iter_mut()
            .find(|f| f.id == old)
            .ok_or_else(|| WorkflowError::not_found(format!("function {old} on module {module_id}")))?;
        Ok(std::mem::replace(slot, function))
    }

    // ---- annotations ----

    /// # Errors
    ///
    /// Returns `NotFound` for an unknown module and a structural error for a
    /// duplicate annotation id or key.
    pub fn add_annotation(&mut self, module_id: ModuleId, annotation: Annotation) -> Result<()> {
        let module = self.get_module_mut(module_id)?;
        if module
            .annotations
            .iter()
            .any(|a| a.id == annotation.id || a.key == annotation.key)
        {
            bail!(WorkflowError::structure(format!(
                "annotation '{}' (id {}) already present on module {module_id}",
                annotation.key, annotation.id
            )));
        }
        module.annotations.push(annotation);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `NotFound` if the module or the annotation is absent.
    pub fn delete_annotation(&mut self, module_id: ModuleId, id: AnnotationId) -> Result<Annotation> {
        let module = self.get_module_mut(module_id)?;
        let pos = module
            .annotations
            .iter()
            .position(|a| a.id == id)
            .ok_or_else(|| WorkflowError::not_found(format!("annotation {id} on module {module_id}")))?;
        Ok(module.annotations.remove(pos))
    }

    /// # Errors
    ///
    /// Returns `NotFound` if the module or the annotation is absent.
    pub fn change_annotation(
        &mut self,
        module_id: ModuleId,
        old: AnnotationId,
        annotation: Annotation,
    ) -> Result<Annotation> {
        let module = self.get_module_mut(module_id)?;
        let slot = module
            .annotations
            .iter_mut()
            .find(|a| a.id == old)
            .ok_or_else(|| WorkflowError::not_found(format!("annotation {old} on module {module_id}")))?;
        Ok(std::mem::replace(slot, annotation))
    }

    // ---- port specs ----

    /// # Errors
    ///
    /// Returns `NotFound` for an unknown module and a structural error if a
    /// spec with this id or the same name and direction exists.
    pub fn add_port_spec(&mut self, module_id: ModuleId, spec: PortSpec) -> Result<()> {
        let module = self.get_module_mut(module_id)?;
        if module
            .port_specs
            .iter()
            .any(|p| p.id == spec.id || (p.name == spec.name && p.kind == spec.kind))
        {
            bail!(WorkflowError::structure(format!(
                "port spec '{}' already declared on module {module_id}",
                spec.name
            )));
        }
        module.port_specs.push(spec);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `NotFound` if the module or the port spec is absent.
    pub fn delete_port_spec(&mut self, module_id: ModuleId, id: PortSpecId) -> Result<PortSpec> {
        let module = self.get_module_mut(module_id)?;
        let pos = module
            .port_specs
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| WorkflowError::not_found(format!("port spec {id} on module {module_id}")))?;
        Ok(module.port_specs.remove(pos))
    }

    /// # Errors
    ///
    /// Returns `NotFound` if the module or the port spec is absent.
    pub fn change_port_spec(&mut self, module_id: ModuleId, old: PortSpecId, spec: PortSpec) -> Result<PortSpec> {
        let module = self.get_module_mut(module_id)?;
        let slot = module
            .port_specs
            .iter_mut()
            .find(|p| p.id == old)
            .ok_or_else(|| WorkflowError::not_found(format!("port spec {old} on module {module_id}")))?;
        Ok(std::mem::replace(slot, spec))
    }

    // ---- typing ----

    /// Resolve a port of `module`. Groups and abstractions expose the ports
    /// named by the `InputPort`/`OutputPort` modules of their inner pipeline.
    #[must_use]
    pub fn port_spec_of(module: &Module, port: &str, kind: PortKind, registry: &ModuleRegistry) -> Option<PortSpec> {
        let Some(inner) = module.inner_pipeline() else {
            return registry.port_spec(module, port, kind);
        };
        if let Some(spec) = module.port_specs.iter().find(|p| p.name == port && p.kind == kind) {
            return Some(spec.clone());
        }
        let marker = match kind {
            PortKind::Input => INPUT_PORT_MODULE,
            PortKind::Output => OUTPUT_PORT_MODULE,
        };
        if kind == PortKind::Output && port == SELF_PORT {
            return Some(PortSpec::output(SELF_PORT, basic::MODULE));
        }
        inner
            .modules()
            .filter(|m| m.package == basic::PACKAGE && m.name == marker)
            .find(|m| exposed_port_name(m).as_deref() == Some(port))
            .map(|_| PortSpec::new(port, kind, Signature::single(basic::VARIANT)))
    }

    /// Check that `connection` joins an output port to an input port whose
    /// signatures match, returning the destination signature it binds to.
    ///
    /// # Errors
    ///
    /// Returns a structural error for missing modules or ports, or when no
    /// destination overload accepts the source signature.
    pub fn check_connection(&self, connection: &Connection, registry: &ModuleRegistry) -> Result<Signature> {
        let src = self.get_module(connection.source.module_id)?;
        let dst = self.get_module(connection.destination.module_id)?;
        let Some(src_spec) = Self::port_spec_of(src, &connection.source.port, PortKind::Output, registry) else {
            bail!(WorkflowError::structure(format!(
                "module {} ({}) has no output port '{}'",
                src.id,
                src.identifier(),
                connection.source.port
            )));
        };
        let Some(dst_spec) = Self::port_spec_of(dst, &connection.destination.port, PortKind::Input, registry)
        else {
            bail!(WorkflowError::structure(format!(
                "module {} ({}) has no input port '{}'",
                dst.id,
                dst.identifier(),
                connection.destination.port
            )));
        };
        let source_sig = connection.source.signature.clone().unwrap_or(src_spec.signature);
        let dest_sigs = [dst_spec.signature];
        match find_signature(&source_sig, &dest_sigs, registry) {
            Some(sig) => Ok(sig.clone()),
            None => bail!(WorkflowError::structure(format!(
                "cannot connect {}.{} {source_sig} to {}.{} {}",
                src.identifier(),
                connection.source.port,
                dst.identifier(),
                connection.destination.port,
                dest_sigs[0]
            ))),
        }
    }

    /// Check every connection against the registry, recursing into groups.
    ///
    /// # Errors
    ///
    /// Returns the first structural error found.
    pub fn validate(&self, registry: &ModuleRegistry) -> Result<()> {
        for c in self.connections.values() {
            self.check_connection(c, registry)?;
        }
        for m in self.modules.values() {
            if let Some(inner) = m.inner_pipeline() {
                inner.validate(registry)?;
            }
        }
        Ok(())
    }

    /// Modules ordered so every connection goes from an earlier module to a
    /// later one. Ties are broken by module id.
    ///
    /// # Errors
    ///
    /// Returns a structural error naming the modules caught in a cycle.
    pub fn topological_order(&self) -> Result<Vec<ModuleId>> {
        let mut in_degree: HashMap<ModuleId, usize> = self.modules.keys().map(|id| (*id, 0)).collect();
        for c in self.connections.values() {
            if let Some(d) = in_degree.get_mut(&c.destination.module_id) {
                *d += 1;
            }
        }
        let mut ready: BTreeSet<ModuleId> = in_degree
            .iter()
            .filter_map(|(id, d)| (*d == 0).then_some(*id))
            .collect();
        let mut order = Vec::with_capacity(self.modules.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for c in self.outgoing(id) {
                if let Some(d) = in_degree.get_mut(&c.destination.module_id) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(c.destination.module_id);
                    }
                }
            }
        }
        if order.len() != self.modules.len() {
            let done: HashSet<ModuleId> = order.iter().copied().collect();
            let stuck: Vec<String> = self
                .modules
                .keys()
                .filter(|id| !done.contains(id))
                .map(ToString::to_string)
                .collect();
            bail!(WorkflowError::structure(format!(
                "pipeline contains a cycle through modules {}",
                stuck.join(", ")
            )));
        }
        Ok(order)
    }

    /// Raise `scope` above every id used in this pipeline, so ids it mints
    /// afterwards cannot collide with existing objects.
    pub fn reserve_ids(&self, scope: &mut IdScope) {
        for m in self.modules.values() {
            scope.reserve(EntityKind::Module, m.id.raw());
            if let Some(loc) = &m.location {
                scope.reserve(EntityKind::Location, loc.id.raw());
            }
            for f in &m.functions {
                scope.reserve(EntityKind::Function, f.id.raw());
                for p in &f.params {
                    scope.reserve(EntityKind::Parameter, p.id.raw());
                }
            }
            for a in &m.annotations {
                scope.reserve(EntityKind::Annotation, a.id.raw());
            }
            for s in &m.port_specs {
                scope.reserve(EntityKind::PortSpec, s.id.raw());
            }
        }
        for c in self.connections.values() {
            scope.reserve(EntityKind::Connection, c.id.raw());
        }
    }

    /// Structural equality ignoring ids.
    ///
    /// Modules are paired greedily in id order with an unpaired module of
    /// the other pipeline that is `equals_no_id`; connections must then match
    /// through that pairing.
    #[must_use]
    pub fn equals_no_id(&self, other: &Self) -> bool {
        if self.modules.len() != other.modules.len() || self.connections.len() != other.connections.len() {
            return false;
        }
        let mut pairing: HashMap<ModuleId, ModuleId> = HashMap::new();
        let mut taken: HashSet<ModuleId> = HashSet::new();
        for m in self.modules.values() {
            let Some(o) = other
                .modules
                .values()
                .find(|o| !taken.contains(&o.id) && m.equals_no_id(o))
            else {
                return false;
            };
            taken.insert(o.id);
            pairing.insert(m.id, o.id);
        }
        let mut used: HashSet<ConnectionId> = HashSet::new();
        for c in self.connections.values() {
            let (Some(src), Some(dst)) = (
                pairing.get(&c.source.module_id),
                pairing.get(&c.destination.module_id),
            ) else {
                return false;
            };
            let found = other.connections.values().find(|o| {
                !used.contains(&o.id)
                    && o.source.module_id == *src
                    && o.destination.module_id == *dst
                    && o.source.equals_no_id(&c.source)
                    && o.destination.equals_no_id(&c.destination)
            });
            match found {
                Some(o) => {
                    used.insert(o.id);
                }
                None => return false,
            }
        }
        true
    }
}

/// Port name exposed by an `InputPort`/`OutputPort` module: its `name` function.
#[must_use]
pub fn exposed_port_name(module: &Module) -> Option<String> {
    module
        .function("name")
        .and_then(ModuleFunction::value)
        .and_then(|v| v.as_str().map(str::to_string))
}
