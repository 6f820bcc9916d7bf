//! Fluent construction of pipelines for tests.

use crate::connection::Connection;
use crate::id_scope::{EntityKind, IdScope};
use crate::ids::{ConnectionId, ModuleId};
use crate::module::{Annotation, Module, ModuleFunction, ModuleParam};
use crate::pipeline::{INPUT_PORT_MODULE, OUTPUT_PORT_MODULE, Pipeline};
use crate::registry::basic;
use crate::value::Value;
use anyhow::Result;
use std::collections::BTreeMap;

/// Registry type a literal is bound as when no port declaration is at hand.
#[must_use]
pub fn literal_type(value: &Value) -> &'static str {
    match value {
        Value::Boolean(_) => basic::BOOLEAN,
        Value::Integer(_) => basic::INTEGER,
        Value::Float(_) => basic::FLOAT,
        Value::String(_) => basic::STRING,
        Value::File(_) => basic::FILE,
        Value::List(_) => basic::LIST,
        Value::Table(_) => basic::TABLE,
        Value::Tuple(_) | Value::Object(_) => basic::VARIANT,
    }
}

/// Builds a [`Pipeline`] directly, drawing every id from its own scope.
///
/// Structural checks (dangling connections) happen in [`build`](Self::build);
/// port typing is not checked, so tests can construct ill-typed pipelines on
/// purpose.
///
/// # Example
///
/// ```
/// use vistrail::testing::PipelineBuilder;
/// use vistrail::value::Value;
///
/// let mut b = PipelineBuilder::new();
/// let a = b.module("basic", "Float");
/// b.function(a, "value", Value::Float(1.5));
/// b.annotate(a, "annotate_output", true);
/// let p = b.build().unwrap();
/// assert!(p.module(a).unwrap().annotation("annotate_output").is_some());
/// ```
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    id_scope: IdScope,
    modules: BTreeMap<ModuleId, Module>,
    connections: Vec<Connection>,
}

impl PipelineBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start ids at `begin_id` for every kind, e.g. to build a pipeline whose
    /// ids cannot collide with another one.
    #[must_use]
    pub fn with_begin_id(begin_id: u64) -> Self {
        Self {
            id_scope: IdScope::with_begin_id(begin_id),
            ..Self::default()
        }
    }

    pub fn module(&mut self, package: &str, name: &str) -> ModuleId {
        let id = self.id_scope.get_new_id(EntityKind::Module);
        self.insert(Module::new(id, package, name))
    }

    /// Add a group wrapping `inner`.
    pub fn group(&mut self, inner: Pipeline) -> ModuleId {
        let id = self.id_scope.get_new_id(EntityKind::Module);
        self.insert(Module::group(id, inner))
    }

    /// Add a sub-workflow reference wrapping `inner`.
    pub fn abstraction(&mut self, name: &str, inner: Pipeline) -> ModuleId {
        let id = self.id_scope.get_new_id(EntityKind::Module);
        self.insert(Module::abstraction(id, name, inner))
    }

    /// Add an `InputPort` exposing `name` on an enclosing group.
    pub fn input_port(&mut self, name: &str) -> ModuleId {
        let id = self.module(basic::PACKAGE, INPUT_PORT_MODULE);
        self.function(id, "name", Value::from(name));
        id
    }

    /// Add an `OutputPort` exposing `name` on an enclosing group.
    pub fn output_port(&mut self, name: &str) -> ModuleId {
        let id = self.module(basic::PACKAGE, OUTPUT_PORT_MODULE);
        self.function(id, "name", Value::from(name));
        id
    }

    /// Bind `value` to input `port` of `module`. Tuples become one parameter
    /// per component. Unknown modules are ignored.
    pub fn function(&mut self, module: ModuleId, port: &str, value: Value) -> &mut Self {
        let fid = self.id_scope.get_new_id(EntityKind::Function);
        let components = match value {
            Value::Tuple(items) => items,
            other => vec![other],
        };
        let mut params = Vec::with_capacity(components.len());
        for (pos, v) in components.into_iter().enumerate() {
            let pid = self.id_scope.get_new_id(EntityKind::Parameter);
            params.push(ModuleParam::new(pid, u32::try_from(pos).unwrap_or(u32::MAX), literal_type(&v), v));
        }
        if let Some(m) = self.modules.get_mut(&module) {
            let pos = u32::try_from(m.functions.len()).unwrap_or(u32::MAX);
            let mut f = ModuleFunction::new(fid, pos, port);
            for p in params {
                f.add_parameter(p);
            }
            m.add_function(f);
        }
        self
    }

    pub fn annotate(&mut self, module: ModuleId, key: &str, value: impl Into<Value>) -> &mut Self {
        let aid = self.id_scope.get_new_id(EntityKind::Annotation);
        if let Some(m) = self.modules.get_mut(&module) {
            m.add_annotation(Annotation::new(aid, key, value));
        }
        self
    }

    /// Turn caching off for `module`.
    pub fn uncached(&mut self, module: ModuleId) -> &mut Self {
        if let Some(m) = self.modules.get_mut(&module) {
            m.cache = false;
        }
        self
    }

    pub fn connect(&mut self, source: ModuleId, source_port: &str, dest: ModuleId, dest_port: &str) -> ConnectionId {
        let id = self.id_scope.get_new_id(EntityKind::Connection);
        let c = Connection::new(id, source, source_port, dest, dest_port);
        let cid = c.id;
        self.connections.push(c);
        cid
    }

    /// Assemble the pipeline.
    ///
    /// # Errors
    ///
    /// Returns a structural error if a connection names a module that was
    /// never added.
    pub fn build(self) -> Result<Pipeline> {
        let mut pipeline = Pipeline::new();
        for m in self.modules.into_values() {
            pipeline.add_module(m)?;
        }
        for c in self.connections {
            pipeline.add_connection(c)?;
        }
        Ok(pipeline)
    }

    fn insert(&mut self, module: Module) -> ModuleId {
        let id = module.id;
        self.modules.insert(id, module);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_drawn_per_kind() {
        let mut b = PipelineBuilder::with_begin_id(5);
        let a = b.module("basic", "Integer");
        let c = b.module("basic", "Integer");
        assert_eq!(a, ModuleId::new(5));
        assert_eq!(c, ModuleId::new(6));
        let conn = b.connect(a, "value", c, "value");
        assert_eq!(conn, ConnectionId::new(5));
    }

    #[test]
    fn tuple_functions_split_into_params() {
        let mut b = PipelineBuilder::new();
        let m = b.module("test", "Pair");
        b.function(m, "pair", Value::Tuple(vec![Value::Integer(1), Value::from("x")]));
        let p = b.build().unwrap();
        let f = p.module(m).unwrap().function("pair").unwrap();
        assert_eq!(f.params.len(), 2);
        assert_eq!(f.params[0].type_name, basic::INTEGER);
        assert_eq!(f.params[1].type_name, basic::STRING);
    }

    #[test]
    fn dangling_connection_fails_build() {
        let mut b = PipelineBuilder::new();
        let a = b.module("basic", "Integer");
        b.connect(a, "value", ModuleId::new(99), "value");
        assert!(b.build().is_err());
    }
}
