//! Modules and the objects that hang off them.
//!
//! A [`Module`] is a node of a [`Pipeline`](crate::pipeline::Pipeline): a typed
//! unit of computation with design-time parameter bindings
//! ([`ModuleFunction`]s), metadata ([`Annotation`]s), optional instance port
//! specs and a layout [`Location`]. [`ModuleKind`] distinguishes plain modules
//! from groups and sub-workflow abstractions, which wrap a nested pipeline.
//!
//! Every object here supports `do_copy(new_ids, id_scope, id_remap)`, the
//! structural clone used by paste and by the map engine, and `equals_no_id`,
//! which compares structure while ignoring ids.

use crate::id_scope::{EntityKind, IdScope};
use crate::ids::{AnnotationId, FunctionId, LocationId, ModuleId, ParamId};
use crate::pipeline::Pipeline;
use crate::port::PortSpec;
use crate::registry::{basic, identifier};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Old → new id mapping recorded while copying with fresh ids.
pub type IdRemap = HashMap<(EntityKind, u64), u64>;

/// Look up the new id recorded for `(kind, old)`, falling back to `old`.
#[must_use]
pub fn remapped(id_remap: &IdRemap, kind: EntityKind, old: u64) -> u64 {
    id_remap.get(&(kind, old)).copied().unwrap_or(old)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: LocationId,
    pub x: f64,
    pub y: f64,
}

impl Location {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            id: LocationId::new(0),
            x,
            y,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: AnnotationId,
    pub key: String,
    pub value: Value,
}

impl Annotation {
    #[must_use]
    pub fn new(id: u64, key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            id: AnnotationId::new(id),
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn do_copy(&self, new_ids: bool, id_scope: &mut IdScope, id_remap: &mut IdRemap) -> Self {
        let mut cp = self.clone();
        if new_ids {
            let id = id_scope.get_new_id(EntityKind::Annotation);
            id_remap.insert((EntityKind::Annotation, self.id.raw()), id);
            cp.id = AnnotationId::new(id);
        }
        cp
    }

    #[must_use]
    pub fn equals_no_id(&self, other: &Self) -> bool {
        self.key == other.key && self.value == other.value
    }
}

/// One positional literal of a function.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModuleParam {
    pub id: ParamId,
    pub pos: u32,
    /// Declared type identifier of the literal.
    #[serde(rename = "type")]
    pub type_name: String,
    pub value: Value,
}

impl ModuleParam {
    #[must_use]
    pub fn new(id: u64, pos: u32, type_name: impl Into<String>, value: Value) -> Self {
        Self {
            id: ParamId::new(id),
            pos,
            type_name: type_name.into(),
            value,
        }
    }

    #[must_use]
    pub fn equals_no_id(&self, other: &Self) -> bool {
        self.pos == other.pos && self.type_name == other.type_name && self.value == other.value
    }
}

/// A design-time binding of literal values to one input port.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModuleFunction {
    pub id: FunctionId,
    pub pos: u32,
    /// The input port this function binds.
    pub name: String,
    pub params: Vec<ModuleParam>,
}

impl ModuleFunction {
    #[must_use]
    pub fn new(id: u64, pos: u32, name: impl Into<String>) -> Self {
        Self {
            id: FunctionId::new(id),
            pos,
            name: name.into(),
            params: Vec::new(),
        }
    }

    pub fn add_parameter(&mut self, param: ModuleParam) {
        self.params.push(param);
        self.params.sort_by_key(|p| p.pos);
    }

    /// The value this function delivers: the single parameter, or a tuple.
    #[must_use]
    pub fn value(&self) -> Option<Value> {
        match self.params.as_slice() {
            [] => None,
            [one] => Some(one.value.clone()),
            many => Some(Value::Tuple(many.iter().map(|p| p.value.clone()).collect())),
        }
    }

    pub fn do_copy(&self, new_ids: bool, id_scope: &mut IdScope, id_remap: &mut IdRemap) -> Self {
        let mut cp = self.clone();
        if new_ids {
            let id = id_scope.get_new_id(EntityKind::Function);
            id_remap.insert((EntityKind::Function, self.id.raw()), id);
            cp.id = FunctionId::new(id);
            for p in &mut cp.params {
                let pid = id_scope.get_new_id(EntityKind::Parameter);
                id_remap.insert((EntityKind::Parameter, p.id.raw()), pid);
                p.id = ParamId::new(pid);
            }
        }
        cp
    }

    #[must_use]
    pub fn equals_no_id(&self, other: &Self) -> bool {
        self.pos == other.pos
            && self.name == other.name
            && self.params.len() == other.params.len()
            && self
                .params
                .iter()
                .zip(&other.params)
                .all(|(a, b)| a.equals_no_id(b))
    }
}

/// What a module node stands for.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "pipeline", rename_all = "snake_case")]
pub enum ModuleKind {
    /// A registered module type, computed by its descriptor.
    Module,
    /// A self-contained nested pipeline.
    Group(Box<Pipeline>),
    /// A reference to a sub-workflow; must become a group before transport.
    Abstraction(Box<Pipeline>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub id: ModuleId,
    pub package: String,
    pub name: String,
    pub location: Option<Location>,
    #[serde(default = "default_cache")]
    pub cache: bool,
    #[serde(default)]
    pub functions: Vec<ModuleFunction>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    #[serde(default)]
    pub port_specs: Vec<PortSpec>,
    pub kind: ModuleKind,
}

const fn default_cache() -> bool {
    true
}

impl Module {
    #[must_use]
    pub fn new(id: u64, package: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: ModuleId::new(id),
            package: package.into(),
            name: name.into(),
            location: None,
            cache: true,
            functions: Vec::new(),
            annotations: Vec::new(),
            port_specs: Vec::new(),
            kind: ModuleKind::Module,
        }
    }

    /// A group node wrapping `pipeline`.
    #[must_use]
    pub fn group(id: u64, pipeline: Pipeline) -> Self {
        Self {
            kind: ModuleKind::Group(Box::new(pipeline)),
            ..Self::new(id, basic::PACKAGE, "Group")
        }
    }

    /// A sub-workflow reference named `name` wrapping `pipeline`.
    #[must_use]
    pub fn abstraction(id: u64, name: impl Into<String>, pipeline: Pipeline) -> Self {
        Self {
            kind: ModuleKind::Abstraction(Box::new(pipeline)),
            ..Self::new(id, "abstraction", name)
        }
    }

    #[must_use]
    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.location = Some(Location::new(x, y));
        self
    }

    #[must_use]
    pub fn identifier(&self) -> String {
        identifier(&self.package, &self.name)
    }

    #[must_use]
    pub fn is_group(&self) -> bool {
        matches!(self.kind, ModuleKind::Group(_))
    }

    #[must_use]
    pub fn is_abstraction(&self) -> bool {
        matches!(self.kind, ModuleKind::Abstraction(_))
    }

    /// The nested pipeline of a group or abstraction.
    #[must_use]
    pub fn inner_pipeline(&self) -> Option<&Pipeline> {
        match &self.kind {
            ModuleKind::Group(p) | ModuleKind::Abstraction(p) => Some(p),
            ModuleKind::Module => None,
        }
    }

    /// Log record type name: `"module"`, `"group"` or `"abstraction"`.
    #[must_use]
    pub fn vt_type(&self) -> &'static str {
        match self.kind {
            ModuleKind::Module => "module",
            ModuleKind::Group(_) => "group",
            ModuleKind::Abstraction(_) => "abstraction",
        }
    }

    pub fn add_function(&mut self, function: ModuleFunction) {
        self.functions.push(function);
    }

    pub fn add_annotation(&mut self, annotation: Annotation) {
        self.annotations.push(annotation);
    }

    pub fn add_port_spec(&mut self, spec: PortSpec) {
        self.port_specs.push(spec);
    }

    #[must_use]
    pub fn function(&self, name: &str) -> Option<&ModuleFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    #[must_use]
    pub fn annotation(&self, key: &str) -> Option<&Annotation> {
        self.annotations.iter().find(|a| a.key == key)
    }

    /// Highest function id on this module, if it has any functions.
    #[must_use]
    pub fn max_function_id(&self) -> Option<u64> {
        self.functions.iter().map(|f| f.id.raw()).max()
    }

    #[must_use]
    pub fn max_annotation_id(&self) -> Option<u64> {
        self.annotations.iter().map(|a| a.id.raw()).max()
    }

    /// Structural clone. With `new_ids`, the module and everything it owns get
    /// fresh ids from `id_scope`, and every old → new pair lands in `id_remap`.
    /// The ids inside a group's nested pipeline are scoped to the group and
    /// are kept as they are.
    pub fn do_copy(&self, new_ids: bool, id_scope: &mut IdScope, id_remap: &mut IdRemap) -> Self {
        let mut cp = self.clone();
        if new_ids {
            let id = id_scope.get_new_id(EntityKind::Module);
            id_remap.insert((EntityKind::Module, self.id.raw()), id);
            cp.id = ModuleId::new(id);
            if let Some(loc) = &mut cp.location {
                let lid = id_scope.get_new_id(EntityKind::Location);
                id_remap.insert((EntityKind::Location, loc.id.raw()), lid);
                loc.id = LocationId::new(lid);
            }
        }
        cp.functions = self
            .functions
            .iter()
            .map(|f| f.do_copy(new_ids, id_scope, id_remap))
            .collect();
        cp.annotations = self
            .annotations
            .iter()
            .map(|a| a.do_copy(new_ids, id_scope, id_remap))
            .collect();
        cp.port_specs = self
            .port_specs
            .iter()
            .map(|p| p.do_copy(new_ids, id_scope, id_remap))
            .collect();
        cp
    }

    #[must_use]
    pub fn equals_no_id(&self, other: &Self) -> bool {
        let locations_match = match (&self.location, &other.location) {
            (Some(a), Some(b)) => a.x == b.x && a.y == b.y,
            (None, None) => true,
            _ => false,
        };
        let kinds_match = match (&self.kind, &other.kind) {
            (ModuleKind::Module, ModuleKind::Module) => true,
            (ModuleKind::Group(a), ModuleKind::Group(b))
            | (ModuleKind::Abstraction(a), ModuleKind::Abstraction(b)) => a.equals_no_id(b),
            _ => false,
        };
        self.package == other.package
            && self.name == other.name
            && self.cache == other.cache
            && locations_match
            && kinds_match
            && all_pairs(&self.functions, &other.functions, ModuleFunction::equals_no_id)
            && all_pairs(&self.annotations, &other.annotations, Annotation::equals_no_id)
            && all_pairs(&self.port_specs, &other.port_specs, PortSpec::equals_no_id)
    }
}

fn all_pairs<T>(a: &[T], b: &[T], eq: impl Fn(&T, &T) -> bool) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| eq(x, y))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Module {
        let mut m = Module::new(4, basic::PACKAGE, "Float").at(1.0, 2.0);
        let mut f = ModuleFunction::new(7, 0, "value");
        f.add_parameter(ModuleParam::new(0, 0, basic::FLOAT, Value::Float(1.5)));
        m.add_function(f);
        m.add_annotation(Annotation::new(3, "note", "hello"));
        m
    }

    #[test]
    fn copy_with_new_ids_preserves_structure() {
        let m = sample();
        let mut scope = IdScope::with_begin_id(100);
        let mut remap = IdRemap::new();
        let cp = m.do_copy(true, &mut scope, &mut remap);
        assert_ne!(cp.id, m.id);
        assert_eq!(remap[&(EntityKind::Module, 4)], cp.id.raw());
        assert_eq!(remap[&(EntityKind::Function, 7)], cp.functions[0].id.raw());
        assert!(cp.equals_no_id(&m));
    }

    #[test]
    fn function_value_is_tuple_for_many_params() {
        let mut f = ModuleFunction::new(0, 0, "pair");
        f.add_parameter(ModuleParam::new(1, 1, basic::STRING, Value::from("b")));
        f.add_parameter(ModuleParam::new(0, 0, basic::STRING, Value::from("a")));
        assert_eq!(
            f.value(),
            Some(Value::Tuple(vec![Value::from("a"), Value::from("b")]))
        );
    }
}
