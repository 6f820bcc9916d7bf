//! The module registry: type hierarchy, declared ports and compute units.
//!
//! The registry is the service every other layer consults for typing. It
//! answers three questions:
//!
//! - what a type identifier names ([`get_descriptor`](ModuleRegistry::get_descriptor),
//!   [`get_descriptor_by_name`](ModuleRegistry::get_descriptor_by_name)),
//! - whether one type may stand in for another
//!   ([`is_subtype`](ModuleRegistry::is_subtype),
//!   [`are_specs_matched`](ModuleRegistry::are_specs_matched)),
//! - how to run a module of that type ([`ModuleDescriptor::compute`]).
//!
//! [`ModuleRegistry::default`] contains the basic type hierarchy:
//!
//! ```text
//! Variant
//! └── Module
//!     ├── Constant
//!     │   ├── Boolean
//!     │   ├── String
//!     │   ├── Float
//!     │   │   └── Integer
//!     │   ├── List
//!     │   └── File
//!     └── tabledata:Table
//! ```
//!
//! [`ModuleRegistry::standard`] additionally registers the built-in module
//! library (see [`crate::library`]).

use crate::compute::Compute;
use crate::errors::WorkflowError;
use crate::module::Module;
use crate::port::{PortKind, PortSpec, Signature};
use crate::value::{ObjectValue, Value};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter, Result as FormatResult};
use std::sync::Arc;

/// Identifiers of the built-in types.
pub mod basic {
    pub const PACKAGE: &str = "basic";
    pub const VARIANT: &str = "basic:Variant";
    pub const MODULE: &str = "basic:Module";
    pub const CONSTANT: &str = "basic:Constant";
    pub const BOOLEAN: &str = "basic:Boolean";
    pub const STRING: &str = "basic:String";
    pub const FLOAT: &str = "basic:Float";
    pub const INTEGER: &str = "basic:Integer";
    pub const LIST: &str = "basic:List";
    pub const FILE: &str = "basic:File";
    pub const TABLE: &str = "tabledata:Table";
}

/// Output port every module type inherits; it stands for the module itself
/// and is only ever connected to lazy inputs.
pub const SELF_PORT: &str = "self";

/// Join a package and a module name into a type identifier.
#[must_use]
pub fn identifier(package: &str, name: &str) -> String {
    format!("{package}:{name}")
}

/// Everything the registry knows about one module type.
#[derive(Clone)]
pub struct ModuleDescriptor {
    pub package: String,
    pub name: String,
    /// Identifier of the parent type; `None` only for `Variant`.
    pub base: Option<String>,
    pub input_ports: Vec<PortSpec>,
    pub output_ports: Vec<PortSpec>,
    pub cacheable: bool,
    /// Abstract types can be used in signatures but not instantiated.
    pub is_abstract: bool,
    compute: Option<Arc<dyn Compute>>,
}

impl Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        f.debug_struct("ModuleDescriptor")
            .field("identifier", &self.identifier())
            .field("base", &self.base)
            .field("inputs", &self.input_ports.len())
            .field("outputs", &self.output_ports.len())
            .field("cacheable", &self.cacheable)
            .finish_non_exhaustive()
    }
}

impl ModuleDescriptor {
    /// Start describing `package:name`, deriving from `basic:Module`.
    #[must_use]
    pub fn new(package: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            name: name.into(),
            base: Some(basic::MODULE.to_string()),
            input_ports: Vec::new(),
            output_ports: Vec::new(),
            cacheable: true,
            is_abstract: false,
            compute: None,
        }
    }

    #[must_use]
    pub fn base(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    #[must_use]
    pub fn input(mut self, spec: PortSpec) -> Self {
        self.input_ports.push(PortSpec { kind: PortKind::Input, ..spec });
        self
    }

    #[must_use]
    pub fn output(mut self, spec: PortSpec) -> Self {
        self.output_ports.push(PortSpec { kind: PortKind::Output, ..spec });
        self
    }

    #[must_use]
    pub fn not_cacheable(mut self) -> Self {
        self.cacheable = false;
        self
    }

    #[must_use]
    pub fn abstract_type(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    #[must_use]
    pub fn compute(mut self, compute: impl Compute + 'static) -> Self {
        self.compute = Some(Arc::new(compute));
        self
    }

    #[must_use]
    pub fn identifier(&self) -> String {
        identifier(&self.package, &self.name)
    }

    /// The descriptor's own single-component signature, e.g. `"(basic:Float)"`.
    #[must_use]
    pub fn sigstring(&self) -> String {
        format!("({})", self.identifier())
    }

    #[must_use]
    pub fn compute_unit(&self) -> Option<Arc<dyn Compute>> {
        self.compute.clone()
    }
}

#[derive(Clone, Debug)]
pub struct ModuleRegistry {
    descriptors: BTreeMap<String, Arc<ModuleDescriptor>>,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        let mut reg = Self {
            descriptors: BTreeMap::new(),
        };
        let root = ModuleDescriptor {
            base: None,
            ..ModuleDescriptor::new(basic::PACKAGE, "Variant").abstract_type()
        };
        reg.insert(root);
        reg.insert(
            ModuleDescriptor::new(basic::PACKAGE, "Module")
                .base(basic::VARIANT)
                .output(PortSpec::output(SELF_PORT, basic::MODULE))
                .abstract_type(),
        );
        reg.insert(ModuleDescriptor::new(basic::PACKAGE, "Constant").abstract_type());
        for (name, base) in [
            ("Boolean", basic::CONSTANT),
            ("String", basic::CONSTANT),
            ("Float", basic::CONSTANT),
            ("Integer", basic::FLOAT),
            ("List", basic::CONSTANT),
            ("File", basic::CONSTANT),
        ] {
            reg.insert(ModuleDescriptor::new(basic::PACKAGE, name).base(base).abstract_type());
        }
        reg.insert(ModuleDescriptor::new("tabledata", "Table").abstract_type());
        reg
    }
}

impl ModuleRegistry {
    /// The basic hierarchy plus the built-in module library.
    #[must_use]
    pub fn standard() -> Self {
        let mut reg = Self::default();
        crate::library::register_all(&mut reg);
        reg
    }

    /// Register a descriptor whose base is known to be present.
    pub(crate) fn insert(&mut self, descriptor: ModuleDescriptor) {
        self.descriptors
            .insert(descriptor.identifier(), Arc::new(descriptor));
    }

    /// Register (or replace) a module type.
    ///
    /// # Errors
    ///
    /// Returns a structural error if the declared base type is unknown.
    pub fn add_module(&mut self, descriptor: ModuleDescriptor) -> Result<()> {
        if let Some(base) = &descriptor.base {
            if !self.descriptors.contains_key(base) {
                return Err(WorkflowError::structure(format!(
                    "base type '{base}' of '{}' is not registered",
                    descriptor.identifier()
                ))
                .into());
            }
        }
        self.insert(descriptor);
        Ok(())
    }

    /// Look a descriptor up by identifier or single-component sigstring.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown types.
    pub fn get_descriptor(&self, type_name: &str) -> Result<Arc<ModuleDescriptor>> {
        let key = type_name.trim().trim_start_matches('(').trim_end_matches(')');
        self.descriptors
            .get(key)
            .cloned()
            .ok_or_else(|| WorkflowError::not_found(format!("module type '{type_name}'")).into())
    }

    /// # Errors
    ///
    /// Returns `NotFound` for unknown types.
    pub fn get_descriptor_by_name(&self, package: &str, name: &str) -> Result<Arc<ModuleDescriptor>> {
        self.get_descriptor(&identifier(package, name))
    }

    #[must_use]
    pub fn has_descriptor(&self, type_name: &str) -> bool {
        self.get_descriptor(type_name).is_ok()
    }

    /// Iterate `type_name` and all of its ancestors, nearest first.
    fn ancestry(&self, type_name: &str) -> Vec<Arc<ModuleDescriptor>> {
        let mut out = Vec::new();
        let mut cur = self.get_descriptor(type_name).ok();
        while let Some(d) = cur {
            // a malformed registry could loop; cap at the registry size
            if out.len() > self.descriptors.len() {
                break;
            }
            cur = d.base.as_deref().and_then(|b| self.get_descriptor(b).ok());
            out.push(d);
        }
        out
    }

    /// True when `sub` is `sup` or derives from it. Everything derives from `Variant`.
    #[must_use]
    pub fn is_subtype(&self, sub: &str, sup: &str) -> bool {
        if sup == basic::VARIANT || sub == sup {
            return true;
        }
        self.ancestry(sub).iter().any(|d| d.identifier() == sup)
    }

    /// True when `candidate` may be bound where `declared` is expected:
    /// same arity and every component a subtype of the declared one.
    #[must_use]
    pub fn are_specs_matched(&self, candidate: &Signature, declared: &Signature) -> bool {
        candidate.arity() == declared.arity()
            && candidate
                .components()
                .iter()
                .zip(declared.components())
                .all(|(c, d)| self.is_subtype(c, d))
    }

    /// Ports declared on `type_name` and its ancestors, nearest first.
    fn registry_port(&self, type_name: &str, port: &str, kind: PortKind) -> Option<PortSpec> {
        self.ancestry(type_name).iter().find_map(|d| {
            let ports = match kind {
                PortKind::Input => &d.input_ports,
                PortKind::Output => &d.output_ports,
            };
            ports.iter().find(|p| p.name == port).cloned()
        })
    }

    /// Resolve a port of a module instance: instance-declared specs first,
    /// then the registry declaration of its type.
    #[must_use]
    pub fn port_spec(&self, module: &Module, port: &str, kind: PortKind) -> Option<PortSpec> {
        module
            .port_specs
            .iter()
            .find(|p| p.name == port && p.kind == kind)
            .cloned()
            .or_else(|| self.registry_port(&module.identifier(), port, kind))
    }

    /// All input port specs visible on a module instance.
    #[must_use]
    pub fn input_ports(&self, module: &Module) -> Vec<PortSpec> {
        let mut out: Vec<PortSpec> = module
            .port_specs
            .iter()
            .filter(|p| p.kind == PortKind::Input)
            .cloned()
            .collect();
        for d in self.ancestry(&module.identifier()) {
            for p in &d.input_ports {
                if !out.iter().any(|o| o.name == p.name) {
                    out.push(p.clone());
                }
            }
        }
        out
    }

    /// Rebuild a value that crossed the worker boundary serialized, using the
    /// descriptor named by `sigstring`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown descriptors or a persistence error if
    /// `text` is not valid state.
    pub fn deserialize_value(&self, sigstring: &str, text: &str) -> Result<Value> {
        let descriptor = self.get_descriptor(sigstring)?;
        let state = serde_json::from_str(text)
            .with_context(|| format!("decoding serialized '{}' value", descriptor.identifier()))
            .map_err(|e| WorkflowError::Persistence(format!("{e:#}")))?;
        if descriptor.identifier() == basic::TABLE {
            let table = serde_json::from_value(state)
                .map_err(|e| WorkflowError::Persistence(e.to_string()))?;
            return Ok(Value::Table(table));
        }
        Ok(Value::Object(ObjectValue {
            descriptor: descriptor.identifier(),
            state,
        }))
    }

    /// Serialize a module-typed value for transport, returning the text and
    /// the sigstring tag needed to rebuild it. Plain values return `None`.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the state cannot be encoded.
    pub fn serialize_value(&self, value: &Value) -> Result<Option<(String, String)>> {
        let (descriptor, state) = match value {
            Value::Object(obj) => (obj.descriptor.clone(), obj.state.clone()),
            Value::Table(t) => (
                basic::TABLE.to_string(),
                serde_json::to_value(t).map_err(|e| WorkflowError::Persistence(e.to_string()))?,
            ),
            _ => return Ok(None),
        };
        let sig = self.get_descriptor(&descriptor)?.sigstring();
        let text = serde_json::to_string(&state).map_err(|e| WorkflowError::Persistence(e.to_string()))?;
        Ok(Some((text, sig)))
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &Arc<ModuleDescriptor>> {
        self.descriptors.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_hierarchy() {
        let reg = ModuleRegistry::default();
        assert!(reg.is_subtype(basic::INTEGER, basic::FLOAT));
        assert!(reg.is_subtype(basic::INTEGER, basic::CONSTANT));
        assert!(reg.is_subtype(basic::STRING, basic::VARIANT));
        assert!(!reg.is_subtype(basic::FLOAT, basic::INTEGER));
        assert!(!reg.is_subtype(basic::STRING, basic::INTEGER));
    }

    #[test]
    fn lookup_by_sigstring_and_name() {
        let reg = ModuleRegistry::default();
        let d = reg.get_descriptor("(basic:Float)").unwrap();
        assert_eq!(d.sigstring(), "(basic:Float)");
        assert!(reg.get_descriptor_by_name("basic", "Integer").is_ok());
        assert!(reg.get_descriptor_by_name("basic", "Nope").is_err());
    }

    #[test]
    fn unknown_base_is_rejected() {
        let mut reg = ModuleRegistry::default();
        let err = reg
            .add_module(ModuleDescriptor::new("x", "Y").base("x:Missing"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::Structure(_))
        ));
    }
}
