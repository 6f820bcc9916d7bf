//! Port specs, signatures and overload matching.
//!
//! A [`Signature`] is the ordered list of registry type identifiers accepted or
//! produced by a port, written as a sigstring such as
//! `"(basic:Integer,basic:Float)"`. A port may declare several signatures
//! (overloads); [`find_signature`] picks the one a connection binds to.

use crate::ids::PortSpecId;
use crate::id_scope::{EntityKind, IdScope};
use crate::module::IdRemap;
use crate::registry::{ModuleRegistry, basic};
use crate::value::Value;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FormatResult};

use crate::errors::WorkflowError;

/// Ordered registry type identifiers of a port.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(Vec<String>);

impl Signature {
    #[must_use]
    pub fn new(components: Vec<String>) -> Self {
        Self(components)
    }

    #[must_use]
    pub fn single(ty: impl Into<String>) -> Self {
        Self(vec![ty.into()])
    }

    /// Parse a sigstring: `"(a,b)"`, `"(a)"`, `"()"`, or a bare identifier.
    ///
    /// # Errors
    ///
    /// Returns a structural error if the parentheses are unbalanced.
    pub fn parse(sigstring: &str) -> Result<Self> {
        let s = sigstring.trim();
        let inner = match (s.starts_with('('), s.ends_with(')')) {
            (true, true) => &s[1..s.len() - 1],
            (false, false) => s,
            _ => {
                return Err(WorkflowError::structure(format!("malformed signature '{sigstring}'")).into());
            }
        };
        let components = inner
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Self(components))
    }

    #[must_use]
    pub fn components(&self) -> &[String] {
        &self.0
    }

    #[must_use]
    pub fn arity(&self) -> usize {
        self.0.len()
    }

    /// True for the single-component `Variant` signature.
    #[must_use]
    pub fn is_variant(&self) -> bool {
        self.0.len() == 1 && self.0[0] == basic::VARIANT
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        write!(f, "({})", self.0.join(","))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortKind {
    Input,
    Output,
}

impl Display for PortKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// A declared port: name, direction and accepted signature.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortSpec {
    pub id: PortSpecId,
    pub name: String,
    pub kind: PortKind,
    pub signature: Signature,
    #[serde(default)]
    pub optional: bool,
    /// Value used when nothing is bound to an optional input.
    #[serde(default)]
    pub default: Option<Value>,
    /// Connections into a lazy input are resolved to their source module
    /// instead of being evaluated.
    #[serde(default)]
    pub lazy: bool,
}

impl PortSpec {
    #[must_use]
    pub fn input(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self::new(name, PortKind::Input, Signature::single(ty))
    }

    #[must_use]
    pub fn output(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self::new(name, PortKind::Output, Signature::single(ty))
    }

    #[must_use]
    pub fn new(name: impl Into<String>, kind: PortKind, signature: Signature) -> Self {
        Self {
            id: PortSpecId::new(0),
            name: name.into(),
            kind,
            signature,
            optional: false,
            default: None,
            lazy: false,
        }
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    #[must_use]
    pub fn with_default(mut self, value: Value) -> Self {
        self.optional = true;
        self.default = Some(value);
        self
    }

    #[must_use]
    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    #[must_use]
    pub fn sigstring(&self) -> String {
        self.signature.to_string()
    }

    /// Clone this spec, optionally with a fresh id from `id_scope`.
    pub fn do_copy(&self, new_ids: bool, id_scope: &mut IdScope, id_remap: &mut IdRemap) -> Self {
        let mut cp = self.clone();
        if new_ids {
            let id = id_scope.get_new_id(EntityKind::PortSpec);
            id_remap.insert((EntityKind::PortSpec, self.id.raw()), id);
            cp.id = PortSpecId::new(id);
        }
        cp
    }

    #[must_use]
    pub fn equals_no_id(&self, other: &Self) -> bool {
        self.name == other.name
            && self.kind == other.kind
            && self.signature == other.signature
            && self.optional == other.optional
            && self.default == other.default
            && self.lazy == other.lazy
    }
}

/// Find the destination overload a source signature binds to.
///
/// Scans `dest_sigs` in declaration order and returns the first one of the
/// same arity whose every component accepts the matching source component
/// (source type equal to, or a subtype of, the destination type). A single
/// `Variant` source is accepted by the first declared destination signature.
#[must_use]
pub fn find_signature<'a>(
    source: &Signature,
    dest_sigs: &'a [Signature],
    registry: &ModuleRegistry,
) -> Option<&'a Signature> {
    if source.is_variant() {
        return dest_sigs.first();
    }
    dest_sigs.iter().find(|dest| registry.are_specs_matched(source, dest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_roundtrip() {
        let sig = Signature::parse("(basic:Integer, basic:Float)").unwrap();
        assert_eq!(sig.arity(), 2);
        assert_eq!(sig.to_string(), "(basic:Integer,basic:Float)");
        assert_eq!(Signature::parse("()").unwrap().arity(), 0);
        assert_eq!(Signature::parse("basic:String").unwrap().arity(), 1);
        assert!(Signature::parse("(basic:String").is_err());
    }

    #[test]
    fn variant_source_takes_first_overload() {
        let reg = ModuleRegistry::default();
        let dests = vec![Signature::single(basic::INTEGER), Signature::single(basic::STRING)];
        let chosen = find_signature(&Signature::single(basic::VARIANT), &dests, &reg);
        assert_eq!(chosen, Some(&dests[0]));
    }

    #[test]
    fn overload_chosen_by_arity_and_subtype() {
        let reg = ModuleRegistry::default();
        let dests = vec![
            Signature::single(basic::STRING),
            Signature::new(vec![basic::FLOAT.into(), basic::FLOAT.into()]),
            Signature::single(basic::FLOAT),
        ];
        let source = Signature::single(basic::INTEGER);
        assert_eq!(find_signature(&source, &dests, &reg), Some(&dests[2]));
        let source = Signature::single(basic::BOOLEAN);
        assert_eq!(find_signature(&source, &dests, &reg), None);
    }
}
