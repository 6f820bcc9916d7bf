//! Output modes and their layered configuration.
//!
//! An output module writes its `value` input through one of the
//! [`OutputModeKind`]s. Each kind declares a fixed set of configuration fields
//! ([`FieldDecl`]); a field's effective value is looked up by a
//! [`ConfigResolver`] in these layers, highest precedence first:
//!
//! 1. per-call overrides ([`OutputSettings::overrides`]),
//! 2. the workflow's own configuration (the module's `configuration` input),
//! 3. global settings ([`OutputSettings::global`]),
//! 4. the field's declared default.
//!
//! File series numbering is kept in an [`OutputSession`], which lives for one
//! interpreter run.

use crate::compute::{ComputeContext, ModuleError};
use crate::errors::WorkflowError;
use crate::value::Value;
use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

/// Settings of one layer: mode type → field name → value.
pub type ConfigLayer = BTreeMap<String, BTreeMap<String, Value>>;

/// Layers supplied from outside the workflow.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputSettings {
    #[serde(default)]
    pub overrides: ConfigLayer,
    #[serde(default)]
    pub global: ConfigLayer,
}

impl OutputSettings {
    /// Parse settings from JSON such as `{"global": {"file": {"dir": "/tmp"}}}`.
    ///
    /// # Errors
    ///
    /// Returns a persistence error for malformed text.
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: BTreeMap<String, serde_json::Value> =
            serde_json::from_str(text).map_err(|e| WorkflowError::Persistence(e.to_string()))?;
        let layer = |name: &str| raw.get(name).map(parse_layer).transpose();
        Ok(Self {
            overrides: layer("overrides")?.unwrap_or_default(),
            global: layer("global")?.unwrap_or_default(),
        })
    }
}

/// Parse one configuration layer from JSON data.
///
/// # Errors
///
/// Returns a structural error unless `json` is an object of objects.
pub fn parse_layer(json: &serde_json::Value) -> Result<ConfigLayer> {
    let Some(modes) = json.as_object() else {
        bail!(WorkflowError::structure("output configuration must be an object"));
    };
    let mut out = ConfigLayer::new();
    for (mode, fields) in modes {
        let Some(fields) = fields.as_object() else {
            bail!(WorkflowError::structure(format!(
                "configuration of output mode '{mode}' must be an object"
            )));
        };
        let entry = out.entry(mode.clone()).or_default();
        for (k, v) in fields {
            if let Some(v) = Value::from_json(v) {
                entry.insert(k.clone(), v);
            }
        }
    }
    Ok(out)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    Path,
    Str,
    Bool,
    Int,
}

impl FieldType {
    fn accepts(self, v: &Value) -> bool {
        matches!(
            (self, v),
            (Self::Path, Value::String(_) | Value::File(_))
                | (Self::Str, Value::String(_))
                | (Self::Bool, Value::Boolean(_))
                | (Self::Int, Value::Integer(_))
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldDefault {
    Unset,
    Bool(bool),
    Int(i64),
}

impl FieldDefault {
    fn to_value(self) -> Option<Value> {
        match self {
            Self::Unset => None,
            Self::Bool(b) => Some(Value::Boolean(b)),
            Self::Int(i) => Some(Value::Integer(i)),
        }
    }
}

/// One declared configuration field of an output mode.
#[derive(Clone, Copy, Debug)]
pub struct FieldDecl {
    pub name: &'static str,
    pub default: FieldDefault,
    pub ty: FieldType,
}

const fn field(name: &'static str, default: FieldDefault, ty: FieldType) -> FieldDecl {
    FieldDecl { name, default, ty }
}

static FILE_FIELDS: [FieldDecl; 9] = [
    field("file", FieldDefault::Unset, FieldType::Path),
    field("basename", FieldDefault::Unset, FieldType::Str),
    field("prefix", FieldDefault::Unset, FieldType::Str),
    field("suffix", FieldDefault::Unset, FieldType::Str),
    field("dir", FieldDefault::Unset, FieldType::Path),
    field("series", FieldDefault::Bool(false), FieldType::Bool),
    field("overwrite", FieldDefault::Bool(false), FieldType::Bool),
    field("seriesPadding", FieldDefault::Int(3), FieldType::Int),
    field("seriesStart", FieldDefault::Int(0), FieldType::Int),
];

/// Fields that, when overridden, force a file name to be built from parts.
const FILE_NAME_PARTS: [&str; 7] = [
    "basename",
    "prefix",
    "suffix",
    "dir",
    "series",
    "seriesPadding",
    "seriesStart",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputModeKind {
    Stdout,
    File,
}

impl OutputModeKind {
    pub const ALL: [Self; 2] = [Self::Stdout, Self::File];

    #[must_use]
    pub fn mode_type(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::File => "file",
        }
    }

    #[must_use]
    pub fn from_mode_type(mode_type: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.mode_type() == mode_type)
    }

    /// Higher wins when no mode is requested explicitly.
    #[must_use]
    pub fn priority(self) -> i32 {
        match self {
            Self::Stdout => 2,
            Self::File => 1,
        }
    }

    #[must_use]
    pub fn fields(self) -> &'static [FieldDecl] {
        match self {
            Self::Stdout => &[],
            Self::File => &FILE_FIELDS,
        }
    }

    #[must_use]
    pub fn field(self, name: &str) -> Option<&'static FieldDecl> {
        self.fields().iter().find(|f| f.name == name)
    }

    /// The available mode with the highest priority.
    #[must_use]
    pub fn preferred() -> Self {
        Self::ALL
            .into_iter()
            .max_by_key(|k| k.priority())
            .unwrap_or(Self::Stdout)
    }
}

/// Looks a field of one mode up through the configuration layers.
pub struct ConfigResolver<'a> {
    kind: OutputModeKind,
    layers: Vec<(&'static str, Option<&'a BTreeMap<String, Value>>)>,
}

impl<'a> ConfigResolver<'a> {
    #[must_use]
    pub fn new(kind: OutputModeKind, settings: &'a OutputSettings, workflow: Option<&'a ConfigLayer>) -> Self {
        let mode = kind.mode_type();
        Self {
            kind,
            layers: vec![
                ("override", settings.overrides.get(mode)),
                ("workflow", workflow.and_then(|w| w.get(mode))),
                ("global", settings.global.get(mode)),
            ],
        }
    }

    fn decl(&self, name: &str) -> Result<&'static FieldDecl> {
        self.kind.field(name).ok_or_else(|| {
            WorkflowError::structure(format!(
                "setting '{name}' is not declared for output mode '{}'",
                self.kind.mode_type()
            ))
            .into()
        })
    }

    /// Effective value of `name` and the layer it came from (`"default"` for
    /// declared defaults). `None` when no layer sets it and it has no default.
    ///
    /// # Errors
    ///
    /// Returns a structural error for undeclared fields or values of the
    /// wrong type.
    pub fn lookup(&self, name: &str) -> Result<Option<(Value, &'static str)>> {
        let decl = self.decl(name)?;
        for (layer, values) in &self.layers {
            if let Some(v) = values.and_then(|m| m.get(name)) {
                if !decl.ty.accepts(v) {
                    bail!(WorkflowError::structure(format!(
                        "setting '{name}' from {layer} layer has the wrong type: {v}"
                    )));
                }
                return Ok(Some((v.clone(), *layer)));
            }
        }
        Ok(decl.default.to_value().map(|v| (v, "default")))
    }

    /// # Errors
    ///
    /// See [`lookup`](Self::lookup).
    pub fn get(&self, name: &str) -> Result<Option<Value>> {
        Ok(self.lookup(name)?.map(|(v, _)| v))
    }

    #[must_use]
    pub fn has_override(&self, name: &str) -> bool {
        self.layers[0].1.is_some_and(|m| m.contains_key(name))
    }

    fn get_str(&self, name: &str) -> Result<Option<String>> {
        Ok(self.get(name)?.map(|v| match v {
            Value::File(p) => p.display().to_string(),
            other => other.to_string(),
        }))
    }

    fn get_bool(&self, name: &str) -> Result<bool> {
        Ok(self.get(name)?.and_then(|v| v.as_bool()).unwrap_or(false))
    }

    fn get_int(&self, name: &str) -> Result<i64> {
        Ok(self.get(name)?.and_then(|v| v.as_i64()).unwrap_or(0))
    }
}

/// Per-run output state: the file series counter.
#[derive(Clone, Debug, Default)]
pub struct OutputSession {
    series_next: Option<u64>,
    written: Vec<PathBuf>,
}

impl OutputSession {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Next series number; the first call of a session starts at `start`.
    pub fn next_series(&mut self, start: u64) -> u64 {
        let n = *self.series_next.get_or_insert(start);
        self.series_next = Some(n + 1);
        n
    }

    /// Files written during this session, in order.
    #[must_use]
    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }
}

/// Resolve the file a file-mode output writes to.
///
/// An explicit `file` wins when it is overridden, or when it is set and none
/// of the name parts are overridden. Otherwise the name is
/// `{dir}/{prefix}{basename}{series}{suffix}` with `basename` defaulting to
/// `vt_out`.
///
/// # Errors
///
/// Returns a structural error for bad settings, or an I/O-flavoured module
/// error if the file exists and `overwrite` is off.
pub fn get_filename(resolver: &ConfigResolver<'_>, session: &mut OutputSession) -> Result<PathBuf> {
    let overwrite = resolver.get_bool("overwrite")?;
    let parts_overridden = FILE_NAME_PARTS.iter().any(|f| resolver.has_override(f));
    let explicit = resolver.get_str("file")?;
    let full_path = match explicit {
        Some(file) if resolver.has_override("file") || !parts_overridden => PathBuf::from(file),
        _ => {
            let basename = resolver.get_str("basename")?.unwrap_or_else(|| "vt_out".to_string());
            let prefix = resolver.get_str("prefix")?.unwrap_or_default();
            let suffix = resolver.get_str("suffix")?.unwrap_or_default();
            let dir = PathBuf::from(resolver.get_str("dir")?.unwrap_or_default());
            let series = resolver.get_bool("series")?;
            let padding = usize::try_from(resolver.get_int("seriesPadding")?).unwrap_or(0);
            let start = u64::try_from(resolver.get_int("seriesStart")?).unwrap_or(0);
            let name = |session: &mut OutputSession| {
                let series_str = if series {
                    format!("{:0padding$}", session.next_series(start))
                } else {
                    String::new()
                };
                dir.join(format!("{prefix}{basename}{series_str}{suffix}"))
            };
            let mut path = name(session);
            if series && !overwrite {
                while path.exists() {
                    path = name(session);
                }
            }
            path
        }
    };
    if !overwrite && full_path.exists() {
        bail!(WorkflowError::structure(format!(
            "file '{}' exists and overwrite is off",
            full_path.display()
        )));
    }
    Ok(full_path)
}

/// Compute unit of the generic output module: write `value` through the
/// requested or preferred mode and annotate the run with the mode used.
///
/// # Errors
///
/// Fails for unknown modes, bad configuration or write errors.
pub fn compute_generic_output(ctx: &mut ComputeContext<'_>) -> Result<(), ModuleError> {
    let kind = match ctx.try_get_input("mode_type") {
        Some(Value::String(mode)) => OutputModeKind::from_mode_type(mode)
            .ok_or_else(|| ctx.error(format!("Cannot output in mode \"{mode}\" because that mode has not been defined")))?,
        Some(other) => return Err(ctx.error(format!("mode_type must be a string, got {other}"))),
        None => OutputModeKind::preferred(),
    };
    let workflow_layer = match ctx.try_get_input("configuration") {
        Some(Value::String(text)) => {
            let json: serde_json::Value = serde_json::from_str(text)
                .map_err(|e| ctx.error(format!("invalid output configuration: {e}")))?;
            Some(parse_layer(&json).map_err(|e| ctx.error(format!("{e:#}")))?)
        }
        Some(Value::Object(obj)) => Some(parse_layer(&obj.state).map_err(|e| ctx.error(format!("{e:#}")))?),
        Some(other) => return Err(ctx.error(format!("unsupported output configuration {other}"))),
        None => None,
    };
    let value = ctx.get_input("value")?.clone();
    ctx.annotate("output_mode", kind.mode_type());

    match kind {
        OutputModeKind::Stdout => {
            println!("{value}");
            Ok(())
        }
        OutputModeKind::File => {
            let settings = ctx.output_settings().clone();
            let resolver = ConfigResolver::new(kind, &settings, workflow_layer.as_ref());
            let path = get_filename(&resolver, ctx.output_session()).map_err(|e| ctx.error(format!("{e:#}")))?;
            let mut f = File::create(&path)
                .map_err(|e| ctx.error(format!("Could not create file '{}': {e}", path.display())))?;
            writeln!(f, "{value}").map_err(|e| ctx.error(format!("writing '{}': {e}", path.display())))?;
            ctx.output_session().written.push(path);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(mode: &str, field: &str, v: Value) -> ConfigLayer {
        let mut l = ConfigLayer::new();
        l.entry(mode.to_string()).or_default().insert(field.to_string(), v);
        l
    }

    #[test]
    fn precedence_override_workflow_global_default() {
        let mut settings = OutputSettings::default();
        let workflow = layer("file", "seriesStart", Value::Integer(7));
        let r = ConfigResolver::new(OutputModeKind::File, &settings, Some(&workflow));
        assert_eq!(r.lookup("seriesStart").unwrap(), Some((Value::Integer(7), "workflow")));
        assert_eq!(r.lookup("seriesPadding").unwrap(), Some((Value::Integer(3), "default")));

        settings.global = layer("file", "seriesPadding", Value::Integer(5));
        settings.overrides = layer("file", "seriesStart", Value::Integer(1));
        let r = ConfigResolver::new(OutputModeKind::File, &settings, Some(&workflow));
        assert_eq!(r.lookup("seriesStart").unwrap(), Some((Value::Integer(1), "override")));
        assert_eq!(r.lookup("seriesPadding").unwrap(), Some((Value::Integer(5), "global")));
        assert_eq!(r.lookup("basename").unwrap(), None);
    }

    #[test]
    fn undeclared_field_is_rejected() {
        let settings = OutputSettings::default();
        let r = ConfigResolver::new(OutputModeKind::File, &settings, None);
        assert!(r.get("colour").is_err());
        let r = ConfigResolver::new(OutputModeKind::Stdout, &settings, None);
        assert!(r.get("file").is_err());
    }

    #[test]
    fn series_counter_is_per_session() {
        let mut a = OutputSession::new();
        assert_eq!(a.next_series(5), 5);
        assert_eq!(a.next_series(5), 6);
        let mut b = OutputSession::new();
        assert_eq!(b.next_series(0), 0);
    }

    #[test]
    fn series_file_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = OutputSettings::default();
        let fields = settings.global.entry("file".into()).or_default();
        fields.insert("dir".into(), Value::from(dir.path().display().to_string()));
        fields.insert("series".into(), Value::Boolean(true));
        fields.insert("suffix".into(), Value::from(".txt"));
        let r = ConfigResolver::new(OutputModeKind::File, &settings, None);
        let mut session = OutputSession::new();
        let first = get_filename(&r, &mut session).unwrap();
        assert_eq!(first, dir.path().join("vt_out000.txt"));
        std::fs::write(&first, "x").unwrap();
        let second = get_filename(&r, &mut session).unwrap();
        assert_eq!(second, dir.path().join("vt_out001.txt"));
    }

    #[test]
    fn stdout_is_preferred() {
        assert_eq!(OutputModeKind::preferred(), OutputModeKind::Stdout);
    }
}
