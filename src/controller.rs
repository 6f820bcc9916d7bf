//! Editing and running a vistrail.
//!
//! A [`VistrailController`] tracks one selected version of a [`Vistrail`] and
//! its materialized [`Pipeline`]. Every edit goes through an [`Action`] added
//! under the selected version, which then becomes the new selection, so the
//! full history of the pipeline stays in the version tree.
//!
//! ```
//! use std::sync::Arc;
//! use vistrail::controller::VistrailController;
//! use vistrail::registry::ModuleRegistry;
//! use vistrail::value::Value;
//! use vistrail::vistrail::Vistrail;
//!
//! let mut ctl = VistrailController::new(Vistrail::new(), Arc::new(ModuleRegistry::standard()));
//! let a = ctl.add_module("basic", "Float", 0.0, 0.0).unwrap();
//! ctl.set_function(a, "value", vec![Value::Float(2.5)]).unwrap();
//! let result = ctl.execute_current_workflow().unwrap();
//! assert_eq!(result.output(a, "value"), Some(&Value::Float(2.5)));
//! ```

use crate::action::{Action, ActionItem, DataObject, create_action, create_paste_action};
use crate::compute::ExecutionServices;
use crate::connection::Connection;
use crate::errors::WorkflowError;
use crate::id_scope::EntityKind;
use crate::ids::{ConnectionId, ModuleId, VersionId};
use crate::interpreter::{ExecutionResult, Interpreter, InterpreterConfig};
use crate::log::Log;
use crate::module::{Annotation, IdRemap, Location, Module, ModuleFunction, ModuleParam};
use crate::persistence::FileLocator;
use crate::pipeline::Pipeline;
use crate::port::PortKind;
use crate::registry::{ModuleRegistry, basic};
use crate::value::Value;
use crate::vistrail::{VersionRef, Vistrail};
use anyhow::{Context, Result, bail};
use log::info;
use std::sync::Arc;

pub struct VistrailController {
    vistrail: Vistrail,
    registry: Arc<ModuleRegistry>,
    current_version: VersionId,
    current_pipeline: Pipeline,
    interpreter: Interpreter,
    log: Log,
}

impl VistrailController {
    /// A controller on the latest version of `vistrail`.
    #[must_use]
    pub fn new(vistrail: Vistrail, registry: Arc<ModuleRegistry>) -> Self {
        Self::with_interpreter(
            vistrail,
            registry,
            Interpreter::new(InterpreterConfig::default(), ExecutionServices::default()),
        )
    }

    #[must_use]
    pub fn with_interpreter(vistrail: Vistrail, registry: Arc<ModuleRegistry>, interpreter: Interpreter) -> Self {
        let mut ctl = Self {
            vistrail,
            registry,
            current_version: VersionId::ROOT,
            current_pipeline: Pipeline::new(),
            interpreter,
            log: Log::new(),
        };
        let latest = ctl.vistrail.latest_version();
        if let Ok(p) = ctl.vistrail.get_pipeline(latest) {
            ctl.current_version = latest;
            ctl.current_pipeline = p;
        }
        ctl
    }

    /// Load a vistrail document and select its latest version.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be read.
    pub fn load(locator: &FileLocator, registry: Arc<ModuleRegistry>) -> Result<Self> {
        let vistrail: Vistrail = locator.load()?;
        Ok(Self::new(vistrail, registry))
    }

    /// # Errors
    ///
    /// Returns an error if the document cannot be written.
    pub fn save(&self, locator: &FileLocator) -> Result<()> {
        locator.save(&self.vistrail)
    }

    /// # Errors
    ///
    /// Returns an error if the log cannot be written.
    pub fn save_log(&self, locator: &FileLocator) -> Result<()> {
        locator.save(&self.log)
    }

    #[must_use]
    pub fn vistrail(&self) -> &Vistrail {
        &self.vistrail
    }

    #[must_use]
    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    #[must_use]
    pub fn current_version(&self) -> VersionId {
        self.current_version
    }

    #[must_use]
    pub fn current_pipeline(&self) -> &Pipeline {
        &self.current_pipeline
    }

    #[must_use]
    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut Log {
        &mut self.log
    }

    pub fn interpreter_mut(&mut self) -> &mut Interpreter {
        &mut self.interpreter
    }

    /// # Errors
    ///
    /// Returns `NotFound` for unknown versions or tags.
    pub fn change_selected_version(&mut self, version: impl Into<VersionRef>) -> Result<()> {
        let version = self.vistrail.resolve(version)?;
        self.current_pipeline = self.vistrail.get_pipeline(version)?;
        self.current_version = version;
        Ok(())
    }

    /// Add `action` under the selected version and select the result.
    ///
    /// # Errors
    ///
    /// Returns the action's structural error if it does not apply.
    pub fn perform_action(&mut self, action: Action) -> Result<VersionId> {
        let mut pipeline = self.current_pipeline.clone();
        action.apply(&mut pipeline)?;
        let version = self.vistrail.add_action(action, self.current_version)?;
        self.current_version = version;
        self.current_pipeline = pipeline;
        Ok(version)
    }

    /// # Errors
    ///
    /// Returns a structural error for malformed items or operations that do
    /// not apply.
    pub fn perform_operations(&mut self, items: Vec<ActionItem>) -> Result<VersionId> {
        let action = create_action(items)?;
        self.perform_action(action)
    }

    fn new_id(&mut self, kind: EntityKind) -> u64 {
        self.vistrail.id_scope_mut().get_new_id(kind)
    }

    /// Add a module of type `package:name` at `(x, y)`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unregistered types.
    pub fn add_module(&mut self, package: &str, name: &str, x: f64, y: f64) -> Result<ModuleId> {
        let descriptor = self.registry.get_descriptor_by_name(package, name)?;
        if descriptor.is_abstract {
            bail!(WorkflowError::structure(format!(
                "module type '{}' is abstract",
                descriptor.identifier()
            )));
        }
        let mut module = Module::new(self.new_id(EntityKind::Module), package, name);
        module.location = Some(Location {
            id: self.new_id(EntityKind::Location).into(),
            x,
            y,
        });
        let id = module.id;
        self.perform_operations(vec![ActionItem::add(DataObject::Module(module))])?;
        Ok(id)
    }

    /// Add a copy of `module` (a group, for instance) with fresh ids.
    ///
    /// # Errors
    ///
    /// Returns a structural error if the copy does not apply.
    pub fn insert_module(&mut self, module: &Module) -> Result<ModuleId> {
        let mut remap = IdRemap::new();
        let copy = module.do_copy(true, self.vistrail.id_scope_mut(), &mut remap);
        let id = copy.id;
        self.perform_operations(vec![ActionItem::add(DataObject::Module(copy))])?;
        Ok(id)
    }

    /// Connect `source.source_port` to `dest.dest_port`.
    ///
    /// # Errors
    ///
    /// Returns a structural error if a module or port is missing or the port
    /// signatures do not match.
    pub fn add_connection(
        &mut self,
        source: ModuleId,
        source_port: &str,
        dest: ModuleId,
        dest_port: &str,
    ) -> Result<ConnectionId> {
        let connection = Connection::new(
            self.new_id(EntityKind::Connection),
            source,
            source_port,
            dest,
            dest_port,
        );
        self.current_pipeline
            .check_connection(&connection, &self.registry)
            .context("adding connection")?;
        let id = connection.id;
        self.perform_operations(vec![ActionItem::add(DataObject::Connection(connection))])?;
        Ok(id)
    }

    /// Delete a module together with every connection attached to it.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the module does not exist.
    pub fn delete_module(&mut self, id: ModuleId) -> Result<VersionId> {
        let module = self.current_pipeline.get_module(id)?.clone();
        let mut items: Vec<ActionItem> = self
            .current_pipeline
            .connections()
            .filter(|c| c.touches(id))
            .map(|c| ActionItem::delete(DataObject::Connection(c.clone())))
            .collect();
        items.push(ActionItem::delete(DataObject::Module(module)));
        self.perform_operations(items)
    }

    /// # Errors
    ///
    /// Returns `NotFound` if the connection does not exist.
    pub fn delete_connection(&mut self, id: ConnectionId) -> Result<VersionId> {
        let Some(connection) = self.current_pipeline.connection(id).cloned() else {
            bail!(WorkflowError::not_found(format!("connection {id}")));
        };
        self.perform_operations(vec![ActionItem::delete(DataObject::Connection(connection))])
    }

    /// Bind `values` to input port `port` of a module, replacing any function
    /// already bound to that port.
    ///
    /// # Errors
    ///
    /// Returns a structural error if the module has no such input port.
    pub fn set_function(&mut self, module_id: ModuleId, port: &str, values: Vec<Value>) -> Result<VersionId> {
        let module = self.current_pipeline.get_module(module_id)?;
        let Some(spec) = Pipeline::port_spec_of(module, port, PortKind::Input, &self.registry) else {
            bail!(WorkflowError::structure(format!(
                "module {module_id} ({}) has no input port '{port}'",
                module.identifier()
            )));
        };
        let old = module.function(port).cloned();
        let pos = old.as_ref().map_or(module.functions.len(), |f| f.pos as usize);

        let mut function = ModuleFunction::new(self.new_id(EntityKind::Function), u32::try_from(pos)?, port);
        for (i, value) in values.into_iter().enumerate() {
            let type_name = spec
                .signature
                .components()
                .get(i)
                .cloned()
                .unwrap_or_else(|| basic::VARIANT.to_string());
            let param_id = self.new_id(EntityKind::Parameter);
            function.add_parameter(ModuleParam::new(param_id, u32::try_from(i)?, type_name, value));
        }
        let new = DataObject::Function { module_id, function };
        let item = match old {
            Some(old) => ActionItem::change(DataObject::Function { module_id, function: old }, new),
            None => ActionItem::add(new),
        };
        self.perform_operations(vec![item])
    }

    /// # Errors
    ///
    /// Returns a structural error if the module already has `key`.
    pub fn add_annotation(&mut self, module_id: ModuleId, key: &str, value: impl Into<Value>) -> Result<VersionId> {
        self.current_pipeline.get_module(module_id)?;
        let annotation = Annotation::new(self.new_id(EntityKind::Annotation), key, value);
        self.perform_operations(vec![ActionItem::add(DataObject::Annotation { module_id, annotation })])
    }

    /// Paste a copy of `pipeline` into the selected version. Returns the map
    /// from the pasted ids to the new ones.
    ///
    /// # Errors
    ///
    /// Returns a structural error if the copy does not apply.
    pub fn paste(&mut self, pipeline: &Pipeline) -> Result<IdRemap> {
        let mut remap = IdRemap::new();
        let action = create_paste_action(pipeline, self.vistrail.id_scope_mut(), &mut remap);
        self.perform_action(action)?;
        Ok(remap)
    }

    /// # Errors
    ///
    /// Returns a structural error if the tag already names another version.
    pub fn tag_version(&mut self, tag: &str) -> Result<()> {
        self.vistrail.add_tag(self.current_version, tag)
    }

    /// Select the parent of the selected version.
    ///
    /// # Errors
    ///
    /// Returns a structural error at the root.
    pub fn undo(&mut self) -> Result<VersionId> {
        let Some(parent) = self.vistrail.parent(self.current_version) else {
            bail!(WorkflowError::structure("nothing to undo at the root version"));
        };
        self.change_selected_version(parent)?;
        Ok(parent)
    }

    /// The action turning version `from` into version `to`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown versions.
    pub fn diff_versions(&self, from: impl Into<VersionRef>, to: impl Into<VersionRef>) -> Result<Action> {
        self.vistrail.diff(from, to)
    }

    /// Run the selected pipeline, recording it in this controller's log.
    ///
    /// # Errors
    ///
    /// Returns a structural error if the pipeline cannot be executed at all;
    /// module failures are reported in the result.
    pub fn execute_current_workflow(&mut self) -> Result<ExecutionResult> {
        info!(
            "executing version {} ({} modules)",
            self.current_version,
            self.current_pipeline.module_count()
        );
        self.interpreter.execute(
            &self.current_pipeline,
            &self.registry,
            &mut self.log,
            self.current_version,
        )
    }

    /// Empty the interpreter's result cache.
    pub fn flush_cache(&mut self) {
        self.interpreter.flush();
    }
}
