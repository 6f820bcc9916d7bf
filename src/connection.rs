//! Directed, typed edges between module ports.
//!
//! Connections refer to their endpoints by module id and port name only; the
//! owning [`Pipeline`](crate::pipeline::Pipeline) resolves those ids, so
//! modules never hold back-pointers to the edges attached to them.

use crate::id_scope::{EntityKind, IdScope};
use crate::ids::{ConnectionId, ModuleId};
use crate::module::{IdRemap, remapped};
use crate::port::Signature;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FormatResult};

/// One end of a connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRef {
    pub module_id: ModuleId,
    pub port: String,
    /// Signature the endpoint was bound with, when known.
    #[serde(default)]
    pub signature: Option<Signature>,
}

impl PortRef {
    #[must_use]
    pub fn new(module_id: ModuleId, port: impl Into<String>) -> Self {
        Self {
            module_id,
            port: port.into(),
            signature: None,
        }
    }

    #[must_use]
    pub fn equals_no_id(&self, other: &Self) -> bool {
        self.port == other.port && self.signature == other.signature
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub source: PortRef,
    pub destination: PortRef,
}

impl Connection {
    #[must_use]
    pub fn new(
        id: u64,
        source_module: ModuleId,
        source_port: impl Into<String>,
        dest_module: ModuleId,
        dest_port: impl Into<String>,
    ) -> Self {
        Self::from_ports(
            id,
            PortRef::new(source_module, source_port),
            PortRef::new(dest_module, dest_port),
        )
    }

    #[must_use]
    pub fn from_ports(id: u64, source: PortRef, destination: PortRef) -> Self {
        Self {
            id: ConnectionId::new(id),
            source,
            destination,
        }
    }

    /// Structural clone. With `new_ids` the connection gets a fresh id, and in
    /// every case its endpoints are rewritten through `id_remap`, so copying
    /// modules first and connections second keeps the copy self-consistent.
    pub fn do_copy(&self, new_ids: bool, id_scope: &mut IdScope, id_remap: &mut IdRemap) -> Self {
        let mut cp = self.clone();
        if new_ids {
            let id = id_scope.get_new_id(EntityKind::Connection);
            id_remap.insert((EntityKind::Connection, self.id.raw()), id);
            cp.id = ConnectionId::new(id);
        }
        cp.source.module_id = ModuleId::new(remapped(id_remap, EntityKind::Module, self.source.module_id.raw()));
        cp.destination.module_id =
            ModuleId::new(remapped(id_remap, EntityKind::Module, self.destination.module_id.raw()));
        cp
    }

    /// Endpoint equality, ignoring the connection's own id.
    #[must_use]
    pub fn equals_no_id(&self, other: &Self) -> bool {
        self.source.module_id == other.source.module_id
            && self.destination.module_id == other.destination.module_id
            && self.source.equals_no_id(&other.source)
            && self.destination.equals_no_id(&other.destination)
    }

    #[must_use]
    pub fn touches(&self, module_id: ModuleId) -> bool {
        self.source.module_id == module_id || self.destination.module_id == module_id
    }
}

impl Display for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        write!(
            f,
            "<Connection {}: {}.{} -> {}.{}>",
            self.id, self.source.module_id, self.source.port, self.destination.module_id, self.destination.port
        )
    }
}
