//! Lightweight typed identifiers for pipeline and log entities.
//!
//! Every entity stored in a [`Pipeline`](crate::pipeline::Pipeline), a
//! [`Vistrail`](crate::vistrail::Vistrail) or a [`Log`](crate::log::Log) is
//! addressed by a small `Copy` newtype around a `u64`. The newtypes keep a
//! module id from being used where a connection id is expected; the raw value
//! is what an [`IdScope`](crate::id_scope::IdScope) hands out.
//!
//! They’re hashable and ordered, so they can be used as keys in the arena maps
//! owned by a pipeline and sorted for deterministic traversal.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FormatResult};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw id.
            #[must_use]
            pub const fn new(v: u64) -> Self {
                Self(v)
            }

            /// Return the underlying numeric value.
            #[must_use]
            pub const fn raw(&self) -> u64 {
                self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(v: u64) -> Self {
                Self(v)
            }
        }
    };
}

define_id!(
    /// Identifier of a module inside a pipeline.
    ModuleId
);
define_id!(
    /// Identifier of a connection inside a pipeline.
    ConnectionId
);
define_id!(
    /// Identifier of a function (bound parameter list) inside a module.
    FunctionId
);
define_id!(
    /// Identifier of a single positional parameter.
    ParamId
);
define_id!(
    /// Identifier of an annotation, on a module or on a log record.
    AnnotationId
);
define_id!(
    /// Identifier of a port spec declared on a module instance.
    PortSpecId
);
define_id!(
    /// Identifier of a layout location.
    LocationId
);
define_id!(
    /// Identifier of an action; also the version number it produces.
    VersionId
);
define_id!(
    /// Identifier of a single operation inside an action.
    OperationId
);
define_id!(
    /// Identifier of a machine record inside a log.
    MachineId
);
define_id!(
    /// Identifier of a workflow, module or group execution record.
    ExecId
);

impl VersionId {
    /// The empty pipeline every vistrail starts from.
    pub const ROOT: Self = Self(0);
}
