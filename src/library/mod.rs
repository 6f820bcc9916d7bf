//! Built-in module library.
//!
//! [`register_all`] turns the abstract basic hierarchy of
//! [`ModuleRegistry::default`] into executable module types and adds the
//! table, output and (with the `parallel-map` feature) map modules.
//!
//! | Package | Modules |
//! |---|---|
//! | `basic` | `Boolean`, `String`, `Float`, `Integer`, `List`, `File`, `Calculator`, `ConcatenateString`, `InputPort`, `OutputPort`, `Group`, `GenericOutput` |
//! | `tabledata` | `Table`, `ExtractColumn`, `BuildTable` |
//! | `parallelflow` | `Map` |

pub mod basic;
pub mod tabledata;

use crate::registry::ModuleRegistry;

/// Register every built-in module type on `reg`.
///
/// Descriptors are registered parents first, so the bases they name are
/// always present.
pub fn register_all(reg: &mut ModuleRegistry) {
    for descriptor in basic::descriptors() {
        reg.insert(descriptor);
    }
    for descriptor in tabledata::descriptors() {
        reg.insert(descriptor);
    }
    #[cfg(feature = "parallel-map")]
    reg.insert(crate::map::descriptor());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::basic as ids;

    #[test]
    fn standard_registry_has_executable_constants() {
        let reg = ModuleRegistry::standard();
        for ty in [ids::BOOLEAN, ids::STRING, ids::FLOAT, ids::INTEGER, ids::LIST, ids::FILE] {
            let d = reg.get_descriptor(ty).unwrap();
            assert!(!d.is_abstract, "{ty} should be instantiable");
            assert!(d.compute_unit().is_some(), "{ty} should be executable");
        }
        assert!(reg.is_subtype(ids::INTEGER, ids::FLOAT));
        assert!(reg.get_descriptor(ids::CONSTANT).unwrap().is_abstract);
    }

    #[cfg(feature = "parallel-map")]
    #[test]
    fn map_is_registered() {
        let reg = ModuleRegistry::standard();
        assert!(reg.get_descriptor_by_name(crate::map::PACKAGE, "Map").is_ok());
    }
}
