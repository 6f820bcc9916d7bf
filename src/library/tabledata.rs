//! Column tables: the abstract `Table` type and the modules that take tables
//! apart and put them together.
//!
//! `BuildTable` has no fixed inputs. Each instance declares its own input
//! ports; lists connected to them become single columns named after the
//! port, tables are spliced in whole.

use crate::compute::{ComputeContext, ModuleError};
use crate::port::{PortKind, PortSpec};
use crate::registry::{ModuleDescriptor, basic};
use crate::value::{Table, Value};

pub const PACKAGE: &str = "tabledata";

#[must_use]
pub fn descriptors() -> Vec<ModuleDescriptor> {
    vec![
        ModuleDescriptor::new(PACKAGE, "Table")
            .input(PortSpec::input("name", basic::STRING).optional())
            .output(PortSpec::output("value", basic::TABLE))
            .abstract_type(),
        ModuleDescriptor::new(PACKAGE, "ExtractColumn")
            .input(PortSpec::input("table", basic::TABLE))
            .input(PortSpec::input("column_name", basic::STRING).optional())
            .input(PortSpec::input("column_index", basic::INTEGER).optional())
            .input(PortSpec::input("numeric", basic::BOOLEAN).with_default(Value::Boolean(false)))
            .output(PortSpec::output("value", basic::LIST))
            .compute(compute_extract_column),
        ModuleDescriptor::new(PACKAGE, "BuildTable")
            .output(PortSpec::output("value", basic::TABLE))
            .compute(compute_build_table),
    ]
}

/// Select a column by name, index or both; when both are given they must
/// name the same column.
///
/// # Errors
///
/// Returns the message to report when the selection is impossible.
pub fn choose_column(table: &Table, name: Option<&str>, index: Option<usize>) -> Result<usize, String> {
    let chosen = match (name, index) {
        (Some(name), index) => {
            let names = table
                .names
                .as_ref()
                .ok_or("Unable to get column by name: table doesn't have column names")?;
            let found = names
                .iter()
                .position(|n| n == name)
                .or_else(|| names.iter().position(|n| n == name.trim()))
                .ok_or_else(|| format!("Column name was not found: {name:?}"))?;
            if index.is_some_and(|i| i != found) {
                return Err("Both a column name and index were specified, and they don't agree".to_string());
            }
            found
        }
        (None, Some(index)) => index,
        (None, None) => return Err("No column name nor index specified".to_string()),
    };
    if chosen >= table.column_count() {
        return Err(format!(
            "No column {chosen}, table only has {} columns",
            table.column_count()
        ));
    }
    Ok(chosen)
}

fn compute_extract_column(ctx: &mut ComputeContext<'_>) -> Result<(), ModuleError> {
    let Value::Table(table) = ctx.get_input("table")? else {
        return Err(ctx.error("table input is not a table"));
    };
    let name = match ctx.try_get_input("column_name") {
        Some(v) => Some(v.as_str().ok_or_else(|| ctx.error("column_name must be a string"))?),
        None => None,
    };
    let index = match ctx.try_get_input("column_index") {
        Some(v) => {
            let i = v
                .as_i64()
                .ok_or_else(|| ctx.error("column_index must be an integer"))?;
            Some(usize::try_from(i).map_err(|_| ctx.error(format!("Invalid column index {i}")))?)
        }
        None => None,
    };
    let numeric = ctx
        .try_get_input("numeric")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let idx = choose_column(table, name, index).map_err(|e| ctx.error(e))?;
    let column = table.get_column(idx).unwrap_or_default();
    let values = if numeric {
        column
            .iter()
            .map(|v| match v {
                Value::String(s) => s.trim().parse::<f64>().ok().map(Value::Float),
                other => other.as_f64().map(Value::Float),
            })
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| ctx.error(format!("Column {idx} is not numeric")))?
    } else {
        column.to_vec()
    };
    ctx.set_output("value", Value::List(values));
    Ok(())
}

fn compute_build_table(ctx: &mut ComputeContext<'_>) -> Result<(), ModuleError> {
    let ports: Vec<String> = ctx
        .module()
        .port_specs
        .iter()
        .filter(|p| p.kind == PortKind::Input)
        .map(|p| p.name.clone())
        .collect();
    let mut items = Vec::with_capacity(ports.len());
    for port in &ports {
        if let Some(v) = ctx.try_get_input(port) {
            items.push((port.as_str(), v));
        }
    }
    if items.is_empty() {
        return Err(ctx.error("No inputs were provided"));
    }

    let mut rows: Option<usize> = None;
    let mut check_rows = |n: usize| -> Result<(), String> {
        match rows {
            Some(expected) if expected != n => Err(format!("Different row counts: {n} != {expected}")),
            Some(_) => Ok(()),
            None => {
                rows = Some(n);
                Ok(())
            }
        }
    };
    let mut columns = Vec::new();
    let mut names = Vec::new();
    for (port, item) in items {
        match item {
            Value::Table(t) => {
                check_rows(t.rows).map_err(|e| ctx.error(e))?;
                columns.extend(t.columns.iter().cloned());
                match &t.names {
                    Some(n) => names.extend(n.iter().cloned()),
                    None => names.extend((0..t.column_count()).map(|i| format!("{port} col {i}"))),
                }
            }
            other => {
                let list = other
                    .as_list()
                    .ok_or_else(|| ctx.error(format!("{port} is neither a list nor a table")))?;
                check_rows(list.len()).map_err(|e| ctx.error(e))?;
                columns.push(list.to_vec());
                names.push(port.to_string());
            }
        }
    }
    let table = Table {
        name: None,
        names: Some(names),
        columns,
        rows: rows.unwrap_or(0),
    };
    ctx.set_output("value", Value::Table(table));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn people() -> Table {
        Table {
            name: Some("people".into()),
            names: Some(vec!["name".into(), "age".into()]),
            columns: vec![
                vec![Value::from("ann"), Value::from("bob")],
                vec![Value::from("31"), Value::Integer(42)],
            ],
            rows: 2,
        }
    }

    #[test]
    fn choose_by_name_or_index() {
        let t = people();
        assert_eq!(choose_column(&t, Some("age"), None), Ok(1));
        assert_eq!(choose_column(&t, Some(" age "), None), Ok(1));
        assert_eq!(choose_column(&t, None, Some(0)), Ok(0));
        assert_eq!(choose_column(&t, Some("age"), Some(1)), Ok(1));
    }

    #[test]
    fn choose_rejects_disagreement_and_absence() {
        let t = people();
        assert!(choose_column(&t, Some("age"), Some(0)).unwrap_err().contains("don't agree"));
        assert!(choose_column(&t, Some("height"), None).unwrap_err().contains("not found"));
        assert_eq!(
            choose_column(&t, None, None).unwrap_err(),
            "No column name nor index specified"
        );
        assert!(choose_column(&t, None, Some(5)).unwrap_err().contains("only has 2 columns"));
    }

    #[test]
    fn choose_by_name_needs_names() {
        let t = Table {
            names: None,
            ..people()
        };
        assert!(choose_column(&t, Some("age"), None).unwrap_err().contains("doesn't have column names"));
    }
}
