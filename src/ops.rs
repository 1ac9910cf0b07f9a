//! Purpose: The units of work a session worker (or the install worker) executes.
//! Exports: `Operation`, call builders for assign/serialize/workspace steps.
//! Role: Translate engine requests into interpreter calls and store traffic.
//! Invariants: Only operations that touch the interpreter ask the slot for a link.
//! Invariants: Temporary `.RData` files are unlinked even when the load step fails.
//! Invariants: Table binding checks existence and assigns inside one job, with no command in between.

use crate::catalog;
use crate::core::command::CommandKind;
use crate::core::error::{Error, ErrorKind};
use crate::core::value::Value;
use crate::link::InterpreterLink;
use crate::packages;
use crate::session::LinkSlot;
use crate::workspace::WorkspaceStore;

pub const WORKSPACE_FILE: &str = ".RData";
pub const GLOBAL_ENV: &str = ".GlobalEnv";
pub const TABLE_ENV: &str = ".DSTableEnv";

pub fn assign_call(symbol: &str, call: &str) -> String {
    format!("base::assign('{symbol}', value = {{{call}}})")
}

/// Wraps an expression so the interpreter answers with its serialized bytes.
pub fn serialize_call(expression: &str) -> String {
    format!("try(base::serialize({{{expression}}}, NULL))")
}

pub fn save_image_call() -> String {
    format!("base::save.image(file = '{WORKSPACE_FILE}')")
}

pub fn load_call(environment: &str) -> String {
    format!("base::load(file = '{WORKSPACE_FILE}', envir = {environment})")
}

pub fn unlink_call() -> String {
    format!("base::unlink('{WORKSPACE_FILE}')")
}

pub fn ensure_table_env_call() -> String {
    format!(
        "if (!base::exists('{TABLE_ENV}')) base::assign('{TABLE_ENV}', base::new.env(), envir = {GLOBAL_ENV})"
    )
}

#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    Evaluate { call: String },
    Assign { symbol: String, call: String },
    LoadTable {
        symbol: String,
        table: String,
        variables: Vec<String>,
    },
    SaveWorkspace { path: String },
    LoadWorkspace { path: String },
    LoadTables { paths: Vec<String> },
    RemoveWorkspace { path: String },
    Packages,
    InstallPackage { filename: String, bytes: Vec<u8> },
}

impl Operation {
    pub fn kind(&self) -> CommandKind {
        match self {
            Operation::Evaluate { .. } => CommandKind::Evaluate,
            Operation::Assign { .. } | Operation::LoadTable { .. } => CommandKind::Assign,
            Operation::SaveWorkspace { .. } => CommandKind::SaveWorkspace,
            Operation::LoadWorkspace { .. } => CommandKind::LoadWorkspace,
            Operation::LoadTables { .. } => CommandKind::LoadTables,
            Operation::RemoveWorkspace { .. } => CommandKind::RemoveWorkspace,
            Operation::Packages => CommandKind::Packages,
            Operation::InstallPackage { .. } => CommandKind::InstallPackage,
        }
    }

    /// Text stored as the command's expression.
    pub fn describe(&self) -> String {
        match self {
            Operation::Evaluate { call } => call.clone(),
            Operation::Assign { symbol, call } => assign_call(symbol, call),
            Operation::LoadTable {
                symbol,
                table,
                variables,
            } => assign_call(symbol, &catalog::load_table_call(table, variables)),
            Operation::SaveWorkspace { path } => format!("save workspace {path}"),
            Operation::LoadWorkspace { path } => format!("load workspace {path}"),
            Operation::LoadTables { paths } => format!("load tables {}", paths.join(", ")),
            Operation::RemoveWorkspace { path } => format!("remove workspace {path}"),
            Operation::Packages => packages::PACKAGES_CALL.to_string(),
            Operation::InstallPackage { filename, .. } => format!("install package {filename}"),
        }
    }

    pub(crate) fn run(self, slot: &mut LinkSlot, store: &dyn WorkspaceStore) -> Result<Value, Error> {
        match self {
            Operation::Evaluate { call } => slot.link_for()?.execute(&call),
            Operation::Assign { symbol, call } => {
                slot.link_for()?.execute(&assign_call(&symbol, &call))?;
                Ok(Value::Null)
            }
            Operation::LoadTable {
                symbol,
                table,
                variables,
            } => {
                let link = slot.link_for()?;
                let tables = link.execute(catalog::LIST_TABLES)?.as_strings()?;
                if !tables.iter().any(|name| *name == table) {
                    return Err(Error::new(ErrorKind::NotFound)
                        .with_message(format!("table '{table}' not found")));
                }
                let call = catalog::load_table_call(&table, &variables);
                link.execute(&assign_call(&symbol, &call))?;
                Ok(Value::Null)
            }
            Operation::SaveWorkspace { path } => {
                let link = slot.link_for()?;
                link.execute(&save_image_call())?;
                let bytes = link.read_file(WORKSPACE_FILE);
                let _ = link.execute(&unlink_call());
                store.save(&path, &bytes?)?;
                Ok(Value::Null)
            }
            Operation::LoadWorkspace { path } => {
                let bytes = store.load(&path)?;
                load_into(slot.link_for()?, &bytes, GLOBAL_ENV)?;
                Ok(Value::Null)
            }
            Operation::LoadTables { paths } => {
                let workspaces = paths
                    .iter()
                    .map(|path| store.load(path))
                    .collect::<Result<Vec<_>, _>>()?;
                let link = slot.link_for()?;
                link.execute(&ensure_table_env_call())?;
                for bytes in &workspaces {
                    load_into(link, bytes, TABLE_ENV)?;
                }
                Ok(Value::Null)
            }
            Operation::RemoveWorkspace { path } => {
                store.delete(&path)?;
                Ok(Value::Null)
            }
            Operation::Packages => {
                let value = slot.link_for()?.execute(packages::PACKAGES_CALL)?;
                Ok(Value::Strings(value.as_strings()?))
            }
            Operation::InstallPackage { filename, bytes } => {
                let link = slot.link_for()?;
                link.write_file(&filename, &bytes)?;
                let installed = link.execute(&packages::install_call(&filename));
                let _ = link.execute(&packages::remove_file_call(&filename));
                installed?;
                tracing::info!(
                    package = %packages::package_name_from_filename(&filename),
                    filename = %filename,
                    "installed package"
                );
                Ok(Value::Null)
            }
        }
    }
}

fn load_into(link: &mut dyn InterpreterLink, bytes: &[u8], environment: &str) -> Result<(), Error> {
    link.write_file(WORKSPACE_FILE, bytes)?;
    let loaded = link.execute(&load_call(environment));
    let _ = link.execute(&unlink_call());
    loaded.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::{Operation, assign_call, ensure_table_env_call, load_call, serialize_call};
    use crate::core::command::CommandKind;

    #[test]
    fn call_shapes() {
        assert_eq!(
            assign_call("E", "dsBase::meanDS(D$age)"),
            "base::assign('E', value = {dsBase::meanDS(D$age)})"
        );
        assert_eq!(
            serialize_call("dsBase::meanDS(D$age)"),
            "try(base::serialize({dsBase::meanDS(D$age)}, NULL))"
        );
        assert_eq!(load_call(".DSTableEnv"), "base::load(file = '.RData', envir = .DSTableEnv)");
        assert!(ensure_table_env_call().contains("base::new.env()"));
    }

    #[test]
    fn descriptions_and_kinds() {
        let op = Operation::LoadTables {
            paths: vec!["DIABETES/patient.RData".into(), "LIFECYCLE/core.RData".into()],
        };
        assert_eq!(op.kind(), CommandKind::LoadTables);
        assert_eq!(op.describe(), "load tables DIABETES/patient.RData, LIFECYCLE/core.RData");
        let op = Operation::Assign {
            symbol: "D".into(),
            call: "x".into(),
        };
        assert_eq!(op.describe(), "base::assign('D', value = {x})");
        let op = Operation::LoadTable {
            symbol: "D".into(),
            table: "patient".into(),
            variables: vec!["age".into()],
        };
        assert_eq!(op.kind(), CommandKind::Assign);
        assert_eq!(
            op.describe(),
            "base::assign('D', value = {base::local(patient[,c(\"age\")], envir = .DSTableEnv)})"
        );
    }
}
