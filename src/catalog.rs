// Table and symbol rules layered over the engine. Listings run as ordinary
// evaluate commands, so they also become the session's last command.
use crate::core::command::CommandHandle;
use crate::core::error::Error;
use crate::core::validate::validate_symbol;
use crate::engine::CommandEngine;
use crate::ops::TABLE_ENV;
use crate::session::SessionKey;

pub const LIST_TABLES: &str = "base::local(base::ls(.DSTableEnv))";
pub const LIST_SYMBOLS: &str = "base::ls()";

pub fn remove_symbol_call(symbol: &str) -> String {
    format!("base::rm({symbol})")
}

/// `base::local(T, envir = .DSTableEnv)`, or `T[,c("a","b")]` when a column subset is asked for.
pub fn load_table_call(table: &str, variables: &[String]) -> String {
    if variables.is_empty() {
        format!("base::local({table}, envir = {TABLE_ENV})")
    } else {
        let columns = variables
            .iter()
            .map(|variable| format!("\"{variable}\""))
            .collect::<Vec<_>>()
            .join(",");
        format!("base::local({table}[,c({columns})], envir = {TABLE_ENV})")
    }
}

async fn evaluate_strings(engine: &CommandEngine, key: &SessionKey, call: &str) -> Result<Vec<String>, Error> {
    let handle = engine.evaluate(key, call)?;
    let value = handle.wait().await.map_err(Error::from)?;
    value.as_strings()
}

pub async fn list_tables(engine: &CommandEngine, key: &SessionKey) -> Result<Vec<String>, Error> {
    evaluate_strings(engine, key, LIST_TABLES).await
}

pub async fn table_exists(engine: &CommandEngine, key: &SessionKey, table: &str) -> Result<bool, Error> {
    Ok(list_tables(engine, key).await?.iter().any(|name| name == table))
}

pub async fn list_symbols(engine: &CommandEngine, key: &SessionKey) -> Result<Vec<String>, Error> {
    evaluate_strings(engine, key, LIST_SYMBOLS).await
}

pub fn remove_symbol(engine: &CommandEngine, key: &SessionKey, symbol: &str) -> Result<CommandHandle, Error> {
    validate_symbol("symbol", symbol)?;
    engine.evaluate(key, remove_symbol_call(symbol))
}

/// Binds `symbol` to a loaded table (optionally a column subset). The command fails with
/// `NotFound` when the table is not loaded; the check runs in the same job as the assign.
pub fn load_table(
    engine: &CommandEngine,
    key: &SessionKey,
    symbol: &str,
    table: &str,
    variables: &[String],
) -> Result<CommandHandle, Error> {
    engine.load_table(key, symbol, table, variables.to_vec())
}
