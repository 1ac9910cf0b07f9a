//! Purpose: Package listing and installation call shapes.
//! Exports: `Package`, `parse_listing`, `package_name_from_filename`, `install_call`, `remove_file_call`, `PACKAGES_CALL`.
//! Role: Adapters used by the `Packages` and `InstallPackage` operations.
//! Invariants: The listing call yields one tab-separated `name version built libpath` row per package.

use serde::Serialize;

use crate::core::error::{Error, ErrorKind};

pub const PACKAGES_CALL: &str = "base::local({ p <- utils::installed.packages(fields = 'Built'); \
base::paste(p[, 'Package'], p[, 'Version'], p[, 'Built'], p[, 'LibPath'], sep = '\\t') })";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub name: String,
    pub version: String,
    pub built: String,
    pub lib_path: String,
}

pub fn parse_listing(rows: &[String]) -> Result<Vec<Package>, Error> {
    rows.iter()
        .map(|row| {
            let mut fields = row.split('\t');
            match (fields.next(), fields.next(), fields.next(), fields.next()) {
                (Some(name), Some(version), Some(built), Some(lib_path)) if !name.is_empty() => {
                    Ok(Package {
                        name: name.to_string(),
                        version: version.to_string(),
                        built: built.to_string(),
                        lib_path: lib_path.to_string(),
                    })
                }
                _ => Err(Error::new(ErrorKind::Execution)
                    .with_message(format!("malformed package listing row '{row}'"))),
            }
        })
        .collect()
}

/// `hello_world_1.2.0.tar.gz` -> `hello_world`: everything before the last underscore.
pub fn package_name_from_filename(filename: &str) -> String {
    match filename.rfind('_') {
        Some(idx) if idx > 0 => filename[..idx].to_string(),
        _ => filename
            .split('.')
            .next()
            .unwrap_or(filename)
            .to_string(),
    }
}

pub fn install_call(filename: &str) -> String {
    format!("remotes::install_local('{filename}', dependencies = FALSE, upgrade = FALSE)")
}

pub fn remove_file_call(filename: &str) -> String {
    format!("base::file.remove('{filename}')")
}
