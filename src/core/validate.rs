// Boundary validation for names that end up inside interpreter calls or store paths.
// Everything here runs before a command is created; failures are Usage errors (HTTP 400).
use crate::core::error::{Error, ErrorKind};

const WORKSPACE_ID_MESSAGE: &str = "Please use only letters, numbers, dashes or underscores";

/// User ids and profile names.
pub fn validate_identifier(label: &str, value: &str) -> Result<(), Error> {
    let valid = !value.is_empty()
        && value.len() <= 128
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
        && !value.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(Error::new(ErrorKind::Usage).with_message(format!("invalid {label}: '{value}'")))
    }
}

pub fn validate_workspace_id(operation: &str, id: &str) -> Result<(), Error> {
    if is_workspace_segment(id) {
        Ok(())
    } else {
        Err(Error::new(ErrorKind::Usage).with_message(format!("{operation}.id: {WORKSPACE_ID_MESSAGE}")))
    }
}

/// `<project>/<object>` references used when loading workspaces as tables.
pub fn validate_object_path(operation: &str, path: &str) -> Result<(), Error> {
    let mut parts = path.split('/');
    let valid = match (parts.next(), parts.next(), parts.next()) {
        (Some(project), Some(object), None) => {
            is_workspace_segment(project) && is_workspace_segment(object)
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::new(ErrorKind::Usage)
            .with_message(format!("{operation}.workspace: expected <project>/<object>, got '{path}'"))
            .with_hint(WORKSPACE_ID_MESSAGE))
    }
}

/// Symbol, table and column names: a letter or dot first, then letters, digits, dots or underscores.
pub fn validate_symbol(label: &str, name: &str) -> Result<(), Error> {
    if is_symbol(name) {
        Ok(())
    } else {
        Err(Error::new(ErrorKind::Usage).with_message(format!("invalid {label} name: '{name}'")))
    }
}

pub fn validate_package_filename(filename: &str) -> Result<(), Error> {
    let valid = !filename.is_empty()
        && !filename.starts_with('.')
        && filename
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::new(ErrorKind::Usage)
            .with_message(format!("invalid package filename: '{filename}'"))
            .with_hint("Upload a source package archive such as mypkg_1.0.0.tar.gz."))
    }
}

fn is_workspace_segment(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub(crate) fn is_symbol(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_alphabetic() || first == '.') {
        return false;
    }
    if first == '.' && name.chars().nth(1).is_some_and(|c| c.is_ascii_digit()) {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_')
}
