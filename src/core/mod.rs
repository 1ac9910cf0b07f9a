// Core data model: errors, values, commands and boundary validation.
pub mod command;
pub mod error;
pub mod validate;
pub mod value;
