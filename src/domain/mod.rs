pub mod models;
pub mod schema;

pub use models::*;
pub use schema::{FieldDefinition, FieldGroup, FieldType};
