//! `{{variable}}` templating over JSON values

mod substitution;

pub use substitution::{merge_variables, render_str, render_value, substitute_variables, Rendered};

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Template variables must be an object")]
    VariablesNotObject,
}
