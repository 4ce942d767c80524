use thiserror::Error;

use crate::context::OperatorCategory;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    #[error("unknown {category} operator: {name}")]
    UnknownOperator {
        category: OperatorCategory,
        name: String,
    },

    #[error("use of undefined variable: $${0}")]
    UndefinedVariable(String),

    #[error("{operator}: {message}")]
    Evaluation { operator: String, message: String },

    #[error("invalid regex: {0}")]
    Regex(#[from] regex::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("document must be an object")]
    NotAnObject,
}

impl Error {
    /// Runtime failure raised by an operator body against a specific document.
    pub fn evaluation(operator: &str, message: impl Into<String>) -> Self {
        Error::Evaluation {
            operator: operator.to_string(),
            message: message.into(),
        }
    }

    pub fn unknown_operator(category: OperatorCategory, name: &str) -> Self {
        Error::UnknownOperator {
            category,
            name: name.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
