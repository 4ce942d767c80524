pub mod context;
pub mod error;
pub mod expression;
pub mod lazy;
pub mod operators;
pub mod path;
pub mod pipeline;
pub mod predicates;
pub mod query;
pub mod sort;
pub mod update;
pub mod value;
pub mod window;

pub use context::{Collation, Context, Operator, OperatorCategory, Options};
pub use error::{Error, Result};
pub use expression::{compute_value, Env, Expression};
pub use lazy::Lazy;
pub use pipeline::{aggregate, Pipeline};
pub use query::Query;
pub use update::apply_update;
pub use value::{Document, Value};

/// Compile `criteria` into a reusable [`Query`].
pub fn query(criteria: &Value, options: &Options) -> Result<Query> {
    Query::new(criteria, options)
}
