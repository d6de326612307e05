//! Embedded analytical SQL runtime adapter (wraps `datafusion`) and the
//! versioned-read ranking transformer.

pub mod adapter;
pub mod macros;
pub mod ranking;

pub use adapter::{Relation, SqlAdapter};
pub use ranking::{build_ranked_query, validate_simple_query};
