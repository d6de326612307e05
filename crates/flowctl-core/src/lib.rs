//! Core data model and algorithms for the flowctl pipeline engine: the
//! stage/connection document model, path and locator resolution, template
//! rendering, and the shared error enum. No embedded SQL engine dependency
//! lives here; that's `flowctl-sql`.

pub mod error;
pub mod model;
pub mod path;
pub mod renderer;

pub use error::{FlowError, Result};
pub use model::{
    Column, Columns, Connection, ConnectionConfiguration, FlowContext, Stage, StageKind, Stages,
    Variables, LOOP_CONTROL,
};
pub use path::{rewrite_locators, Locator, Path};
pub use renderer::Renderer;
