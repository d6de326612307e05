pub mod file;
pub mod llm;
pub mod rest;
pub mod rowdb;
pub mod table_format;
pub mod warehouse;

pub use file::{connection_to_file_connector, FileConnector, VariableConnector};
pub use llm::LlmSqlGeneratorConnector;
pub use rest::RestConnector;
pub use rowdb::RowDbConnector;
pub use table_format::TableFormatConnector;
pub use warehouse::WarehouseConnector;
