//! Connector implementations: File/Object, Table-format, Warehouse,
//! Row-DB, REST and the LLM SQL Generator, plus the shared
//! `Connector`/`ConnectorBase` contract they're built on.

pub mod base;
pub mod connectors;

pub use base::{Connector, ConnectorBase};

use flowctl_core::model::Connection;
use flowctl_core::{FlowError, Result};

/// Builds the concrete connector for a stage's declared connection. The
/// scheduler owns stage dispatch (source/tap/sink/etc.); this only
/// resolves "which connector implements this connection kind".
pub fn connector_for(stage_name: &str, connection: Connection) -> Result<Box<dyn Connector>> {
    if let Some(file_connector) = connectors::connection_to_file_connector(stage_name, &connection) {
        return Ok(Box::new(file_connector));
    }
    match connection {
        Connection::Deltatable(c) => Ok(Box::new(connectors::TableFormatConnector::new(stage_name, c)?)),
        Connection::Clickhouse(c) => Ok(Box::new(connectors::RowDbConnector::new(stage_name, c)?)),
        Connection::BigQuery(c) => Ok(Box::new(connectors::WarehouseConnector::new(stage_name, c))),
        Connection::Variable(c) => Ok(Box::new(connectors::file::VariableConnector::new(c))),
        Connection::Rest(c) => Ok(Box::new(connectors::RestConnector::new(c)?)),
        Connection::SqlGen(c) => Ok(Box::new(connectors::LlmSqlGeneratorConnector::new(c)?)),
        Connection::Custom(c) => Err(FlowError::Configuration(format!(
            "custom connection module '{}' class '{}' has no registered implementation",
            c.module, c.classname
        ))),
        Connection::Parquet(_) | Connection::Json(_) | Connection::Csv(_) | Connection::File(_) => {
            unreachable!("handled by connection_to_file_connector above")
        }
    }
}
