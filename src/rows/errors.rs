use thiserror::Error;

use crate::codec::{RowId, TableId};

#[derive(Debug, Error)]
pub enum RowError {
    #[error("DURALOG_ROW_STORAGE: table {table} row {record}: {message}")]
    Storage {
        table: TableId,
        record: RowId,
        message: String,
    },

    #[error("DURALOG_ROW_BAD_IMAGE: {0}")]
    BadImage(&'static str),
}

impl RowError {
    pub fn storage(table: TableId, record: RowId, message: impl Into<String>) -> Self {
        RowError::Storage {
            table,
            record,
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RowError::Storage { .. } => "DURALOG_ROW_STORAGE",
            RowError::BadImage(_) => "DURALOG_ROW_BAD_IMAGE",
        }
    }
}

pub type RowResult<T> = Result<T, RowError>;
