//! Storage adapters: the xlsx workbook pair and the SQLite store.

pub mod database;
pub mod excel_read;
pub mod excel_write;
