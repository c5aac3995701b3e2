pub mod access;
pub mod compiler;
pub mod ddl;
pub mod dml;
pub mod expression;
pub mod parser;
pub mod scope;
pub mod select;
pub mod types;
