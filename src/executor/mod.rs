pub mod functions;
pub mod program;
pub mod rowset;
pub mod sorter;
pub mod vm;
