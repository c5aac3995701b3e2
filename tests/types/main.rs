mod page_test;
mod record_test;
mod row_test;
mod value_test;
