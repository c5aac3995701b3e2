mod btree_test;
mod pager_test;
