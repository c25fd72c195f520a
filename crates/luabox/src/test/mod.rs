pub mod test_sandbox;
pub mod test_table_proxy;
