pub mod sql_escape;
