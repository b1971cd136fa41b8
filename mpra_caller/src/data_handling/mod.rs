pub mod annotations;
pub mod count_table;
