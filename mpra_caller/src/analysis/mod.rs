pub mod rank_tests;
pub mod qvalue;
pub mod activity;
pub mod differential;
pub mod reproducibility;
