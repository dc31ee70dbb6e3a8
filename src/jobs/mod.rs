pub mod summary_rollup;
pub mod till_date_snapshot;
