pub mod attendance;
pub mod backup_exchange;
pub mod core;
pub mod dashboard;
pub mod exams;
pub mod fees;
pub mod performance;
pub mod setup;
pub mod students;
pub mod taxonomy;
