pub mod daily_check;
pub mod mint_job;
pub mod purchase_job;
pub mod scheduler;
pub mod store;
pub mod worker;
