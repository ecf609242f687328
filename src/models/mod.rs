pub mod collateral;
pub mod job;
pub mod ledger;
pub mod mint;
pub mod progress;
pub mod purchase;
