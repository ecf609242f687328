pub use sea_orm_migration::prelude::*;

mod m20260301_000001_create_collateral_records;
mod m20260301_000002_create_ledger_accounts;
mod m20260301_000003_create_payment_tokens;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260301_000001_create_collateral_records::Migration),
            Box::new(m20260301_000002_create_ledger_accounts::Migration),
            Box::new(m20260301_000003_create_payment_tokens::Migration),
        ]
    }
}
