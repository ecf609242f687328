use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(LedgerAccounts::Table)
                    .if_not_exists()
                    .col(pk_auto(LedgerAccounts::Id))
                    .col(string_uniq(LedgerAccounts::UserId))
                    .col(string_uniq(LedgerAccounts::LedgerAccountId))
                    .col(string(LedgerAccounts::KeyRef))
                    .col(decimal_len(LedgerAccounts::Balance, 20, 8).default(0))
                    .col(
                        timestamp_with_time_zone(LedgerAccounts::UpdatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(LedgerAccounts::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum LedgerAccounts {
    Table,
    Id,
    UserId,
    LedgerAccountId,
    KeyRef,
    Balance,
    UpdatedAt,
}
