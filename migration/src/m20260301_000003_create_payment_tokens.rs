use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(PaymentTokens::Table)
                    .if_not_exists()
                    .col(string(PaymentTokens::TokenId).primary_key())
                    .col(decimal_len(PaymentTokens::TotalSupply, 30, 8).default(0))
                    .col(integer(PaymentTokens::Decimals))
                    .col(
                        timestamp_with_time_zone(PaymentTokens::UpdatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(PaymentTokens::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum PaymentTokens {
    Table,
    TokenId,
    TotalSupply,
    Decimals,
    UpdatedAt,
}
