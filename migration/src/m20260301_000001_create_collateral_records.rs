//! Collateral records: one row per tokenized jewelry item

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CollateralRecords::Table)
                    .if_not_exists()
                    .col(string(CollateralRecords::CollateralId).primary_key())
                    .col(string_uniq(CollateralRecords::TokenId))
                    .col(string(CollateralRecords::Name))
                    .col(string(CollateralRecords::BeneficiaryAccountId))
                    .col(decimal_len(CollateralRecords::UnitPrice, 20, 8))
                    .col(json_binary(CollateralRecords::Properties))
                    .col(big_integer(CollateralRecords::MintedUnits).default(0))
                    .col(string(CollateralRecords::Status).default("active"))
                    .col(timestamp_with_time_zone_null(CollateralRecords::ExpiredAt))
                    .col(
                        timestamp_with_time_zone(CollateralRecords::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(CollateralRecords::UpdatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Daily expiry check scans by expiry date
        manager
            .create_index(
                Index::create()
                    .name("idx_collateral_records_expired_at")
                    .table(CollateralRecords::Table)
                    .col(CollateralRecords::ExpiredAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(CollateralRecords::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum CollateralRecords {
    Table,
    CollateralId,
    TokenId,
    Name,
    BeneficiaryAccountId,
    UnitPrice,
    Properties,
    MintedUnits,
    Status,
    ExpiredAt,
    CreatedAt,
    UpdatedAt,
}
