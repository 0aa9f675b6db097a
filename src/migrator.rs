use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250101_000001_create_warehouses_table::Migration),
            Box::new(m20250101_000002_create_products_table::Migration),
            Box::new(m20250101_000003_create_stock_records_table::Migration),
            Box::new(m20250101_000004_create_stock_movements_table::Migration),
        ]
    }
}

#[derive(DeriveIden)]
enum Warehouses {
    Table,
    Id,
    Name,
    Code,
    Country,
    City,
    Address,
    Phone,
    Email,
    IsActive,
    IsDefault,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Products {
    Table,
    Id,
    Sku,
    Name,
    Slug,
    StockQuantity,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum StockRecords {
    Table,
    Id,
    WarehouseId,
    ProductId,
    Quantity,
    LowStockThreshold,
    LastRestockedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum StockMovements {
    Table,
    Id,
    WarehouseId,
    ProductId,
    MovementType,
    Quantity,
    Direction,
    ReferenceType,
    ReferenceId,
    Reason,
    Notes,
    PerformedBy,
    CreatedAt,
}

mod m20250101_000001_create_warehouses_table {
    use super::Warehouses;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000001_create_warehouses_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Warehouses::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Warehouses::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Warehouses::Name).string_len(200).not_null())
                        .col(
                            ColumnDef::new(Warehouses::Code)
                                .string_len(50)
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Warehouses::Country).string_len(100).not_null())
                        .col(ColumnDef::new(Warehouses::City).string_len(100).not_null())
                        .col(ColumnDef::new(Warehouses::Address).text().null())
                        .col(ColumnDef::new(Warehouses::Phone).string_len(50).null())
                        .col(ColumnDef::new(Warehouses::Email).string_len(255).null())
                        .col(
                            ColumnDef::new(Warehouses::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Warehouses::IsDefault)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Warehouses::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Warehouses::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Warehouses::Table).to_owned())
                .await
        }
    }
}

mod m20250101_000002_create_products_table {
    use super::Products;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000002_create_products_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Products::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Products::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(Products::Sku)
                                .string_len(100)
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Products::Name).string_len(255).not_null())
                        .col(ColumnDef::new(Products::Slug).string_len(255).not_null())
                        .col(
                            ColumnDef::new(Products::StockQuantity)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Products::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Products::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Products::Table).to_owned())
                .await
        }
    }
}

mod m20250101_000003_create_stock_records_table {
    use super::{StockRecords, Warehouses};
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000003_create_stock_records_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(StockRecords::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(StockRecords::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(StockRecords::WarehouseId).uuid().not_null())
                        .col(ColumnDef::new(StockRecords::ProductId).uuid().not_null())
                        .col(
                            ColumnDef::new(StockRecords::Quantity)
                                .integer()
                                .not_null()
                                .default(0)
                                .check(Expr::col(StockRecords::Quantity).gte(0)),
                        )
                        .col(
                            ColumnDef::new(StockRecords::LowStockThreshold)
                                .integer()
                                .not_null()
                                .default(10),
                        )
                        .col(
                            ColumnDef::new(StockRecords::LastRestockedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(StockRecords::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockRecords::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_stock_records_warehouse")
                                .from(StockRecords::Table, StockRecords::WarehouseId)
                                .to(Warehouses::Table, Warehouses::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_stock_records_warehouse_product")
                        .table(StockRecords::Table)
                        .col(StockRecords::WarehouseId)
                        .col(StockRecords::ProductId)
                        .unique()
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_stock_records_product")
                        .table(StockRecords::Table)
                        .col(StockRecords::ProductId)
                        .if_not_exists()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(StockRecords::Table).to_owned())
                .await
        }
    }
}

mod m20250101_000004_create_stock_movements_table {
    use super::StockMovements;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000004_create_stock_movements_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            // No foreign keys: the journal outlives the warehouses it mentions.
            manager
                .create_table(
                    Table::create()
                        .table(StockMovements::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(StockMovements::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(StockMovements::WarehouseId).uuid().not_null())
                        .col(ColumnDef::new(StockMovements::ProductId).uuid().not_null())
                        .col(
                            ColumnDef::new(StockMovements::MovementType)
                                .string_len(32)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockMovements::Quantity)
                                .integer()
                                .not_null()
                                .check(Expr::col(StockMovements::Quantity).gt(0)),
                        )
                        .col(
                            ColumnDef::new(StockMovements::Direction)
                                .string_len(8)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockMovements::ReferenceType)
                                .string_len(32)
                                .null(),
                        )
                        .col(ColumnDef::new(StockMovements::ReferenceId).uuid().null())
                        .col(ColumnDef::new(StockMovements::Reason).text().null())
                        .col(ColumnDef::new(StockMovements::Notes).text().null())
                        .col(ColumnDef::new(StockMovements::PerformedBy).uuid().not_null())
                        .col(
                            ColumnDef::new(StockMovements::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            for (name, columns) in [
                (
                    "idx_stock_movements_warehouse_product",
                    vec![StockMovements::WarehouseId, StockMovements::ProductId],
                ),
                ("idx_stock_movements_created_at", vec![StockMovements::CreatedAt]),
                ("idx_stock_movements_reference", vec![StockMovements::ReferenceId]),
            ] {
                let mut index = Index::create();
                index.name(name).table(StockMovements::Table).if_not_exists();
                for column in columns {
                    index.col(column);
                }
                manager.create_index(index.to_owned()).await?;
            }

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(StockMovements::Table).to_owned())
                .await
        }
    }
}
