use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

/// Columns lateral branches correlate on.
const INDEXES: &[(&str, &str)] = &[
    ("historicallocation", "thing_id"),
    ("datastream", "thing_id"),
    ("datastream", "sensor_id"),
    ("datastream", "observedproperty_id"),
    ("observation", "stream_id"),
    ("observation", "featureofinterest_id"),
    ("thing_to_location", "location_id"),
    ("location_to_historicallocation", "historicallocation_id"),
];

fn index_name(table: &str, column: &str) -> String {
    format!("idx_{}_{}", table, column)
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for (table, column) in INDEXES {
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name(index_name(table, column))
                        .table(Alias::new(*table))
                        .col(Alias::new(*column))
                        .to_owned(),
                )
                .await?;
        }
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for (table, column) in INDEXES {
            manager
                .drop_index(
                    Index::drop()
                        .if_exists()
                        .name(index_name(table, column))
                        .table(Alias::new(*table))
                        .to_owned(),
                )
                .await?;
        }
        Ok(())
    }
}
