use sea_orm::DatabaseBackend;
use sea_orm_migration::prelude::*;

/// Entity tables, link tables and PostGIS.
///
/// Integer codes (`encodingtype`, `observationtype`) are stored as BIGINT and
/// mapped to their public values by the query layer.
#[derive(DeriveMigrationName)]
pub struct Migration;

fn id() -> ColumnDef {
    ColumnDef::new(Alias::new("id"))
        .big_integer()
        .not_null()
        .auto_increment()
        .primary_key()
        .to_owned()
}

fn text(name: &str) -> ColumnDef {
    ColumnDef::new(Alias::new(name)).text().null().to_owned()
}

fn code(name: &str) -> ColumnDef {
    ColumnDef::new(Alias::new(name))
        .big_integer()
        .not_null()
        .default(0)
        .to_owned()
}

fn reference(name: &str) -> ColumnDef {
    ColumnDef::new(Alias::new(name)).big_integer().not_null().to_owned()
}

fn jsonb(name: &str) -> ColumnDef {
    ColumnDef::new(Alias::new(name)).json_binary().null().to_owned()
}

fn geometry(name: &str) -> ColumnDef {
    ColumnDef::new(Alias::new(name))
        .custom(Alias::new("geometry"))
        .null()
        .to_owned()
}

fn foreign_key(table: &str, column: &str, target: &str) -> ForeignKeyCreateStatement {
    ForeignKey::create()
        .name(format!("fk_{}_{}", table, column))
        .from(Alias::new(table), Alias::new(column))
        .to(Alias::new(target), Alias::new("id"))
        .on_delete(ForeignKeyAction::Cascade)
        .to_owned()
}

const TABLES: &[&str] = &[
    "location_to_historicallocation",
    "thing_to_location",
    "observation",
    "featureofinterest",
    "datastream",
    "observedproperty",
    "sensor",
    "historicallocation",
    "location",
    "thing",
];

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        if manager.get_database_backend() == DatabaseBackend::Postgres {
            manager
                .get_connection()
                .execute_unprepared("CREATE EXTENSION IF NOT EXISTS postgis SCHEMA public")
                .await?;
        }

        manager
            .create_table(
                Table::create()
                    .table(Alias::new("thing"))
                    .if_not_exists()
                    .col(id())
                    .col(text("name"))
                    .col(text("description"))
                    .col(jsonb("properties"))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Alias::new("location"))
                    .if_not_exists()
                    .col(id())
                    .col(text("name"))
                    .col(text("description"))
                    .col(code("encodingtype"))
                    .col(geometry("location"))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Alias::new("historicallocation"))
                    .if_not_exists()
                    .col(id())
                    .col(
                        ColumnDef::new(Alias::new("time"))
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(reference("thing_id"))
                    .foreign_key(&mut foreign_key("historicallocation", "thing_id", "thing"))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Alias::new("sensor"))
                    .if_not_exists()
                    .col(id())
                    .col(text("name"))
                    .col(text("description"))
                    .col(code("encodingtype"))
                    .col(text("metadata"))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Alias::new("observedproperty"))
                    .if_not_exists()
                    .col(id())
                    .col(text("name"))
                    .col(text("definition"))
                    .col(text("description"))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Alias::new("datastream"))
                    .if_not_exists()
                    .col(id())
                    .col(text("name"))
                    .col(text("description"))
                    .col(jsonb("unitofmeasurement"))
                    .col(code("observationtype"))
                    .col(geometry("observedarea"))
                    .col(text("phenomenontime"))
                    .col(text("resulttime"))
                    .col(reference("thing_id"))
                    .col(reference("sensor_id"))
                    .col(reference("observedproperty_id"))
                    .foreign_key(&mut foreign_key("datastream", "thing_id", "thing"))
                    .foreign_key(&mut foreign_key("datastream", "sensor_id", "sensor"))
                    .foreign_key(&mut foreign_key(
                        "datastream",
                        "observedproperty_id",
                        "observedproperty",
                    ))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Alias::new("featureofinterest"))
                    .if_not_exists()
                    .col(id())
                    .col(text("name"))
                    .col(text("description"))
                    .col(code("encodingtype"))
                    .col(geometry("feature"))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Alias::new("observation"))
                    .if_not_exists()
                    .col(id())
                    .col(
                        ColumnDef::new(Alias::new("data"))
                            .json_binary()
                            .not_null()
                            .default(Expr::cust("'{}'::jsonb")),
                    )
                    .col(reference("stream_id"))
                    .col(reference("featureofinterest_id"))
                    .foreign_key(&mut foreign_key("observation", "stream_id", "datastream"))
                    .foreign_key(&mut foreign_key(
                        "observation",
                        "featureofinterest_id",
                        "featureofinterest",
                    ))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Alias::new("thing_to_location"))
                    .if_not_exists()
                    .col(reference("thing_id"))
                    .col(reference("location_id"))
                    .primary_key(
                        Index::create()
                            .col(Alias::new("thing_id"))
                            .col(Alias::new("location_id")),
                    )
                    .foreign_key(&mut foreign_key("thing_to_location", "thing_id", "thing"))
                    .foreign_key(&mut foreign_key(
                        "thing_to_location",
                        "location_id",
                        "location",
                    ))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Alias::new("location_to_historicallocation"))
                    .if_not_exists()
                    .col(reference("location_id"))
                    .col(reference("historicallocation_id"))
                    .primary_key(
                        Index::create()
                            .col(Alias::new("location_id"))
                            .col(Alias::new("historicallocation_id")),
                    )
                    .foreign_key(&mut foreign_key(
                        "location_to_historicallocation",
                        "location_id",
                        "location",
                    ))
                    .foreign_key(&mut foreign_key(
                        "location_to_historicallocation",
                        "historicallocation_id",
                        "historicallocation",
                    ))
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for table in TABLES {
            manager
                .drop_table(
                    Table::drop()
                        .table(Alias::new(*table))
                        .if_exists()
                        .to_owned(),
                )
                .await?;
        }
        Ok(())
    }
}
