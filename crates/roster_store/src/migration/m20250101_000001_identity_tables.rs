use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::DatabaseBackend;

use crate::db::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let backend = manager.get_database_backend();

        manager
            .create_table(
                Table::create()
                    .table(Uidentities::Table)
                    .if_not_exists()
                    .col(uuid_col(Uidentities::Uuid).primary_key())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Profiles::Table)
                    .if_not_exists()
                    .col(uuid_col(Profiles::Uuid).primary_key())
                    .col(ColumnDef::new(Profiles::Name).string().null())
                    .col(ColumnDef::new(Profiles::Email).string().null())
                    .col(ColumnDef::new(Profiles::IsBot).boolean().null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Identities::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Identities::Id)
                            .string_len(128)
                            .not_null()
                            .primary_key(),
                    )
                    .col(uuid_col(Identities::Uuid))
                    .col(ColumnDef::new(Identities::Name).string().null())
                    .col(ColumnDef::new(Identities::Email).string().null())
                    .col(ColumnDef::new(Identities::Username).string().null())
                    .col(ColumnDef::new(Identities::Source).string_len(32).not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_identities_uuid")
                    .table(Identities::Table)
                    .col(Identities::Uuid)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Organizations::Table)
                    .if_not_exists()
                    .col(serial_col(backend, Organizations::Id))
                    .col(
                        ColumnDef::new(Organizations::Name)
                            .string_len(191)
                            .not_null()
                            .unique_key(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Enrollments::Table)
                    .if_not_exists()
                    .col(serial_col(backend, Enrollments::Id))
                    .col(uuid_col(Enrollments::Uuid))
                    .col(
                        ColumnDef::new(Enrollments::OrganizationId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Enrollments::Start).date_time().not_null())
                    .col(ColumnDef::new(Enrollments::End).date_time().not_null())
                    .col(ColumnDef::new(Enrollments::ProjectSlug).string_len(128).null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_enrollments_uuid")
                    .table(Enrollments::Table)
                    .col(Enrollments::Uuid)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Enrollments::Table).if_exists().to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Organizations::Table).if_exists().to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Identities::Table).if_exists().to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Profiles::Table).if_exists().to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Uidentities::Table).if_exists().to_owned())
            .await?;
        Ok(())
    }
}

fn uuid_col(col: impl Iden + 'static) -> ColumnDef {
    ColumnDef::new(col).string_len(128).not_null().to_owned()
}

/// Auto-increment key: SQLite only allows AUTOINCREMENT on `integer`.
fn serial_col(backend: DatabaseBackend, col: impl Iden + 'static) -> ColumnDef {
    let mut col_def = ColumnDef::new(col);
    match backend {
        DatabaseBackend::Sqlite => {
            col_def.integer();
        }
        _ => {
            col_def.big_integer();
        }
    }
    col_def
        .not_null()
        .auto_increment()
        .primary_key()
        .to_owned()
}
