use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Workspaces::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Workspaces::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Workspaces::Name).string().not_null())
                    .col(ColumnDef::new(Workspaces::Slug).string().null().unique_key())
                    .col(ColumnDef::new(Workspaces::Status).integer().not_null().default(1))
                    .col(ColumnDef::new(Workspaces::OwnerUserId).big_integer().null())
                    .col(ColumnDef::new(Workspaces::ParentId).big_integer().null())
                    .col(ColumnDef::new(Workspaces::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Workspaces::UpdatedAt).timestamp_with_time_zone().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(WorkspaceUsers::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(WorkspaceUsers::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(WorkspaceUsers::WorkspaceId).big_integer().not_null())
                    .col(ColumnDef::new(WorkspaceUsers::UserId).big_integer().not_null())
                    .col(ColumnDef::new(WorkspaceUsers::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(WorkspaceUsers::UpdatedAt).timestamp_with_time_zone().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_workspace_users_workspace_user")
                    .table(WorkspaceUsers::Table)
                    .col(WorkspaceUsers::WorkspaceId)
                    .col(WorkspaceUsers::UserId)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        for (table, owner) in [
            (Links::WorkspaceModels, Links::WorkspaceId),
            (Links::UserModels, Links::UserId),
        ] {
            manager
                .create_table(
                    Table::create()
                        .table(table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Links::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(owner).big_integer().not_null())
                        .col(ColumnDef::new(Links::ModelType).string().not_null())
                        .col(ColumnDef::new(Links::ModelId).big_integer().not_null())
                        .to_owned(),
                )
                .await?;
        }

        for (name, table) in [
            ("idx_workspace_models_model", Links::WorkspaceModels),
            ("idx_user_models_model", Links::UserModels),
        ] {
            manager
                .create_index(
                    Index::create()
                        .name(name)
                        .table(table)
                        .col(Links::ModelType)
                        .col(Links::ModelId)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;
        }

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Links::UserModels).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Links::WorkspaceModels).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(WorkspaceUsers::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Workspaces::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Workspaces {
    Table,
    Id,
    Name,
    Slug,
    Status,
    OwnerUserId,
    ParentId,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum WorkspaceUsers {
    Table,
    Id,
    WorkspaceId,
    UserId,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden, Clone, Copy)]
enum Links {
    WorkspaceModels,
    UserModels,
    Id,
    WorkspaceId,
    UserId,
    ModelType,
    ModelId,
}
