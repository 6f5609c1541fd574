//! Migration to create the webhook subscription tables.
//!
//! `webhook_subscriptions` holds one registered endpoint per row; the subscribed
//! event types live in `webhook_subscription_events` so that dispatch can resolve
//! matching endpoints through a `(tenant_id, event_type)` index.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(WebhookSubscriptions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(WebhookSubscriptions::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(WebhookSubscriptions::TenantId).uuid().not_null())
                    .col(ColumnDef::new(WebhookSubscriptions::Name).text().null())
                    .col(ColumnDef::new(WebhookSubscriptions::TargetUrl).text().not_null())
                    .col(
                        ColumnDef::new(WebhookSubscriptions::SecretHash)
                            .string_len(64)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WebhookSubscriptions::Active)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(ColumnDef::new(WebhookSubscriptions::Metadata).json_binary().null())
                    .col(
                        ColumnDef::new(WebhookSubscriptions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(WebhookSubscriptions::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_webhook_subscriptions_tenant_created")
                    .table(WebhookSubscriptions::Table)
                    .col(WebhookSubscriptions::TenantId)
                    .col(WebhookSubscriptions::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(WebhookSubscriptionEvents::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(WebhookSubscriptionEvents::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(WebhookSubscriptionEvents::SubscriptionId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WebhookSubscriptionEvents::TenantId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WebhookSubscriptionEvents::EventType)
                            .string_len(100)
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_webhook_subscription_events_subscription_id")
                            .from(
                                WebhookSubscriptionEvents::Table,
                                WebhookSubscriptionEvents::SubscriptionId,
                            )
                            .to(WebhookSubscriptions::Table, WebhookSubscriptions::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_webhook_subscription_events_unique")
                    .table(WebhookSubscriptionEvents::Table)
                    .col(WebhookSubscriptionEvents::SubscriptionId)
                    .col(WebhookSubscriptionEvents::EventType)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Hot path for dispatch: tenant + event type lookup
        manager
            .create_index(
                Index::create()
                    .name("idx_webhook_subscription_events_tenant_event")
                    .table(WebhookSubscriptionEvents::Table)
                    .col(WebhookSubscriptionEvents::TenantId)
                    .col(WebhookSubscriptionEvents::EventType)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(
                Table::drop()
                    .table(WebhookSubscriptionEvents::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(WebhookSubscriptions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(crate) enum WebhookSubscriptions {
    Table,
    Id,
    TenantId,
    Name,
    TargetUrl,
    SecretHash,
    Active,
    Metadata,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum WebhookSubscriptionEvents {
    Table,
    Id,
    SubscriptionId,
    TenantId,
    EventType,
}
