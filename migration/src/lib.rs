//! Database migrations for the webhook delivery service.

pub use sea_orm_migration::prelude::*;

mod m2026_03_02_090000_create_webhook_subscriptions;
mod m2026_03_02_090100_create_webhook_deliveries;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_03_02_090000_create_webhook_subscriptions::Migration),
            Box::new(m2026_03_02_090100_create_webhook_deliveries::Migration),
        ]
    }
}
