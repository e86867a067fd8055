//! Manually triggered checks.

use anyhow::{Result, anyhow};
use beacon_config::SystemConfig;
use beacon_core::check::Version;
use beacon_core::resource::Checkable;
use beacon_db::ResourceRepo;

use super::{connect, factory};

pub async fn trigger(
    config: &SystemConfig,
    pipeline: &str,
    name: &str,
    resource_type: bool,
    from_version: Option<Version>,
) -> Result<()> {
    let stores = connect(config).await?;
    let types = stores.resources.resource_types().await?;

    let found = if resource_type {
        stores
            .resources
            .find_resource_type(pipeline, name)
            .await?
            .map(|t| Box::new(t) as Box<dyn Checkable>)
    } else {
        stores
            .resources
            .find_resource(pipeline, name)
            .await?
            .map(|r| Box::new(r) as Box<dyn Checkable>)
    };
    let checkable = found.ok_or_else(|| anyhow!("{}/{} not found", pipeline, name))?;

    let factory = factory(config, &stores);
    match factory
        .try_create_check(checkable.as_ref(), &types, from_version, true)
        .await?
    {
        Some(check) => println!("Created check {}", check.id),
        None => println!("A check for {}/{} is already in progress", pipeline, name),
    }
    Ok(())
}
