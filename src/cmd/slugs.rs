//! Slug commands against the configured database: `resolve`, `allocate`,
//! `backfill`.

use anyhow::{Context, Result, bail};
use tracing::info;

use agency::board::db::AgencyDb;
use agency::board::models::EntityKind;
use agency::board::server;
use agency::config::AgencyConfig;

fn open_db(config: &AgencyConfig) -> Result<AgencyDb> {
    server::open_database(&config.server_config())
}

fn parse_kind(raw: &str) -> Result<EntityKind> {
    raw.parse::<EntityKind>().map_err(anyhow::Error::msg)
}

pub fn cmd_resolve(config: &AgencyConfig, slug: &str, kind: Option<&str>) -> Result<()> {
    let hint = kind.map(parse_kind).transpose()?;
    let db = open_db(config)?;
    match db.resolve_slug(slug, hint)? {
        Some(target) => {
            info!(kind = %target.kind(), slug = target.slug().unwrap_or_default(), "resolved slug");
            let json = serde_json::to_string_pretty(&target).context("Failed to render entity")?;
            println!("{}", json);
            Ok(())
        }
        None => bail!("No entity with slug {}", slug.trim()),
    }
}

pub fn cmd_allocate(config: &AgencyConfig, kind: &str, entity_id: i64) -> Result<()> {
    let kind = parse_kind(kind)?;
    let db = open_db(config)?;
    let slug = db.allocate_slug(kind, entity_id)?;
    println!("{}", slug);
    Ok(())
}

pub fn cmd_backfill(config: &AgencyConfig) -> Result<()> {
    let db = open_db(config)?;
    let report = db.backfill_slugs()?;

    println!(
        "Scanned {} slug-less entities: {} assigned, {} failed",
        report.scanned,
        report.assigned.len(),
        report.failed.len()
    );
    for slug in &report.assigned {
        println!("  + {}", slug);
    }
    for failure in &report.failed {
        println!("  ! {} {}: {}", failure.kind, failure.entity_id, failure.error);
    }
    if !report.failed.is_empty() {
        bail!("{} entities could not be assigned a slug", report.failed.len());
    }
    Ok(())
}
