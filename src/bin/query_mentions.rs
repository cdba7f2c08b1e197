use anyhow::{Context, Result};
use atlas::cache::{AggregateSnapshot, ArticleCache};
use atlas::config::AtlasConfig;
use atlas::db::Database;
use atlas::model::EntityCount;
use atlas::util::{is_valid_bucket, normalize_country};
use clap::{Parser, Subcommand};
use prettytable::{Cell, Row as PrettyRow, Table};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[clap(name = "query-mentions", about = "Inspect hourly country and entity mention counts")]
struct Cli {
    /// Hour bucket (YYYYMMDDHH); defaults to the most recent one with data
    #[clap(short, long, global = true)]
    bucket: Option<String>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List buckets that have rolled-up articles
    Buckets,

    #[clap(flatten)]
    InBucket(BucketCommand),
}

/// Commands that read a single bucket.
#[derive(Subcommand)]
enum BucketCommand {
    /// Articles per country
    Countries,

    /// Most mentioned entities
    Entities {
        /// Number of entities to show (TOP_ENTITIES_LIMIT when omitted)
        #[clap(short, long)]
        limit: Option<i64>,
    },

    /// Most mentioned entities within one country
    CountryEntities {
        /// ISO3 country code
        #[clap(required = true)]
        country: String,

        #[clap(short, long)]
        limit: Option<i64>,
    },

    /// Per-country breakdown of one entity
    EntityCountries {
        /// Entity name or id
        #[clap(required = true)]
        entity: String,
    },

    /// Most recent articles, optionally filtered by country and entity
    Articles {
        #[clap(short, long)]
        country: Option<String>,

        #[clap(short, long)]
        entity: Option<String>,

        /// Page size (ARTICLES_PAGE_SIZE when omitted)
        #[clap(short, long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    atlas::logging::configure_logging();

    let args = Cli::parse();
    let config = AtlasConfig::from_env();
    let db = Database::from_config(&config)
        .await
        .with_context(|| format!("opening database {}", config.database_path))?;

    match args.command {
        Commands::Buckets => list_buckets(&db).await,
        Commands::InBucket(command) => {
            let Some(bucket) = resolve_bucket(&db, args.bucket).await? else {
                println!("No rolled-up articles yet.");
                return Ok(());
            };
            println!("Bucket {}", bucket);
            run_bucket_command(&db, &config, &bucket, command).await
        }
    }
}

async fn run_bucket_command(
    db: &Database,
    config: &AtlasConfig,
    bucket: &str,
    command: BucketCommand,
) -> Result<()> {
    match command {
        BucketCommand::Countries => show_countries(db, bucket).await?,
        BucketCommand::Entities { limit } => {
            let top = db
                .top_entities(bucket, limit.unwrap_or(config.top_entities_limit))
                .await?;
            print_entities(&top);
        }
        BucketCommand::CountryEntities { country, limit } => {
            let country = normalize_country(Some(&country));
            let top = db
                .top_entities_for_country(bucket, &country, limit.unwrap_or(config.top_entities_limit))
                .await?;
            print_entities(&top);
        }
        BucketCommand::EntityCountries { entity } => show_entity_countries(db, bucket, &entity).await?,
        BucketCommand::Articles {
            country,
            entity,
            limit,
        } => {
            let country = country.map(|c| normalize_country(Some(&c)));
            show_articles(
                db,
                config,
                bucket,
                country.as_deref(),
                entity.as_deref(),
                limit.unwrap_or(config.page_size),
            )
            .await?;
        }
    }

    Ok(())
}

async fn resolve_bucket(db: &Database, requested: Option<String>) -> Result<Option<String>> {
    match requested {
        Some(bucket) if is_valid_bucket(&bucket) => Ok(Some(bucket)),
        Some(bucket) => anyhow::bail!("'{}' is not an hour bucket (expected YYYYMMDDHH)", bucket),
        None => Ok(db.list_buckets().await?.pop()),
    }
}

async fn list_buckets(db: &Database) -> Result<()> {
    let mut table = Table::new();
    table.add_row(PrettyRow::new(vec![Cell::new("Bucket"), Cell::new("Articles")]));

    for bucket in db.list_buckets().await? {
        let total: i64 = db.country_totals(&bucket).await?.values().sum();
        table.add_row(PrettyRow::new(vec![
            Cell::new(&bucket),
            Cell::new(&total.to_string()),
        ]));
    }

    table.printstd();
    Ok(())
}

async fn show_countries(db: &Database, bucket: &str) -> Result<()> {
    let mut totals: Vec<(String, i64)> = db.country_totals(bucket).await?.into_iter().collect();
    totals.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut table = Table::new();
    table.add_row(PrettyRow::new(vec![Cell::new("Country"), Cell::new("Articles")]));
    for (country, total) in totals {
        table.add_row(PrettyRow::new(vec![
            Cell::new(&country),
            Cell::new(&total.to_string()),
        ]));
    }

    table.printstd();
    Ok(())
}

fn print_entities(entities: &[EntityCount]) {
    let mut table = Table::new();
    table.add_row(PrettyRow::new(vec![
        Cell::new("#"),
        Cell::new("Entity"),
        Cell::new("Type"),
        Cell::new("Id"),
        Cell::new("Articles"),
    ]));

    for (rank, entity) in entities.iter().enumerate() {
        table.add_row(PrettyRow::new(vec![
            Cell::new(&(rank + 1).to_string()),
            Cell::new(&entity.name),
            Cell::new(&entity.entity_type.to_string()),
            Cell::new(&entity.entity_id),
            Cell::new(&entity.count.to_string()),
        ]));
    }

    table.printstd();
}

async fn show_entity_countries(db: &Database, bucket: &str, entity: &str) -> Result<()> {
    let Some(total) = db.entity_total(bucket, entity).await? else {
        println!("'{}' is not mentioned in this bucket.", entity);
        return Ok(());
    };
    println!(
        "{} ({}): {} articles",
        total.name, total.entity_type, total.count
    );

    let mut table = Table::new();
    table.add_row(PrettyRow::new(vec![Cell::new("Country"), Cell::new("Articles")]));
    for (country, count) in db.country_breakdown_for_entity(bucket, entity).await? {
        table.add_row(PrettyRow::new(vec![
            Cell::new(&country),
            Cell::new(&count.to_string()),
        ]));
    }

    table.printstd();
    Ok(())
}

async fn show_articles(
    db: &Database,
    config: &AtlasConfig,
    bucket: &str,
    country: Option<&str>,
    entity: Option<&str>,
    page_size: usize,
) -> Result<()> {
    let snapshot = AggregateSnapshot::load(db, bucket, entity, config.top_entities_limit).await?;
    let cache = ArticleCache::new(Arc::new(db.clone()), config.cache.clone());

    if let Some(expected) = snapshot.expected_count(country, entity) {
        println!("{} matching articles in total", expected);
    }

    let articles = cache.get(bucket, country, entity, page_size, &snapshot).await?;
    info!("Cache stats: {:?}", cache.stats());

    let mut table = Table::new();
    table.add_row(PrettyRow::new(vec![
        Cell::new("Time"),
        Cell::new("Country"),
        Cell::new("Title"),
        Cell::new("Entities"),
    ]));

    for article in articles {
        let time = article
            .time
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        let entities = article
            .entities
            .iter()
            .map(|e| e.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        table.add_row(PrettyRow::new(vec![
            Cell::new(&time),
            Cell::new(&article.country),
            Cell::new(&article.title),
            Cell::new(&entities),
        ]));
    }

    table.printstd();
    Ok(())
}
