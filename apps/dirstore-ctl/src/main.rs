//! dirstore-ctl - Operator CLI for the directory store
//!
//! This CLI enables operators to:
//! - Apply the embedded schema migrations
//! - Check every built-in statement against the server
//! - Look up single entries, optionally with computed `memberOf`
//! - Run scoped, paginated searches and stream the results as JSON lines

use std::io::Write;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use dirstore_core::{DirectoryError, Dn, EntryMapper, OBJECT_CLASS};
use dirstore_db::{
    run_migrations, AllowAll, DbPool, DirectoryService, FilterQuery, Page, PathScope,
    QueryParams, Repository, Requester, SearchRequest, SearchScope,
};
use tracing::info;

mod config;
mod error;
mod logging;

use config::Config;
use error::CliResult;

/// dirstore-ctl - Directory store administration
#[derive(Parser)]
#[command(name = "dirstore-ctl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,

    /// Prepare every built-in statement against the server
    Verify,

    /// Print one entry as JSON
    Get(GetArgs),

    /// Search below a base DN, one JSON entry per line
    Search(SearchArgs),
}

#[derive(Args)]
struct GetArgs {
    /// Distinguished name of the entry
    dn: String,

    /// Include the computed memberOf attribute
    #[arg(long)]
    member_of: bool,
}

#[derive(Args)]
struct SearchArgs {
    /// Search base DN (empty string for the root)
    base: String,

    /// How much of the tree below the base to cover
    #[arg(long, value_enum, default_value_t = ScopeArg::Sub)]
    scope: ScopeArg,

    /// Maximum number of entries to return
    #[arg(long, default_value_t = 100)]
    page_size: u32,

    /// Number of matching entries to skip
    #[arg(long, default_value_t = 0)]
    offset: u32,

    /// Include the computed memberOf attribute
    #[arg(long)]
    member_of: bool,

    /// Only return entries with this object class
    #[arg(long)]
    object_class: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ScopeArg {
    Base,
    One,
    Sub,
    Children,
}

impl From<ScopeArg> for SearchScope {
    fn from(scope: ScopeArg) -> Self {
        match scope {
            ScopeArg::Base => SearchScope::BaseObject,
            ScopeArg::One => SearchScope::SingleLevel,
            ScopeArg::Sub => SearchScope::WholeSubtree,
            ScopeArg::Children => SearchScope::SubordinateSubtree,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = run(cli).await;

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            e.print();
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    let config = Config::from_env()?;
    logging::init_logging(&config.rust_log, config.log_format)?;

    let pool = DbPool::connect_with(&config.database_url, &config.pool).await?;
    let result = execute(cli.command, &config, &pool).await;
    pool.close().await;
    result
}

async fn execute(command: Commands, config: &Config, pool: &DbPool) -> CliResult<()> {
    match command {
        Commands::Migrate => {
            run_migrations(pool).await?;
            println!("Migrations applied");
            Ok(())
        }
        Commands::Verify => {
            let repo = Repository::new(pool.clone(), EntryMapper::new(config.matching_rules()))?;
            let count = repo.registry().verify(pool).await?;
            println!("{count} statements verified");
            Ok(())
        }
        Commands::Get(args) => {
            let service = service(config, pool)?;
            let entry = service
                .get(&Requester::anonymous(), &args.dn, args.member_of)
                .await?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
            Ok(())
        }
        Commands::Search(args) => search(config, pool, args).await,
    }
}

async fn search(config: &Config, pool: &DbPool, args: SearchArgs) -> CliResult<()> {
    let service = service(config, pool)?;
    let base = Dn::parse(&args.base)?;
    let filter = match &args.object_class {
        Some(object_class) => object_class_filter(service.repository().mapper(), object_class)?,
        None => FilterQuery::match_all(),
    };
    let request = SearchRequest::new(PathScope::new(base, args.scope.into()), filter)
        .with_member_of(args.member_of)
        .with_page(Page::new(args.page_size, args.offset));

    let mut out = std::io::stdout();
    let summary = service
        .search(&Requester::anonymous(), &request, |entry| {
            serde_json::to_writer(&mut out, &entry)
                .map_err(|e| DirectoryError::internal_with_source("write search result", e))?;
            writeln!(out)
                .map_err(|e| DirectoryError::internal_with_source("write search result", e))
        })
        .await?;

    info!(
        total = summary.total_count,
        returned = summary.returned,
        "Search completed"
    );
    eprintln!("{}", serde_json::to_string(&summary)?);
    Ok(())
}

fn service(config: &Config, pool: &DbPool) -> CliResult<DirectoryService> {
    let repo = Repository::new(pool.clone(), EntryMapper::new(config.matching_rules()))?;
    Ok(DirectoryService::new(repo, Arc::new(AllowAll)))
}

/// Containment filter on the normalized `objectClass` values.
fn object_class_filter(mapper: &EntryMapper, object_class: &str) -> CliResult<FilterQuery> {
    let value = mapper.rules().normalize(OBJECT_CLASS, object_class)?;
    let mut params = QueryParams::new();
    params.set_json(
        "objectClass",
        &serde_json::json!({ (OBJECT_CLASS.to_ascii_lowercase()): [value] }),
    )?;
    Ok(FilterQuery::new("e1.attrs_norm @> :objectClass", params))
}
