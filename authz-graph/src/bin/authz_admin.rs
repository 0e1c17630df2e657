//! Operator tool for a tenant's authorization graph.
//!
//! Usage:
//!   authz-admin --config authz.yaml check <SOURCE> <TARGET> <ATTRIBUTE>
//!   authz-admin reachable <SOURCE> <TYPE_ID> <ATTRIBUTE>
//!   authz-admin flush-cache

use authz_graph::{telemetry, AuthzConfig, AuthzService, CallerContext};
use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "authz-admin")]
#[command(about = "Inspect and maintain a tenant's authorization graph")]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(long, env = "AUTHZ_CONFIG")]
    config: Option<String>,

    /// Overrides `database_url` from the configuration
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Overrides `tenant_id` from the configuration
    #[arg(long)]
    tenant: Option<Uuid>,

    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run migrations and create the built-in object types
    Provision,
    /// Does SOURCE hold ATTRIBUTE on TARGET?
    Check {
        source: Uuid,
        target: Uuid,
        attribute: String,
    },
    /// Every attribute SOURCE holds on TARGET
    ListAttributes { source: Uuid, target: Uuid },
    /// Objects of TYPE_ID on which SOURCE holds ATTRIBUTE
    Reachable {
        source: Uuid,
        type_id: Uuid,
        attribute: String,
    },
    /// Drop every cached entry for the tenant
    FlushCache,
    /// Print cached entries under a key prefix
    DumpCache {
        #[arg(default_value = "")]
        prefix: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    telemetry::init_tracing(args.verbose);

    let mut config = AuthzConfig::load(args.config.as_deref())?;
    if let Some(url) = args.database_url {
        config.database_url = Some(url);
    }
    if let Some(tenant) = args.tenant {
        config.tenant_id = tenant;
    }

    if matches!(args.command, Command::FlushCache | Command::DumpCache { .. }) {
        config.require_shared_cache()?;
    }

    let service = AuthzService::from_config(&config).await?;
    let caller = CallerContext::system();

    match args.command {
        Command::Provision => {
            service.provision().await?;
            info!("Built-in object types are in place");
        }
        Command::Check {
            source,
            target,
            attribute,
        } => {
            let response = service
                .check_attribute(&caller, source, target, &attribute)
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::ListAttributes { source, target } => {
            let attributes = service.list_attributes(&caller, source, target).await?;
            println!("{}", serde_json::to_string_pretty(&attributes)?);
        }
        Command::Reachable {
            source,
            type_id,
            attribute,
        } => {
            let objects = service
                .list_objects_reachable_with_attribute(&caller, source, type_id, &attribute)
                .await?;
            println!("{}", serde_json::to_string_pretty(&objects)?);
        }
        Command::FlushCache => {
            let removed = service.flush_cache(&caller).await?;
            info!("Flushed {} cache entries for tenant {}", removed, config.tenant_id);
        }
        Command::DumpCache { prefix } => {
            for (key, value) in service.dump_cache(&caller, &prefix).await? {
                println!("{} = {}", key, value);
            }
        }
    }

    Ok(())
}
