use clap::{Parser, Subcommand};
use identity_service::{config::IdentityConfig, db, models::PolicyContext, IdentityCore};
use service_core::error::AppError;
use service_core::observability::logging::init_tracing;

#[derive(Parser)]
#[command(name = "identity-service", version, about = "Identity and access core operations")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending database migrations.
    Migrate,
    /// Evaluate a permission and print the decision as JSON.
    CheckPermission {
        #[arg(long)]
        subject: String,
        #[arg(long)]
        action: String,
        #[arg(long)]
        resource: String,
        /// JSON object with request attributes.
        #[arg(long)]
        context: Option<String>,
        #[arg(long)]
        no_cache: bool,
    },
    /// Drop cached decisions. No filters flushes everything.
    InvalidateCache {
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        action: Option<String>,
        #[arg(long)]
        resource: Option<String>,
    },
    /// Sign a user out of every session.
    RevokeSessions {
        #[arg(long)]
        user_id: i64,
        #[arg(long, default_value = "admin_revocation")]
        reason: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();

    // Load configuration - fail fast if invalid
    let config = IdentityConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.common.otlp_endpoint(),
    )?;

    identity_service::services::metrics::init_metrics()
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Failed to register metrics: {}", e)))?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting identity service"
    );

    if let Command::Migrate = cli.command {
        let pool = db::create_pool(&config.database).await?;
        db::run_migrations(&pool).await?;
        return Ok(());
    }

    let core = IdentityCore::connect(config).await?;
    core.health_check().await?;

    match cli.command {
        Command::Migrate => {}
        Command::CheckPermission {
            subject,
            action,
            resource,
            context,
            no_cache,
        } => {
            let context = context.as_deref().map(parse_context).transpose()?;
            let decision = core
                .authz
                .check_permission(&subject, &action, &resource, context.as_ref(), !no_cache)
                .await
                .map_err(AppError::from)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&decision).map_err(|e| AppError::InternalError(e.into()))?
            );
        }
        Command::InvalidateCache {
            subject,
            action,
            resource,
        } => {
            let removed = core
                .authz
                .invalidate_cache(subject.as_deref(), action.as_deref(), resource.as_deref())
                .await
                .map_err(AppError::from)?;
            println!("{} cached decisions removed", removed);
        }
        Command::RevokeSessions { user_id, reason } => {
            let removed = core
                .admin
                .revoke_all_sessions(user_id, &reason)
                .await
                .map_err(AppError::from)?;
            println!("{} sessions revoked for user {}", removed, user_id);
        }
    }

    Ok(())
}

fn parse_context(raw: &str) -> Result<PolicyContext, AppError> {
    match serde_json::from_str(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err(AppError::BadRequest(anyhow::anyhow!("--context must be a JSON object"))),
        Err(e) => Err(AppError::BadRequest(anyhow::anyhow!("Invalid --context JSON: {}", e))),
    }
}
