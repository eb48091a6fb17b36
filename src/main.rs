use clap::{ArgGroup, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use reelrank::config::Config;
use reelrank::db;
use reelrank::model::ModelArtifact;
use reelrank::services::{embeddings, labels, profile, scoring, trainer, LabelPolicy, OllamaClient};

#[derive(Parser, Debug)]
#[command(name = "reelrank", about = "Batch ranking pipeline for unwatched media")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rebuild the training table from watch history and feedback
    RebuildTraining,
    /// Fit the classifier and persist the model artifact
    Train,
    /// Score unwatched candidates and store recommendations
    #[command(group(
        ArgGroup::new("target").required(true).args(["user", "all_users"])
    ))]
    Score {
        /// Username to score recommendations for
        #[arg(long)]
        user: Option<String>,
        /// Score every user with watch history (truncates the output table)
        #[arg(long)]
        all_users: bool,
        /// Skip attribution generation
        #[arg(long)]
        skip_attribution: bool,
    },
    /// Rebuild per-user profile embeddings from engaged watches
    BuildProfiles,
    /// Embed library items that have no media embedding yet
    Embed,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;

    match cli.command {
        Command::RebuildTraining => {
            let policy = LabelPolicy {
                engagement_threshold: config.engagement_threshold,
                negative_threshold: config.negative_threshold,
                feedback_bonus: config.feedback_bonus,
            };
            labels::build_training_data(&pool, &policy).await?;
        }
        Command::Train => {
            trainer::train(&pool, &config).await?;
        }
        Command::Score {
            user,
            all_users,
            skip_attribution,
        } => {
            let artifact = ModelArtifact::load(&config.model_path)?;
            tracing::info!(
                model_id = %artifact.model_id,
                features = artifact.feature_names.len(),
                "Model artifact loaded"
            );
            if all_users {
                scoring::score_all_users(&pool, &artifact, &config, skip_attribution).await?;
            } else if let Some(username) = user {
                scoring::score_user(&pool, &artifact, &config, &username, skip_attribution)
                    .await?;
            }
        }
        Command::BuildProfiles => {
            profile::build_user_profiles(&pool, config.watch_embed_min_engagement).await?;
        }
        Command::Embed => {
            let redis_client = db::create_redis_client(&config.redis_url)?;
            let client = OllamaClient::new(
                redis_client,
                config.embed_api_url.clone(),
                config.embed_model.clone(),
            );
            embeddings::embed_missing_media(&pool, &client, config.embed_batch_size).await?;
        }
    }

    Ok(())
}
