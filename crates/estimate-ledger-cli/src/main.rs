use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use estimate_ledger_api::{report, AggregateView, Aggregator, LedgerConfig, Origin, Phase};
use estimate_ledger_client::{ActionEnvelope, BackendClient};
use estimate_ledger_core::{
    decode_records, decode_versions, BillingTicket, EstimateVersion, ParentKey, Receipt, Scope,
    VersionedRecord,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const DEFAULT_LOG_FILTER: &str = "eledger=info,estimate_ledger=info";

#[derive(Debug, Parser)]
#[command(name = "eledger")]
#[command(about = "Estimate ledger CLI")]
struct Cli {
    /// YAML config file; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Aggregate child records from saved JSON files.
    Merge(MergeArgs),
    /// Fetch every revision from the backend and aggregate once.
    Aggregate(LiveArgs),
    /// Re-aggregate on an interval, printing each changed view.
    Watch(WatchArgs),
}

#[derive(Debug, Args)]
struct SelectionArgs {
    #[arg(long, value_enum)]
    kind: KindArg,
    #[arg(long)]
    estimate: String,
    #[arg(long)]
    draft: Option<PathBuf>,
    #[arg(long, value_enum)]
    scope: Option<ScopeArg>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    caller_id: Option<String>,
    #[arg(long, default_value_t = false)]
    privileged: bool,
}

#[derive(Debug, Args)]
struct MergeArgs {
    #[command(flatten)]
    selection: SelectionArgs,
    /// JSON array of estimate revisions, or a saved `{success, result}` response.
    #[arg(long)]
    versions: PathBuf,
}

#[derive(Debug, Args)]
struct LiveArgs {
    #[command(flatten)]
    selection: SelectionArgs,
    #[arg(long)]
    base_url: Option<String>,
}

#[derive(Debug, Args)]
struct WatchArgs {
    #[command(flatten)]
    live: LiveArgs,
    #[arg(long)]
    interval_secs: Option<u64>,
    /// Exit after this many completed refreshes.
    #[arg(long)]
    ticks: Option<usize>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Receipts,
    BillingTickets,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScopeArg {
    #[value(name = "self")]
    SelfOnly,
    All,
}

impl From<ScopeArg> for Scope {
    fn from(value: ScopeArg) -> Self {
        match value {
            ScopeArg::SelfOnly => Self::SelfOnly,
            ScopeArg::All => Self::All,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit_json_line(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let base = match &cli.config {
        Some(path) => LedgerConfig::load(path)?,
        None => LedgerConfig::default(),
    };

    match cli.command {
        Command::Merge(args) => {
            let config = resolve_config(base, &args.selection, None, None)?;
            match args.selection.kind {
                KindArg::Receipts => run_merge::<Receipt>(&args, &config),
                KindArg::BillingTickets => run_merge::<BillingTicket>(&args, &config),
            }
        }
        Command::Aggregate(args) => {
            let config = resolve_config(base, &args.selection, args.base_url.as_deref(), None)?;
            match args.selection.kind {
                KindArg::Receipts => run_aggregate::<Receipt>(&args.selection, &config).await,
                KindArg::BillingTickets => {
                    run_aggregate::<BillingTicket>(&args.selection, &config).await
                }
            }
        }
        Command::Watch(args) => {
            let live = &args.live;
            let config = resolve_config(
                base,
                &live.selection,
                live.base_url.as_deref(),
                args.interval_secs,
            )?;
            match live.selection.kind {
                KindArg::Receipts => run_watch::<Receipt>(&args, &config).await,
                KindArg::BillingTickets => run_watch::<BillingTicket>(&args, &config).await,
            }
        }
    }
}

fn resolve_config(
    mut config: LedgerConfig,
    selection: &SelectionArgs,
    base_url: Option<&str>,
    interval_secs: Option<u64>,
) -> Result<LedgerConfig> {
    if let Some(base_url) = base_url {
        config.base_url = base_url.to_string();
    }
    if let Some(interval_secs) = interval_secs {
        config.poll_interval_secs = interval_secs;
    }
    if let Some(scope) = selection.scope {
        config.scope = scope.into();
    }
    if let Some(email) = &selection.email {
        config.caller.email = Some(email.clone());
    }
    if let Some(caller_id) = &selection.caller_id {
        config.caller.id = Some(caller_id.clone());
    }
    if selection.privileged {
        config.privileged = true;
    }
    config.validate()?;
    Ok(config)
}

fn read_json(path: &Path) -> Result<Value> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&body).with_context(|| format!("{} is not valid JSON", path.display()))
}

fn read_versions(path: &Path) -> Result<Vec<EstimateVersion>> {
    let value = read_json(path)?;
    let value = if value.get("success").is_some() {
        let envelope: ActionEnvelope = serde_json::from_value(value)
            .with_context(|| format!("{} is not a backend response", path.display()))?;
        envelope.into_result()?
    } else {
        value
    };
    Ok(decode_versions(value)?)
}

fn read_draft<R: DeserializeOwned>(path: Option<&Path>) -> Result<Vec<Option<R>>> {
    match path {
        Some(path) => Ok(decode_records(read_json(path)?)?),
        None => Ok(Vec::new()),
    }
}

fn run_merge<R>(args: &MergeArgs, config: &LedgerConfig) -> Result<()>
where
    R: VersionedRecord + Serialize + DeserializeOwned,
{
    let versions = read_versions(&args.versions)?;
    let draft = read_draft::<R>(args.selection.draft.as_deref())?;
    let parent_key = ParentKey::new(&args.selection.estimate);
    let view = AggregateView::build(&draft, &versions, &parent_key, &config.scope_policy());
    emit_json(serde_json::to_value(&view)?)
}

async fn run_aggregate<R>(selection: &SelectionArgs, config: &LedgerConfig) -> Result<()>
where
    R: VersionedRecord + Serialize + DeserializeOwned,
{
    let draft = read_draft::<R>(selection.draft.as_deref())?;
    let parent_key = ParentKey::new(&selection.estimate);
    let client = BackendClient::new(config.client_config())?;

    let versions = if parent_key.is_blank() {
        Vec::new()
    } else {
        match client.list_versions(&parent_key).await {
            Ok(versions) => versions,
            Err(err) => {
                let message = report(Origin::UserAction, &err)
                    .map_or_else(|| err.to_string(), |notice| notice.message);
                bail!("{message}");
            }
        }
    };

    let view = AggregateView::build(&draft, &versions, &parent_key, &config.scope_policy());
    emit_json(serde_json::to_value(&view)?)
}

async fn run_watch<R>(args: &WatchArgs, config: &LedgerConfig) -> Result<()>
where
    R: VersionedRecord + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let selection = &args.live.selection;
    let draft = read_draft::<R>(selection.draft.as_deref())?;
    let parent_key = ParentKey::new(&selection.estimate);
    let client = BackendClient::new(config.client_config())?;
    let aggregator = Aggregator::<R, BackendClient>::new(client, config.scope_policy());

    let mut updates = aggregator.subscribe();
    let poller = aggregator.poll(config.poll_interval(), parent_key, draft)?;
    tracing::info!(
        estimate = %selection.estimate,
        interval_secs = config.poll_interval_secs,
        "watching estimate"
    );

    let mut completed = 0_usize;
    let mut last_digest: Option<String> = None;
    loop {
        if args.ticks.is_some_and(|limit| completed >= limit) {
            break;
        }
        updates.changed().await.map_err(|_| anyhow!("aggregator stopped publishing"))?;
        let state = updates.borrow_and_update().clone();
        tracing::debug!(
            phase = state.phase.as_str(),
            ticket = state.ticket,
            "aggregate state changed"
        );
        match state.phase {
            Phase::Ready => {
                completed += 1;
                let Some(view) = state.view else {
                    continue;
                };
                if last_digest.as_deref() != Some(view.digest.as_str()) {
                    last_digest = Some(view.digest.clone());
                    emit_json_line(serde_json::to_value(&view)?)?;
                }
            }
            Phase::Stale => completed += 1,
            Phase::Idle | Phase::Loading => {}
        }
    }

    poller.stop();
    Ok(())
}
