use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use cadence_kernel_api::{
    AddMembershipRequest, CadenceKernelApi, CheckpointSpec, CreateTeamRequest,
    EstablishModelRequest, MappingSpec, ReconcileCheckpointsRequest, ReconcileMappingsRequest,
};
use cadence_kernel_core::{EstimationUnit, Framework, RecordId};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::Date;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const DATE_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");

#[derive(Debug, Parser)]
#[command(name = "ck")]
#[command(about = "Cadence Kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./cadence_kernel.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Team {
        #[command(subcommand)]
        command: TeamCommand,
    },
    Model {
        #[command(subcommand)]
        command: ModelCommand,
    },
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommand,
    },
    Mapping {
        #[command(subcommand)]
        command: MappingCommand,
    },
    Membership {
        #[command(subcommand)]
        command: MembershipCommand,
    },
    Plan {
        #[command(subcommand)]
        command: PlanCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum TeamCommand {
    Create(TeamCreateArgs),
    List,
}

#[derive(Debug, Args)]
struct TeamCreateArgs {
    #[arg(long)]
    team_id: String,
    #[arg(long)]
    name: String,
}

#[derive(Debug, Subcommand)]
enum ModelCommand {
    Establish(ModelEstablishArgs),
    Remove(ModelRemoveArgs),
    Reopen(ModelReopenArgs),
    Timeline(ModelTimelineArgs),
}

#[derive(Debug, Args)]
struct ModelEstablishArgs {
    #[arg(long)]
    team_id: String,
    #[arg(long)]
    start_on: String,
    #[arg(long)]
    framework: FrameworkArg,
    #[arg(long)]
    estimation: EstimationArg,
}

#[derive(Debug, Args)]
struct ModelRemoveArgs {
    #[arg(long)]
    team_id: String,
    #[arg(long)]
    record_id: String,
}

#[derive(Debug, Args)]
struct ModelReopenArgs {
    #[arg(long)]
    team_id: String,
}

#[derive(Debug, Args)]
struct ModelTimelineArgs {
    #[arg(long)]
    team_id: String,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Subcommand)]
enum CheckpointCommand {
    Reconcile(ReconcileArgs),
    List(CollectionListArgs),
}

#[derive(Debug, Subcommand)]
enum MappingCommand {
    Reconcile(ReconcileArgs),
    List(CollectionListArgs),
}

#[derive(Debug, Args)]
struct ReconcileArgs {
    #[arg(long)]
    team_id: String,
    #[arg(long = "spec")]
    specs: Vec<String>,
    #[arg(long, default_value_t = false)]
    keep_at_least_one: bool,
}

#[derive(Debug, Args)]
struct CollectionListArgs {
    #[arg(long)]
    team_id: String,
}

#[derive(Debug, Subcommand)]
enum MembershipCommand {
    Add(MembershipAddArgs),
}

#[derive(Debug, Args)]
struct MembershipAddArgs {
    #[arg(long)]
    parent_team: String,
    #[arg(long)]
    child_team: String,
    #[arg(long)]
    start_on: String,
    #[arg(long)]
    end_on: Option<String>,
}

#[derive(Debug, Subcommand)]
enum PlanCommand {
    Show(PlanShowArgs),
}

#[derive(Debug, Args)]
struct PlanShowArgs {
    #[arg(long)]
    plan_id: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FrameworkArg {
    Scrum,
    Kanban,
    Hybrid,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EstimationArg {
    StoryPoints,
    Count,
    Hours,
}

impl FrameworkArg {
    fn into_framework(self) -> Framework {
        match self {
            Self::Scrum => Framework::Scrum,
            Self::Kanban => Framework::Kanban,
            Self::Hybrid => Framework::Hybrid,
        }
    }
}

impl EstimationArg {
    fn into_estimation_unit(self) -> EstimationUnit {
        match self {
            Self::StoryPoints => EstimationUnit::StoryPoints,
            Self::Count => EstimationUnit::Count,
            Self::Hours => EstimationUnit::Hours,
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

fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = CadenceKernelApi::new(cli.db);
    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Team { command } => run_team(command, &api),
        Command::Model { command } => run_model(command, &api),
        Command::Checkpoint { command } => run_checkpoint(command, &api),
        Command::Mapping { command } => run_mapping(command, &api),
        Command::Membership { command } => run_membership(command, &api),
        Command::Plan { command } => run_plan(command, &api),
    }
}

fn run_db(command: DbCommand, api: &CadenceKernelApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
    }
}

fn run_team(command: TeamCommand, api: &CadenceKernelApi) -> Result<()> {
    match command {
        TeamCommand::Create(args) => {
            let team =
                api.create_team(CreateTeamRequest { team_id: args.team_id, name: args.name })?;
            emit_json(serde_json::to_value(&team).context("failed to serialize team")?)
        }
        TeamCommand::List => {
            let teams = api.list_teams()?;
            emit_json(serde_json::json!({ "teams": teams }))
        }
    }
}

fn run_model(command: ModelCommand, api: &CadenceKernelApi) -> Result<()> {
    match command {
        ModelCommand::Establish(args) => {
            let result = api.establish_model(EstablishModelRequest {
                team_id: args.team_id,
                start_on: parse_date(&args.start_on)?,
                framework: args.framework.into_framework(),
                estimation: args.estimation.into_estimation_unit(),
            })?;
            emit_json(serde_json::to_value(&result).context("failed to serialize model result")?)
        }
        ModelCommand::Remove(args) => {
            let record_id = parse_record_id(&args.record_id)?;
            let removed = api.remove_model(&args.team_id, record_id)?;
            emit_json(serde_json::json!({
                "team_id": args.team_id,
                "removed": removed
            }))
        }
        ModelCommand::Reopen(args) => {
            let reopened = api.reopen_model(&args.team_id)?;
            emit_json(serde_json::json!({
                "team_id": args.team_id,
                "reopened": reopened.to_string()
            }))
        }
        ModelCommand::Timeline(args) => {
            let as_of = args.as_of.as_deref().map(parse_date).transpose()?;
            let timeline = api.model_timeline(&args.team_id, as_of)?;
            emit_json(serde_json::to_value(&timeline).context("failed to serialize timeline")?)
        }
    }
}

fn run_checkpoint(command: CheckpointCommand, api: &CadenceKernelApi) -> Result<()> {
    match command {
        CheckpointCommand::Reconcile(args) => {
            let specs = args
                .specs
                .iter()
                .map(|raw| {
                    serde_json::from_str::<CheckpointSpec>(raw)
                        .with_context(|| format!("invalid checkpoint spec JSON: {raw}"))
                })
                .collect::<Result<Vec<_>>>()?;
            let artifact = api.reconcile_checkpoints(ReconcileCheckpointsRequest {
                team_id: args.team_id,
                specs,
                keep_at_least_one: args.keep_at_least_one,
            })?;
            emit_json(serde_json::to_value(&artifact).context("failed to serialize plan")?)
        }
        CheckpointCommand::List(args) => {
            let checkpoints = api.list_checkpoints(&args.team_id)?;
            emit_json(serde_json::json!({
                "team_id": args.team_id,
                "checkpoints": checkpoints
            }))
        }
    }
}

fn run_mapping(command: MappingCommand, api: &CadenceKernelApi) -> Result<()> {
    match command {
        MappingCommand::Reconcile(args) => {
            let specs = args
                .specs
                .iter()
                .map(|raw| {
                    serde_json::from_str::<MappingSpec>(raw)
                        .with_context(|| format!("invalid mapping spec JSON: {raw}"))
                })
                .collect::<Result<Vec<_>>>()?;
            let artifact = api.reconcile_mappings(ReconcileMappingsRequest {
                team_id: args.team_id,
                specs,
                keep_at_least_one: args.keep_at_least_one,
            })?;
            emit_json(serde_json::to_value(&artifact).context("failed to serialize plan")?)
        }
        MappingCommand::List(args) => {
            let mappings = api.list_mappings(&args.team_id)?;
            emit_json(serde_json::json!({
                "team_id": args.team_id,
                "mappings": mappings
            }))
        }
    }
}

fn run_membership(command: MembershipCommand, api: &CadenceKernelApi) -> Result<()> {
    match command {
        MembershipCommand::Add(args) => {
            let record = api.add_membership(AddMembershipRequest {
                parent_team: args.parent_team,
                child_team: args.child_team,
                start_on: parse_date(&args.start_on)?,
                end_on: args.end_on.as_deref().map(parse_date).transpose()?,
            })?;
            emit_json(serde_json::to_value(&record).context("failed to serialize membership")?)
        }
    }
}

fn run_plan(command: PlanCommand, api: &CadenceKernelApi) -> Result<()> {
    match command {
        PlanCommand::Show(args) => {
            let artifact = api.plan_show(&args.plan_id)?;
            emit_json(serde_json::to_value(&artifact).context("failed to serialize plan")?)
        }
    }
}

fn parse_date(value: &str) -> Result<Date> {
    Date::parse(value, DATE_FORMAT)
        .with_context(|| format!("invalid calendar date (expected YYYY-MM-DD): {value}"))
}

fn parse_record_id(value: &str) -> Result<RecordId> {
    RecordId::parse(value).ok_or_else(|| anyhow!("invalid ULID: {value}"))
}
