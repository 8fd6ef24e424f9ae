use std::path::PathBuf;

use anyhow::{anyhow, Result};
use cadence_kernel_core::{
    check_no_overlap, current_record, establish_current, reconcile, remove_record, reopen_latest,
    resolve_state, Checkpoint, DateInterval, EstimationUnit, Framework, OperatingModel,
    ReconciliationPlan, RecordId, RecordSpec, RemovalPolicy, SpanRecord, TeamMapping,
    TeamMembership, TemporalState,
};
use cadence_kernel_store_sqlite::{SchemaStatus, SqliteStore, TeamRow};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Date, OffsetDateTime};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateTeamRequest {
    pub team_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EstablishModelRequest {
    pub team_id: String,
    pub start_on: Date,
    pub framework: Framework,
    pub estimation: EstimationUnit,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EstablishModelResult {
    pub team_id: String,
    pub closed: Option<RecordId>,
    pub established: RecordId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimelineEntry {
    pub record: SpanRecord<OperatingModel>,
    pub state: TemporalState,
    pub is_current: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelTimeline {
    pub team_id: String,
    pub as_of: Date,
    pub entries: Vec<TimelineEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointSpec {
    pub record_id: Option<RecordId>,
    pub due_on: Date,
    pub metric: String,
    pub target: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconcileCheckpointsRequest {
    pub team_id: String,
    pub specs: Vec<CheckpointSpec>,
    #[serde(default)]
    pub keep_at_least_one: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MappingSpec {
    pub record_id: Option<RecordId>,
    pub start_on: Date,
    pub end_on: Option<Date>,
    pub workspace: String,
    pub external_team: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileMappingsRequest {
    pub team_id: String,
    pub specs: Vec<MappingSpec>,
    #[serde(default)]
    pub keep_at_least_one: bool,
}

/// A persisted record of one reconciliation run. The id is a deterministic
/// digest of the inputs, so replaying the same request yields the same
/// artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanArtifact {
    pub plan_id: String,
    pub team_id: String,
    pub collection: String,
    pub plan: ReconciliationPlan,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddMembershipRequest {
    pub parent_team: String,
    pub child_team: String,
    pub start_on: Date,
    pub end_on: Option<Date>,
}

#[derive(Debug, Clone)]
pub struct CadenceKernelApi {
    db_path: PathBuf,
}

impl CadenceKernelApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Create a team or rename an existing one.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub fn create_team(&self, input: CreateTeamRequest) -> Result<TeamRow> {
        let mut store = self.open_migrated()?;
        store.upsert_team(&input.team_id, &input.name)?;
        Ok(TeamRow { team_id: input.team_id, name: input.name })
    }

    /// List all teams.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_teams(&self) -> Result<Vec<TeamRow>> {
        let store = self.open_migrated()?;
        store.list_teams()
    }

    /// Establish a new current operating model for a team, closing the prior
    /// one the day before the new start. The closed and established records
    /// are persisted as one unit of work.
    ///
    /// # Errors
    /// Returns an error when the team is unknown, the kernel rejects the
    /// sequencing, or persistence fails.
    pub fn establish_model(&self, input: EstablishModelRequest) -> Result<EstablishModelResult> {
        let mut store = self.open_migrated()?;
        require_team(&store, &input.team_id)?;

        let mut history = store.load_models(&input.team_id)?;
        let outcome = establish_current(
            &mut history,
            input.start_on,
            OperatingModel { framework: input.framework, estimation: input.estimation },
        )?;
        store.replace_models(&input.team_id, &history)?;

        Ok(EstablishModelResult {
            team_id: input.team_id,
            closed: outcome.closed,
            established: outcome.established,
        })
    }

    /// Remove one operating-model record from a team's history.
    ///
    /// # Errors
    /// Returns an error when the team is unknown, the record is missing, the
    /// record is the team's last, or persistence fails.
    pub fn remove_model(
        &self,
        team_id: &str,
        record_id: RecordId,
    ) -> Result<SpanRecord<OperatingModel>> {
        let mut store = self.open_migrated()?;
        require_team(&store, team_id)?;

        let mut history = store.load_models(team_id)?;
        let removed = remove_record(&mut history, record_id)?;
        store.replace_models(team_id, &history)?;
        Ok(removed)
    }

    /// Promote a team's most recently started model back to current after the
    /// current record was removed.
    ///
    /// # Errors
    /// Returns an error when the team is unknown, a current record already
    /// exists, or persistence fails.
    pub fn reopen_model(&self, team_id: &str) -> Result<RecordId> {
        let mut store = self.open_migrated()?;
        require_team(&store, team_id)?;

        let mut history = store.load_models(team_id)?;
        let reopened = reopen_latest(&mut history)?;
        store.replace_models(team_id, &history)?;
        Ok(reopened)
    }

    /// Classify every record of a team's model history relative to a
    /// reference day. `as_of` defaults to today at this boundary only; the
    /// kernel itself never reads the clock.
    ///
    /// # Errors
    /// Returns an error when the team is unknown or the history is corrupted.
    pub fn model_timeline(&self, team_id: &str, as_of: Option<Date>) -> Result<ModelTimeline> {
        let store = self.open_migrated()?;
        require_team(&store, team_id)?;

        let as_of = as_of.unwrap_or_else(|| OffsetDateTime::now_utc().date());
        let history = store.load_models(team_id)?;
        let current_id = current_record(&history)?.map(|record| record.id);

        let entries = history
            .into_iter()
            .map(|record| TimelineEntry {
                state: resolve_state(&record.interval, as_of),
                is_current: Some(record.id) == current_id,
                record,
            })
            .collect();

        Ok(ModelTimeline { team_id: team_id.to_string(), as_of, entries })
    }

    /// Reconcile a team's checkpoints toward a desired set, persist the
    /// resulting collection, and store the plan artifact.
    ///
    /// # Errors
    /// Returns an error when the team is unknown, the desired set violates a
    /// uniqueness invariant, or persistence fails.
    pub fn reconcile_checkpoints(&self, input: ReconcileCheckpointsRequest) -> Result<PlanArtifact> {
        let mut store = self.open_migrated()?;
        require_team(&store, &input.team_id)?;

        let plan_id = compute_plan_id(
            &input.team_id,
            "checkpoints",
            &input
                .specs
                .iter()
                .map(|spec| format!("{:?}|{}|{}|{}", spec.record_id, spec.due_on, spec.metric, spec.target))
                .collect::<Vec<_>>(),
        );

        let desired = input
            .specs
            .into_iter()
            .map(|spec| {
                Ok(RecordSpec {
                    id: spec.record_id,
                    interval: DateInterval::closed(spec.due_on, spec.due_on)?,
                    payload: Checkpoint { metric: spec.metric, target: spec.target },
                })
            })
            .collect::<Result<Vec<_>, cadence_kernel_core::KernelError>>()?;

        let mut existing = store.load_checkpoints(&input.team_id)?;
        let plan = reconcile(
            &mut existing,
            desired,
            |spec| spec.interval.start(),
            removal_policy(input.keep_at_least_one),
        )?;
        store.replace_checkpoints(&input.team_id, &existing)?;

        let artifact = PlanArtifact {
            plan_id: plan_id.clone(),
            team_id: input.team_id,
            collection: "checkpoints".to_string(),
            plan,
        };
        store.save_plan(&plan_id, &serde_json::to_string(&artifact)?)?;
        Ok(artifact)
    }

    /// Reconcile a team's tracker mappings toward a desired set, persist the
    /// resulting collection, and store the plan artifact.
    ///
    /// # Errors
    /// Returns an error when the team is unknown, the desired set violates a
    /// uniqueness invariant, or persistence fails.
    pub fn reconcile_mappings(&self, input: ReconcileMappingsRequest) -> Result<PlanArtifact> {
        let mut store = self.open_migrated()?;
        require_team(&store, &input.team_id)?;

        let plan_id = compute_plan_id(
            &input.team_id,
            "mappings",
            &input
                .specs
                .iter()
                .map(|spec| {
                    format!(
                        "{:?}|{}|{:?}|{}|{}",
                        spec.record_id, spec.start_on, spec.end_on, spec.workspace, spec.external_team
                    )
                })
                .collect::<Vec<_>>(),
        );

        let desired = input
            .specs
            .into_iter()
            .map(|spec| {
                Ok(RecordSpec {
                    id: spec.record_id,
                    interval: DateInterval::new(spec.start_on, spec.end_on)?,
                    payload: TeamMapping {
                        workspace: spec.workspace,
                        external_team: spec.external_team,
                    },
                })
            })
            .collect::<Result<Vec<_>, cadence_kernel_core::KernelError>>()?;

        let mut existing = store.load_mappings(&input.team_id)?;
        let plan = reconcile(
            &mut existing,
            desired,
            |spec| spec.payload.discriminator(),
            removal_policy(input.keep_at_least_one),
        )?;
        store.replace_mappings(&input.team_id, &existing)?;

        let artifact = PlanArtifact {
            plan_id: plan_id.clone(),
            team_id: input.team_id,
            collection: "mappings".to_string(),
            plan,
        };
        store.save_plan(&plan_id, &serde_json::to_string(&artifact)?)?;
        Ok(artifact)
    }

    /// List a team's checkpoints in due-date order.
    ///
    /// # Errors
    /// Returns an error when the team is unknown or rows cannot be read.
    pub fn list_checkpoints(&self, team_id: &str) -> Result<Vec<SpanRecord<Checkpoint>>> {
        let store = self.open_migrated()?;
        require_team(&store, team_id)?;
        store.load_checkpoints(team_id)
    }

    /// List a team's tracker mappings in discriminator order.
    ///
    /// # Errors
    /// Returns an error when the team is unknown or rows cannot be read.
    pub fn list_mappings(&self, team_id: &str) -> Result<Vec<SpanRecord<TeamMapping>>> {
        let store = self.open_migrated()?;
        require_team(&store, team_id)?;
        store.load_mappings(team_id)
    }

    /// Add one membership span for a parent/child team pair, rejecting any
    /// span that overlaps an existing one for the same pair.
    ///
    /// # Errors
    /// Returns an error when the span is invalid, overlaps an existing span,
    /// or persistence fails.
    pub fn add_membership(&self, input: AddMembershipRequest) -> Result<SpanRecord<TeamMembership>> {
        let mut store = self.open_migrated()?;

        let candidate = DateInterval::new(input.start_on, input.end_on)?;
        let existing = store
            .load_memberships(&input.parent_team, &input.child_team)?
            .iter()
            .map(|record| record.interval)
            .collect::<Vec<_>>();
        check_no_overlap(&candidate, &existing)?;

        let record = SpanRecord {
            id: RecordId::new(),
            interval: candidate,
            payload: TeamMembership {
                parent_team: input.parent_team,
                child_team: input.child_team,
            },
        };
        store.insert_membership(&record)?;
        Ok(record)
    }

    /// Fetch a previously persisted reconciliation plan.
    ///
    /// # Errors
    /// Returns an error when lookup fails or the plan does not exist.
    pub fn plan_show(&self, plan_id: &str) -> Result<PlanArtifact> {
        let store = self.open_migrated()?;
        let json = store
            .get_plan(plan_id)?
            .ok_or_else(|| anyhow!("reconciliation plan not found: {plan_id}"))?;
        let artifact = serde_json::from_str(&json)?;
        Ok(artifact)
    }
}

fn require_team(store: &SqliteStore, team_id: &str) -> Result<()> {
    if store.team_exists(team_id)? {
        Ok(())
    } else {
        Err(anyhow!("not found: team {team_id}"))
    }
}

fn removal_policy(keep_at_least_one: bool) -> RemovalPolicy {
    if keep_at_least_one {
        RemovalPolicy::KeepAtLeastOne
    } else {
        RemovalPolicy::AllowEmpty
    }
}

fn compute_plan_id(team_id: &str, collection: &str, spec_lines: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(team_id.as_bytes());
    hasher.update(collection.as_bytes());
    for line in spec_lines {
        hasher.update(line.as_bytes());
    }

    let digest = hasher.finalize();
    let digest_hex = format!("{digest:x}");
    format!("plan_{}", &digest_hex[..16])
}
