use std::path::Path;

use anyhow::{anyhow, Context, Result};
use cadence_kernel_core::{
    Checkpoint, DateInterval, EstimationUnit, Framework, OperatingModel, RecordId, SpanRecord,
    TeamMapping, TeamMembership,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

const LATEST_SCHEMA_VERSION: i64 = 2;

const DATE_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS teams (
  team_id TEXT PRIMARY KEY,
  name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS operating_models (
  record_id TEXT PRIMARY KEY,
  team_id TEXT NOT NULL,
  start_on TEXT NOT NULL,
  end_on TEXT,
  framework TEXT NOT NULL CHECK (framework IN ('scrum','kanban','hybrid')),
  estimation TEXT NOT NULL CHECK (estimation IN ('story_points','count','hours')),
  FOREIGN KEY (team_id) REFERENCES teams(team_id)
);

CREATE TABLE IF NOT EXISTS team_mappings (
  record_id TEXT PRIMARY KEY,
  team_id TEXT NOT NULL,
  start_on TEXT NOT NULL,
  end_on TEXT,
  workspace TEXT NOT NULL,
  external_team TEXT NOT NULL,
  UNIQUE(team_id, workspace, external_team),
  FOREIGN KEY (team_id) REFERENCES teams(team_id)
);

CREATE TABLE IF NOT EXISTS checkpoints (
  record_id TEXT PRIMARY KEY,
  team_id TEXT NOT NULL,
  due_on TEXT NOT NULL,
  metric TEXT NOT NULL,
  target REAL NOT NULL,
  UNIQUE(team_id, due_on),
  FOREIGN KEY (team_id) REFERENCES teams(team_id)
);

CREATE TABLE IF NOT EXISTS reconciliation_plans (
  plan_id TEXT PRIMARY KEY,
  generated_at TEXT NOT NULL,
  plan_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_operating_models_team ON operating_models(team_id, start_on);
CREATE INDEX IF NOT EXISTS idx_team_mappings_team ON team_mappings(team_id);
CREATE INDEX IF NOT EXISTS idx_checkpoints_team ON checkpoints(team_id, due_on);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS memberships (
  record_id TEXT PRIMARY KEY,
  parent_team TEXT NOT NULL,
  child_team TEXT NOT NULL,
  start_on TEXT NOT NULL,
  end_on TEXT
);

CREATE INDEX IF NOT EXISTS idx_memberships_pair ON memberships(parent_team, child_team, start_on);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TeamRow {
    pub team_id: String,
    pub name: String,
}

impl SqliteStore {
    /// Open a SQLite-backed store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.apply_migration(1, MIGRATION_001_SQL)?;
            version = 1;
        }
        if version < 2 {
            self.apply_migration(2, MIGRATION_002_SQL)?;
            version = 2;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .with_context(|| format!("failed to start migration v{version} transaction"))?;
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, now_rfc3339()?],
        )
        .with_context(|| format!("failed to record migration version {version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))
    }

    /// Create a team or update its display name.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn upsert_team(&mut self, team_id: &str, name: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO teams(team_id, name) VALUES (?1, ?2)
                 ON CONFLICT(team_id) DO UPDATE SET name = excluded.name",
                params![team_id, name],
            )
            .context("failed to upsert team")?;
        Ok(())
    }

    /// List all teams in stable id order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_teams(&self) -> Result<Vec<TeamRow>> {
        let mut stmt =
            self.conn.prepare("SELECT team_id, name FROM teams ORDER BY team_id ASC")?;
        let rows = stmt
            .query_map([], |row| Ok(TeamRow { team_id: row.get(0)?, name: row.get(1)? }))?;

        let mut teams = Vec::new();
        for row in rows {
            teams.push(row?);
        }
        Ok(teams)
    }

    /// Check whether a team row exists.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn team_exists(&self, team_id: &str) -> Result<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM teams WHERE team_id = ?1)",
            params![team_id],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(exists == 1)
    }

    /// Load a team's full operating-model history ordered by span start.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn load_models(&self, team_id: &str) -> Result<Vec<SpanRecord<OperatingModel>>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_id, start_on, end_on, framework, estimation
             FROM operating_models
             WHERE team_id = ?1
             ORDER BY start_on ASC, record_id ASC",
        )?;

        let mut rows = stmt.query(params![team_id])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let framework_raw: String = row.get(3)?;
            let estimation_raw: String = row.get(4)?;
            records.push(SpanRecord {
                id: parse_record_id(&row.get::<_, String>(0)?)?,
                interval: load_interval(&row.get::<_, String>(1)?, row.get(2)?)?,
                payload: OperatingModel {
                    framework: Framework::parse(&framework_raw)
                        .ok_or_else(|| anyhow!("unknown framework: {framework_raw}"))?,
                    estimation: EstimationUnit::parse(&estimation_raw)
                        .ok_or_else(|| anyhow!("unknown estimation unit: {estimation_raw}"))?,
                },
            });
        }
        Ok(records)
    }

    /// Replace a team's operating-model history in one transaction.
    ///
    /// # Errors
    /// Returns an error when any write in the transaction fails.
    pub fn replace_models(
        &mut self,
        team_id: &str,
        records: &[SpanRecord<OperatingModel>],
    ) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute("DELETE FROM operating_models WHERE team_id = ?1", params![team_id])
            .context("failed to clear operating models")?;
        for record in records {
            tx.execute(
                "INSERT INTO operating_models(record_id, team_id, start_on, end_on, framework, estimation)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id.to_string(),
                    team_id,
                    iso_date(record.interval.start())?,
                    record.interval.end().map(iso_date).transpose()?,
                    record.payload.framework.as_str(),
                    record.payload.estimation.as_str(),
                ],
            )
            .context("failed to insert operating model")?;
        }
        tx.commit().context("failed to commit operating model transaction")
    }

    /// Load a team's tracker mappings ordered by discriminator.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn load_mappings(&self, team_id: &str) -> Result<Vec<SpanRecord<TeamMapping>>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_id, start_on, end_on, workspace, external_team
             FROM team_mappings
             WHERE team_id = ?1
             ORDER BY workspace ASC, external_team ASC",
        )?;

        let mut rows = stmt.query(params![team_id])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(SpanRecord {
                id: parse_record_id(&row.get::<_, String>(0)?)?,
                interval: load_interval(&row.get::<_, String>(1)?, row.get(2)?)?,
                payload: TeamMapping { workspace: row.get(3)?, external_team: row.get(4)? },
            });
        }
        Ok(records)
    }

    /// Replace a team's tracker mappings in one transaction.
    ///
    /// # Errors
    /// Returns an error when any write in the transaction fails.
    pub fn replace_mappings(
        &mut self,
        team_id: &str,
        records: &[SpanRecord<TeamMapping>],
    ) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute("DELETE FROM team_mappings WHERE team_id = ?1", params![team_id])
            .context("failed to clear team mappings")?;
        for record in records {
            tx.execute(
                "INSERT INTO team_mappings(record_id, team_id, start_on, end_on, workspace, external_team)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id.to_string(),
                    team_id,
                    iso_date(record.interval.start())?,
                    record.interval.end().map(iso_date).transpose()?,
                    record.payload.workspace,
                    record.payload.external_team,
                ],
            )
            .context("failed to insert team mapping")?;
        }
        tx.commit().context("failed to commit team mapping transaction")
    }

    /// Load a team's checkpoints ordered by due date. Each checkpoint is a
    /// single-day span keyed by `due_on`.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn load_checkpoints(&self, team_id: &str) -> Result<Vec<SpanRecord<Checkpoint>>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_id, due_on, metric, target
             FROM checkpoints
             WHERE team_id = ?1
             ORDER BY due_on ASC",
        )?;

        let mut rows = stmt.query(params![team_id])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let due_on = parse_iso_date(&row.get::<_, String>(1)?)?;
            records.push(SpanRecord {
                id: parse_record_id(&row.get::<_, String>(0)?)?,
                interval: single_day(due_on)?,
                payload: Checkpoint { metric: row.get(2)?, target: row.get(3)? },
            });
        }
        Ok(records)
    }

    /// Replace a team's checkpoints in one transaction.
    ///
    /// # Errors
    /// Returns an error when any write in the transaction fails.
    pub fn replace_checkpoints(
        &mut self,
        team_id: &str,
        records: &[SpanRecord<Checkpoint>],
    ) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute("DELETE FROM checkpoints WHERE team_id = ?1", params![team_id])
            .context("failed to clear checkpoints")?;
        for record in records {
            tx.execute(
                "INSERT INTO checkpoints(record_id, team_id, due_on, metric, target)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.id.to_string(),
                    team_id,
                    iso_date(record.interval.start())?,
                    record.payload.metric,
                    record.payload.target,
                ],
            )
            .context("failed to insert checkpoint")?;
        }
        tx.commit().context("failed to commit checkpoint transaction")
    }

    /// Persist one membership span.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn insert_membership(&mut self, record: &SpanRecord<TeamMembership>) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO memberships(record_id, parent_team, child_team, start_on, end_on)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.id.to_string(),
                    record.payload.parent_team,
                    record.payload.child_team,
                    iso_date(record.interval.start())?,
                    record.interval.end().map(iso_date).transpose()?,
                ],
            )
            .context("failed to insert membership")?;
        Ok(())
    }

    /// Load all membership spans for one parent/child pair ordered by start.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn load_memberships(
        &self,
        parent_team: &str,
        child_team: &str,
    ) -> Result<Vec<SpanRecord<TeamMembership>>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_id, start_on, end_on
             FROM memberships
             WHERE parent_team = ?1 AND child_team = ?2
             ORDER BY start_on ASC",
        )?;

        let mut rows = stmt.query(params![parent_team, child_team])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(SpanRecord {
                id: parse_record_id(&row.get::<_, String>(0)?)?,
                interval: load_interval(&row.get::<_, String>(1)?, row.get(2)?)?,
                payload: TeamMembership {
                    parent_team: parent_team.to_string(),
                    child_team: child_team.to_string(),
                },
            });
        }
        Ok(records)
    }

    /// Persist a reconciliation plan artifact. Plan ids are deterministic, so
    /// replaying the same reconciliation rewrites the same row.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn save_plan(&mut self, plan_id: &str, plan_json: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO reconciliation_plans(plan_id, generated_at, plan_json)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(plan_id) DO UPDATE SET plan_json = excluded.plan_json",
                params![plan_id, now_rfc3339()?, plan_json],
            )
            .context("failed to persist reconciliation plan")?;
        Ok(())
    }

    /// Retrieve a reconciliation plan artifact by its stable identifier.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get_plan(&self, plan_id: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT plan_json FROM reconciliation_plans WHERE plan_id = ?1")?;
        let value = stmt
            .query_row(params![plan_id], |row| row.get::<_, String>(0))
            .optional()?;
        Ok(value)
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn iso_date(value: Date) -> Result<String> {
    value.format(DATE_FORMAT).context("failed to format calendar date")
}

fn parse_iso_date(value: &str) -> Result<Date> {
    Date::parse(value, DATE_FORMAT).with_context(|| format!("invalid calendar date: {value}"))
}

fn parse_record_id(raw: &str) -> Result<RecordId> {
    RecordId::parse(raw).ok_or_else(|| anyhow!("invalid ULID: {raw}"))
}

fn load_interval(start_raw: &str, end_raw: Option<String>) -> Result<DateInterval> {
    let start = parse_iso_date(start_raw)?;
    let end = end_raw.as_deref().map(parse_iso_date).transpose()?;
    DateInterval::new(start, end).map_err(|err| anyhow!("stored interval is invalid: {err}"))
}

fn single_day(day: Date) -> Result<DateInterval> {
    DateInterval::closed(day, day).map_err(|err| anyhow!("stored date is invalid: {err}"))
}
