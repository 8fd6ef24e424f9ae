use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::Date;
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid sequencing: {0}")]
    InvalidSequencing(String),
    #[error("last record protected: {0}")]
    LastRecordProtected(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("duplicate identity: {0}")]
    DuplicateIdentity(String),
    #[error("duplicate discriminator: {0}")]
    DuplicateDiscriminator(String),
    #[error("overlap conflict: {0}")]
    OverlapConflict(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordId(pub Ulid);

impl RecordId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Ulid::from_string(value).ok().map(Self)
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An inclusive span of calendar days. `end == None` means the span is still
/// open ("current"). Immutable once constructed: replacing a record's span
/// means assigning a new value, never editing this one.
#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Hash)]
pub struct DateInterval {
    start: Date,
    end: Option<Date>,
}

#[derive(Debug, Deserialize)]
struct RawDateInterval {
    start: Date,
    end: Option<Date>,
}

impl<'de> Deserialize<'de> for DateInterval {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawDateInterval::deserialize(deserializer)?;
        Self::new(raw.start, raw.end).map_err(serde::de::Error::custom)
    }
}

impl DateInterval {
    /// Construct a span, closed when `end` is present.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when `end` precedes `start`.
    pub fn new(start: Date, end: Option<Date>) -> Result<Self, KernelError> {
        if let Some(end) = end {
            if end < start {
                return Err(KernelError::Validation(format!(
                    "interval end {end} precedes start {start}"
                )));
            }
        }
        Ok(Self { start, end })
    }

    #[must_use]
    pub fn open_ended(start: Date) -> Self {
        Self { start, end: None }
    }

    /// Construct a span that covers `start` through `end` inclusive.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when `end` precedes `start`.
    pub fn closed(start: Date, end: Date) -> Result<Self, KernelError> {
        Self::new(start, Some(end))
    }

    #[must_use]
    pub fn start(&self) -> Date {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> Option<Date> {
        self.end
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    #[must_use]
    pub fn includes_day(&self, day: Date) -> bool {
        if day < self.start {
            return false;
        }
        match self.end {
            Some(end) => day <= end,
            None => true,
        }
    }

    /// Full containment: every day of `other` falls within `self`. An
    /// open-ended `other` can only be contained by an open-ended span.
    #[must_use]
    pub fn includes(&self, other: &Self) -> bool {
        if other.start < self.start {
            return false;
        }
        match (self.end, other.end) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(self_end), Some(other_end)) => other_end <= self_end,
        }
    }

    /// True when the two spans share at least one calendar day.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        match (self.end, other.end) {
            (None, None) => true,
            (None, Some(other_end)) => other_end >= self.start,
            (Some(self_end), None) => self_end >= other.start,
            (Some(self_end), Some(other_end)) => {
                self.start <= other_end && other.start <= self_end
            }
        }
    }
}

impl Display for DateInterval {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.end {
            Some(end) => write!(f, "{}..{}", self.start, end),
            None => write!(f, "{}..", self.start),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TemporalState {
    Past,
    Active,
    Future,
}

impl TemporalState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Past => "past",
            Self::Active => "active",
            Self::Future => "future",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "past" => Some(Self::Past),
            "active" => Some(Self::Active),
            "future" => Some(Self::Future),
            _ => None,
        }
    }
}

/// Classify a span relative to an externally supplied reference day. The
/// three cases are exhaustive and mutually exclusive given the interval
/// invariant, so no error case exists.
#[must_use]
pub fn resolve_state(interval: &DateInterval, as_of: Date) -> TemporalState {
    if let Some(end) = interval.end() {
        if as_of > end {
            return TemporalState::Past;
        }
    }
    if interval.includes_day(as_of) {
        TemporalState::Active
    } else {
        TemporalState::Future
    }
}

/// One interval-bearing child record owned by a parent aggregate. The parent
/// enforces every cross-record invariant; a record never validates itself
/// against its siblings.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SpanRecord<P> {
    pub id: RecordId,
    pub interval: DateInterval,
    pub payload: P,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct SupersessionOutcome {
    pub closed: Option<RecordId>,
    pub established: RecordId,
}

/// Find the single open-ended record of a history, if any.
///
/// # Errors
/// Returns [`KernelError::Validation`] when more than one open-ended record
/// exists, which means the aggregate was corrupted outside this kernel.
pub fn current_record<P>(history: &[SpanRecord<P>]) -> Result<Option<&SpanRecord<P>>, KernelError> {
    let mut current = None;
    for record in history {
        if record.interval.is_open() {
            if current.is_some() {
                return Err(KernelError::Validation(
                    "history contains more than one open-ended record".to_string(),
                ));
            }
            current = Some(record);
        }
    }
    Ok(current)
}

/// Establish a new open-ended record, superseding the current one if present.
///
/// The prior current record is closed at the day immediately preceding
/// `new_start`, so the two spans never overlap. Exactly two records are
/// touched (one closed, one created); the caller persists both as a single
/// unit of work.
///
/// # Errors
/// Returns [`KernelError::InvalidSequencing`] when `new_start` is not
/// strictly after the current record's start, or [`KernelError::Validation`]
/// when the history already violates the single-current invariant.
pub fn establish_current<P>(
    history: &mut Vec<SpanRecord<P>>,
    new_start: Date,
    payload: P,
) -> Result<SupersessionOutcome, KernelError> {
    let mut current_index = None;
    for (index, record) in history.iter().enumerate() {
        if record.interval.is_open() {
            if current_index.is_some() {
                return Err(KernelError::Validation(
                    "history contains more than one open-ended record".to_string(),
                ));
            }
            current_index = Some(index);
        }
    }

    let closed = match current_index {
        Some(index) => {
            let current_start = history[index].interval.start();
            if new_start <= current_start {
                return Err(KernelError::InvalidSequencing(format!(
                    "new record starting {new_start} must start strictly after the current record's start {current_start}"
                )));
            }
            let closing_day = new_start.previous_day().ok_or_else(|| {
                KernelError::Validation(format!("start date {new_start} has no preceding day"))
            })?;
            history[index].interval = DateInterval::closed(current_start, closing_day)?;
            Some(history[index].id)
        }
        None => None,
    };

    let established = RecordId::new();
    history.push(SpanRecord {
        id: established,
        interval: DateInterval::open_ended(new_start),
        payload,
    });

    Ok(SupersessionOutcome { closed, established })
}

/// Remove one record from a history that must never become empty.
///
/// Removing the current record intentionally leaves the history with no
/// current record; promoting a historical record back to current is the
/// separate, explicit [`reopen_latest`] operation.
///
/// # Errors
/// Returns [`KernelError::LastRecordProtected`] when the history holds a
/// single record, or [`KernelError::NotFound`] when `target` is not present.
pub fn remove_record<P>(
    history: &mut Vec<SpanRecord<P>>,
    target: RecordId,
) -> Result<SpanRecord<P>, KernelError> {
    if history.len() == 1 {
        return Err(KernelError::LastRecordProtected(
            "removal would leave the aggregate with zero records".to_string(),
        ));
    }
    let index = history
        .iter()
        .position(|record| record.id == target)
        .ok_or_else(|| KernelError::NotFound(format!("record {target} is not in this history")))?;
    Ok(history.remove(index))
}

/// Re-promote the most recently started record to current by clearing its
/// end date. This is the explicit counterpart to removing a current record.
///
/// # Errors
/// Returns [`KernelError::Validation`] when a current record already exists,
/// or [`KernelError::NotFound`] when the history is empty.
pub fn reopen_latest<P>(history: &mut [SpanRecord<P>]) -> Result<RecordId, KernelError> {
    if current_record(history)?.is_some() {
        return Err(KernelError::Validation(
            "history already has an open-ended record".to_string(),
        ));
    }
    let mut latest: Option<usize> = None;
    for (index, record) in history.iter().enumerate() {
        let is_later = match latest {
            Some(best) => record.interval.start() > history[best].interval.start(),
            None => true,
        };
        if is_later {
            latest = Some(index);
        }
    }
    let index = latest
        .ok_or_else(|| KernelError::NotFound("history has no records to reopen".to_string()))?;
    history[index].interval = DateInterval::open_ended(history[index].interval.start());
    Ok(history[index].id)
}

/// One desired record in a reconciliation target set: either an update of an
/// existing record (id present) or a brand new record (id absent).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordSpec<P> {
    pub id: Option<RecordId>,
    pub interval: DateInterval,
    pub payload: P,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RemovalPolicy {
    AllowEmpty,
    KeepAtLeastOne,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReconciliationPlan {
    pub added: Vec<RecordId>,
    pub updated: Vec<RecordId>,
    pub removed: Vec<RecordId>,
}

impl ReconciliationPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Replace an existing keyed collection with a desired target set in one
/// pass, computing the add/update/remove delta.
///
/// All duplicate checks run against the final desired state before any
/// mutation, so a failing reconciliation leaves the collection untouched and
/// processing order never matters. A desired spec whose id does not match any
/// existing record is created fresh with a new id. Updates that change
/// nothing are not reported, which makes reconciliation idempotent.
///
/// # Errors
/// Returns [`KernelError::DuplicateIdentity`] when the existing collection or
/// the desired set repeats a record id, [`KernelError::DuplicateDiscriminator`]
/// when two desired specs share a discriminator value, or
/// [`KernelError::LastRecordProtected`] when emptying a collection that the
/// policy requires to stay populated.
pub fn reconcile<P, K, F>(
    existing: &mut Vec<SpanRecord<P>>,
    desired: Vec<RecordSpec<P>>,
    discriminator: F,
    policy: RemovalPolicy,
) -> Result<ReconciliationPlan, KernelError>
where
    P: PartialEq,
    K: Ord + std::fmt::Debug,
    F: Fn(&RecordSpec<P>) -> K,
{
    let mut existing_ids = BTreeSet::new();
    for record in existing.iter() {
        if !existing_ids.insert(record.id) {
            return Err(KernelError::DuplicateIdentity(format!(
                "existing collection contains record {} more than once",
                record.id
            )));
        }
    }

    let mut referenced_ids = BTreeSet::new();
    for spec in &desired {
        if let Some(id) = spec.id {
            if !referenced_ids.insert(id) {
                return Err(KernelError::DuplicateIdentity(format!(
                    "desired set references record {id} more than once"
                )));
            }
        }
    }

    let mut seen_keys = BTreeSet::new();
    for spec in &desired {
        let key = discriminator(spec);
        if seen_keys.contains(&key) {
            return Err(KernelError::DuplicateDiscriminator(format!(
                "desired set contains discriminator {key:?} more than once"
            )));
        }
        seen_keys.insert(key);
    }

    if policy == RemovalPolicy::KeepAtLeastOne && desired.is_empty() && !existing.is_empty() {
        return Err(KernelError::LastRecordProtected(
            "reconciliation would leave the aggregate with zero records".to_string(),
        ));
    }

    let mut plan = ReconciliationPlan::default();

    existing.retain(|record| {
        if referenced_ids.contains(&record.id) {
            true
        } else {
            plan.removed.push(record.id);
            false
        }
    });

    for spec in desired {
        let RecordSpec { id, interval, payload } = spec;
        let target = id.and_then(|id| existing.iter_mut().find(|record| record.id == id));
        match target {
            Some(record) => {
                if record.interval != interval || record.payload != payload {
                    record.interval = interval;
                    record.payload = payload;
                    plan.updated.push(record.id);
                }
            }
            None => {
                let id = RecordId::new();
                existing.push(SpanRecord { id, interval, payload });
                plan.added.push(id);
            }
        }
    }

    Ok(plan)
}

/// Reject a candidate span that would overlap any member of a set required to
/// stay pairwise disjoint. Which side of a conflict is "wrong" is the
/// caller's business rule; this predicate only detects the collision.
///
/// # Errors
/// Returns [`KernelError::OverlapConflict`] naming the first conflicting span.
pub fn check_no_overlap(
    candidate: &DateInterval,
    existing: &[DateInterval],
) -> Result<(), KernelError> {
    for interval in existing {
        if candidate.overlaps(interval) {
            return Err(KernelError::OverlapConflict(format!(
                "candidate span {candidate} overlaps existing span {interval}"
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Framework {
    Scrum,
    Kanban,
    Hybrid,
}

impl Framework {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scrum => "scrum",
            Self::Kanban => "kanban",
            Self::Hybrid => "hybrid",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scrum" => Some(Self::Scrum),
            "kanban" => Some(Self::Kanban),
            "hybrid" => Some(Self::Hybrid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EstimationUnit {
    StoryPoints,
    Count,
    Hours,
}

impl EstimationUnit {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StoryPoints => "story_points",
            Self::Count => "count",
            Self::Hours => "hours",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "story_points" => Some(Self::StoryPoints),
            "count" => Some(Self::Count),
            "hours" => Some(Self::Hours),
            _ => None,
        }
    }
}

/// How a team works during one span of its history. Exactly one operating
/// model is current per team; prior models stay as closed history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct OperatingModel {
    pub framework: Framework,
    pub estimation: EstimationUnit,
}

/// A link between a team and a team in an external tracker workspace. The
/// `(workspace, external_team)` pair is the reconciliation discriminator.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TeamMapping {
    pub workspace: String,
    pub external_team: String,
}

impl TeamMapping {
    #[must_use]
    pub fn discriminator(&self) -> (String, String) {
        (self.workspace.clone(), self.external_team.clone())
    }
}

/// One KPI checkpoint of a team's measurement plan. The checkpoint's date
/// (the span start) is the reconciliation discriminator: one checkpoint per
/// team per day.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub metric: String,
    pub target: f64,
}

/// A reporting relationship between two teams, valid during its span. Spans
/// for the same parent/child pair must stay pairwise disjoint.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TeamMembership {
    pub parent_team: String,
    pub child_team: String,
}
