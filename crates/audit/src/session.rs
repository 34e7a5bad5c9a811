use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stocktake_core::{Aggregate, AggregateId, AggregateRoot, BranchId, DomainError};
use stocktake_events::Event;
use stocktake_products::ProductId;
use stocktake_serials::{ScanMode, SerialNumber};
use stocktake_stock::StockUnitId;

/// Audit session identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditSessionId(pub AggregateId);

impl AuditSessionId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for AuditSessionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Draft,
    Confirmed,
}

/// One expected unit, denormalized at session start.
///
/// Carries everything the counting UI needs so the session never joins back
/// to live stock. If the product is renamed mid-count, the session keeps
/// showing the name it started with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedUnit {
    pub unit_id: StockUnitId,
    pub serial: SerialNumber,
    pub product_id: ProductId,
    pub product_name: String,
}

/// Classification of one scan against the frozen snapshot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanOutcome {
    /// First scan of an expected unit.
    Matched,
    /// Repeated scan of an expected unit; counts are unchanged.
    AlreadyScanned,
    /// A known unit that is not part of this session's snapshot
    /// (e.g. received after the session started, or from another branch).
    Unexpected,
}

/// What to do with units that were expected but never scanned.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStrategy {
    /// Flag missing units for a manual follow-up check.
    MarkPending,
    /// Write missing units off immediately.
    MarkLost,
}

/// Aggregate root: AuditSession.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditSession {
    id: AuditSessionId,
    branch_id: Option<BranchId>,
    status: AuditStatus,
    expected: Vec<ExpectedUnit>,
    expected_serials: BTreeSet<SerialNumber>,
    scanned: BTreeSet<SerialNumber>,
    version: u64,
    created: bool,
}

impl AuditSession {
    /// Create an empty, not-yet-started session instance for rehydration.
    pub fn empty(id: AuditSessionId) -> Self {
        Self {
            id,
            branch_id: None,
            status: AuditStatus::Draft,
            expected: Vec::new(),
            expected_serials: BTreeSet::new(),
            scanned: BTreeSet::new(),
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> AuditSessionId {
        self.id
    }

    pub fn branch_id(&self) -> Option<BranchId> {
        self.branch_id
    }

    pub fn status(&self) -> AuditStatus {
        self.status
    }

    /// The frozen snapshot, in start order.
    pub fn expected(&self) -> &[ExpectedUnit] {
        &self.expected
    }

    pub fn expected_count(&self) -> usize {
        self.expected.len()
    }

    pub fn scanned_count(&self) -> usize {
        self.scanned.len()
    }

    pub fn is_scanned(&self, serial: SerialNumber) -> bool {
        self.scanned.contains(&serial)
    }

    /// Expected units that have not been scanned, in snapshot order.
    pub fn missing_units(&self) -> Vec<ExpectedUnit> {
        self.expected
            .iter()
            .filter(|u| !self.scanned.contains(&u.serial))
            .cloned()
            .collect()
    }

    /// Classify a serial against the snapshot and scan log.
    pub fn classify(&self, serial: SerialNumber) -> ScanOutcome {
        if !self.expected_serials.contains(&serial) {
            ScanOutcome::Unexpected
        } else if self.scanned.contains(&serial) {
            ScanOutcome::AlreadyScanned
        } else {
            ScanOutcome::Matched
        }
    }
}

impl AggregateRoot for AuditSession {
    type Id = AuditSessionId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: StartAudit.
///
/// The application layer computes the snapshot (all on-shelf units of the
/// branch) and claims the one-open-session-per-branch slot before dispatching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartAudit {
    pub branch_id: BranchId,
    pub session_id: AuditSessionId,
    pub expected: Vec<ExpectedUnit>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordScan.
///
/// `serial` is the already-resolved serial of a unit known to the barcode
/// catalog. Codes that resolve to nothing never reach the aggregate; they are
/// rejected upstream as not-found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordScan {
    pub branch_id: BranchId,
    pub session_id: AuditSessionId,
    pub serial: SerialNumber,
    pub code: String,
    pub mode: ScanMode,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ConfirmAudit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmAudit {
    pub branch_id: BranchId,
    pub session_id: AuditSessionId,
    pub strategy: ResolutionStrategy,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionCommand {
    StartAudit(StartAudit),
    RecordScan(RecordScan),
    ConfirmAudit(ConfirmAudit),
}

/// Event: AuditStarted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStarted {
    pub branch_id: BranchId,
    pub session_id: AuditSessionId,
    pub expected: Vec<ExpectedUnit>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ScanRecorded.
///
/// Every scan is recorded with its outcome, including repeats and unexpected
/// units. The outcome is decided once, here, under the stream's optimistic
/// concurrency check, so two concurrent scans of the same serial cannot both
/// classify as a first match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecorded {
    pub branch_id: BranchId,
    pub session_id: AuditSessionId,
    pub serial: SerialNumber,
    pub code: String,
    pub mode: ScanMode,
    pub outcome: ScanOutcome,
    pub occurred_at: DateTime<Utc>,
}

/// Event: AuditConfirmed.
///
/// Carries the strategy and the full missing set so downstream stock writes
/// derive from this single event, not from separately queried state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditConfirmed {
    pub branch_id: BranchId,
    pub session_id: AuditSessionId,
    pub strategy: ResolutionStrategy,
    pub missing: Vec<ExpectedUnit>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    AuditStarted(AuditStarted),
    ScanRecorded(ScanRecorded),
    AuditConfirmed(AuditConfirmed),
}

impl Event for SessionEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SessionEvent::AuditStarted(_) => "audit.session.started",
            SessionEvent::ScanRecorded(_) => "audit.session.scan_recorded",
            SessionEvent::AuditConfirmed(_) => "audit.session.confirmed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            SessionEvent::AuditStarted(e) => e.occurred_at,
            SessionEvent::ScanRecorded(e) => e.occurred_at,
            SessionEvent::AuditConfirmed(e) => e.occurred_at,
        }
    }
}

impl Aggregate for AuditSession {
    type Command = SessionCommand;
    type Event = SessionEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            SessionEvent::AuditStarted(e) => {
                self.id = e.session_id;
                self.branch_id = Some(e.branch_id);
                self.status = AuditStatus::Draft;
                self.expected = e.expected.clone();
                self.expected_serials = e.expected.iter().map(|u| u.serial).collect();
                self.scanned.clear();
                self.created = true;
            }
            SessionEvent::ScanRecorded(e) => {
                // Only a first match moves the count. Unexpected scans stay
                // in the log and never join the expected set.
                if e.outcome == ScanOutcome::Matched {
                    self.scanned.insert(e.serial);
                }
            }
            SessionEvent::AuditConfirmed(_) => {
                self.status = AuditStatus::Confirmed;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            SessionCommand::StartAudit(cmd) => self.handle_start(cmd),
            SessionCommand::RecordScan(cmd) => self.handle_scan(cmd),
            SessionCommand::ConfirmAudit(cmd) => self.handle_confirm(cmd),
        }
    }
}

impl AuditSession {
    fn ensure_branch(&self, branch_id: BranchId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.branch_id != Some(branch_id) {
            return Err(DomainError::invariant("branch mismatch"));
        }
        Ok(())
    }

    fn ensure_session_id(&self, session_id: AuditSessionId) -> Result<(), DomainError> {
        if self.id != session_id {
            return Err(DomainError::invariant("session_id mismatch"));
        }
        Ok(())
    }

    fn handle_start(&self, cmd: &StartAudit) -> Result<Vec<SessionEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("audit session already started"));
        }

        // The snapshot itself must be collision-free.
        let distinct: BTreeSet<SerialNumber> = cmd.expected.iter().map(|u| u.serial).collect();
        if distinct.len() != cmd.expected.len() {
            return Err(DomainError::invariant(
                "expected snapshot contains duplicate serials",
            ));
        }

        Ok(vec![SessionEvent::AuditStarted(AuditStarted {
            branch_id: cmd.branch_id,
            session_id: cmd.session_id,
            expected: cmd.expected.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_scan(&self, cmd: &RecordScan) -> Result<Vec<SessionEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_branch(cmd.branch_id)?;
        self.ensure_session_id(cmd.session_id)?;

        if self.status != AuditStatus::Draft {
            return Err(DomainError::conflict("audit session is closed"));
        }

        let outcome = self.classify(cmd.serial);

        Ok(vec![SessionEvent::ScanRecorded(ScanRecorded {
            branch_id: cmd.branch_id,
            session_id: cmd.session_id,
            serial: cmd.serial,
            code: cmd.code.clone(),
            mode: cmd.mode,
            outcome,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_confirm(&self, cmd: &ConfirmAudit) -> Result<Vec<SessionEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_branch(cmd.branch_id)?;
        self.ensure_session_id(cmd.session_id)?;

        if self.status != AuditStatus::Draft {
            return Err(DomainError::conflict("audit session is already confirmed"));
        }

        Ok(vec![SessionEvent::AuditConfirmed(AuditConfirmed {
            branch_id: cmd.branch_id,
            session_id: cmd.session_id,
            strategy: cmd.strategy,
            missing: self.missing_units(),
            occurred_at: cmd.occurred_at,
        })])
    }
}
