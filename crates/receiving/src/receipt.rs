use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stocktake_core::{Aggregate, AggregateId, AggregateRoot, BranchId, DomainError};
use stocktake_events::Event;
use stocktake_products::ProductId;
use stocktake_serials::SerialNumber;
use stocktake_stock::StockUnitId;

/// Goods receipt identifier (branch-scoped via `branch_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GoodsReceiptId(pub AggregateId);

impl GoodsReceiptId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for GoodsReceiptId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Receipt status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Draft,
    Posted,
}

/// Receipt line item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptLine {
    pub line_no: u32,
    pub product_id: ProductId,
    pub quantity: u32,
}

/// One unit issued at post time: a serial bound to a stock unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedUnit {
    pub unit_id: StockUnitId,
    pub serial: SerialNumber,
    pub product_id: ProductId,
    pub line_no: u32,
}

/// Aggregate root: GoodsReceipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoodsReceipt {
    id: GoodsReceiptId,
    branch_id: Option<BranchId>,
    reference: Option<String>,
    status: ReceiptStatus,
    lines: Vec<ReceiptLine>,
    issued: BTreeSet<SerialNumber>,
    printed: BTreeSet<SerialNumber>,
    version: u64,
    created: bool,
}

impl GoodsReceipt {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: GoodsReceiptId) -> Self {
        Self {
            id,
            branch_id: None,
            reference: None,
            status: ReceiptStatus::Draft,
            lines: Vec::new(),
            issued: BTreeSet::new(),
            printed: BTreeSet::new(),
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> GoodsReceiptId {
        self.id
    }

    pub fn branch_id(&self) -> Option<BranchId> {
        self.branch_id
    }

    pub fn status(&self) -> ReceiptStatus {
        self.status
    }

    pub fn lines(&self) -> &[ReceiptLine] {
        &self.lines
    }

    pub fn issued_serials(&self) -> &BTreeSet<SerialNumber> {
        &self.issued
    }

    pub fn printed_serials(&self) -> &BTreeSet<SerialNumber> {
        &self.printed
    }
}

impl AggregateRoot for GoodsReceipt {
    type Id = GoodsReceiptId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateReceipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateReceipt {
    pub branch_id: BranchId,
    pub receipt_id: GoodsReceiptId,
    /// Free-form supplier/delivery reference (e.g. a delivery note number).
    pub reference: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AddReceiptLine (only allowed in Draft).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddReceiptLine {
    pub branch_id: BranchId,
    pub receipt_id: GoodsReceiptId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Command: PostReceipt.
///
/// The application layer reserves one contiguous serial block per line
/// beforehand and passes the resulting units in. If this command fails, the
/// reserved serials are retired (a gap in the numbering space), never reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostReceipt {
    pub branch_id: BranchId,
    pub receipt_id: GoodsReceiptId,
    pub issued: Vec<IssuedUnit>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkLabelsPrinted.
///
/// Idempotent: already-printed serials are skipped; if nothing remains to
/// mark, no event is emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkLabelsPrinted {
    pub branch_id: BranchId,
    pub receipt_id: GoodsReceiptId,
    /// `None` marks every serial of the receipt.
    pub serials: Option<Vec<SerialNumber>>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptCommand {
    CreateReceipt(CreateReceipt),
    AddReceiptLine(AddReceiptLine),
    PostReceipt(PostReceipt),
    MarkLabelsPrinted(MarkLabelsPrinted),
}

/// Event: ReceiptCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptCreated {
    pub branch_id: BranchId,
    pub receipt_id: GoodsReceiptId,
    pub reference: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ReceiptLineAdded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptLineAdded {
    pub branch_id: BranchId,
    pub receipt_id: GoodsReceiptId,
    pub line_no: u32,
    pub product_id: ProductId,
    pub quantity: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ReceiptPosted.
///
/// Carries the full issued batch; the stock-units and barcode-catalog
/// projections materialize one unit / one catalog row per entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptPosted {
    pub branch_id: BranchId,
    pub receipt_id: GoodsReceiptId,
    pub issued: Vec<IssuedUnit>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LabelsPrinted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelsPrinted {
    pub branch_id: BranchId,
    pub receipt_id: GoodsReceiptId,
    /// Only serials newly marked by this command (never repeats).
    pub serials: Vec<SerialNumber>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptEvent {
    ReceiptCreated(ReceiptCreated),
    ReceiptLineAdded(ReceiptLineAdded),
    ReceiptPosted(ReceiptPosted),
    LabelsPrinted(LabelsPrinted),
}

impl Event for ReceiptEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ReceiptEvent::ReceiptCreated(_) => "receiving.receipt.created",
            ReceiptEvent::ReceiptLineAdded(_) => "receiving.receipt.line_added",
            ReceiptEvent::ReceiptPosted(_) => "receiving.receipt.posted",
            ReceiptEvent::LabelsPrinted(_) => "receiving.receipt.labels_printed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ReceiptEvent::ReceiptCreated(e) => e.occurred_at,
            ReceiptEvent::ReceiptLineAdded(e) => e.occurred_at,
            ReceiptEvent::ReceiptPosted(e) => e.occurred_at,
            ReceiptEvent::LabelsPrinted(e) => e.occurred_at,
        }
    }
}

impl Aggregate for GoodsReceipt {
    type Command = ReceiptCommand;
    type Event = ReceiptEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ReceiptEvent::ReceiptCreated(e) => {
                self.id = e.receipt_id;
                self.branch_id = Some(e.branch_id);
                self.reference = e.reference.clone();
                self.status = ReceiptStatus::Draft;
                self.lines.clear();
                self.created = true;
            }
            ReceiptEvent::ReceiptLineAdded(e) => {
                self.lines.push(ReceiptLine {
                    line_no: e.line_no,
                    product_id: e.product_id,
                    quantity: e.quantity,
                });
            }
            ReceiptEvent::ReceiptPosted(e) => {
                self.issued = e.issued.iter().map(|u| u.serial).collect();
                self.status = ReceiptStatus::Posted;
            }
            ReceiptEvent::LabelsPrinted(e) => {
                self.printed.extend(e.serials.iter().copied());
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            ReceiptCommand::CreateReceipt(cmd) => self.handle_create(cmd),
            ReceiptCommand::AddReceiptLine(cmd) => self.handle_add_line(cmd),
            ReceiptCommand::PostReceipt(cmd) => self.handle_post(cmd),
            ReceiptCommand::MarkLabelsPrinted(cmd) => self.handle_mark_printed(cmd),
        }
    }
}

impl GoodsReceipt {
    fn ensure_branch(&self, branch_id: BranchId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.branch_id != Some(branch_id) {
            return Err(DomainError::invariant("branch mismatch"));
        }
        Ok(())
    }

    fn ensure_receipt_id(&self, receipt_id: GoodsReceiptId) -> Result<(), DomainError> {
        if self.id != receipt_id {
            return Err(DomainError::invariant("receipt_id mismatch"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateReceipt) -> Result<Vec<ReceiptEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("receipt already exists"));
        }

        Ok(vec![ReceiptEvent::ReceiptCreated(ReceiptCreated {
            branch_id: cmd.branch_id,
            receipt_id: cmd.receipt_id,
            reference: cmd.reference.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_add_line(&self, cmd: &AddReceiptLine) -> Result<Vec<ReceiptEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_branch(cmd.branch_id)?;
        self.ensure_receipt_id(cmd.receipt_id)?;

        if self.status != ReceiptStatus::Draft {
            return Err(DomainError::invariant(
                "cannot modify a receipt once posted",
            ));
        }

        if cmd.quantity == 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }

        let next_line_no = (self.lines.len() as u32) + 1;
        Ok(vec![ReceiptEvent::ReceiptLineAdded(ReceiptLineAdded {
            branch_id: cmd.branch_id,
            receipt_id: cmd.receipt_id,
            line_no: next_line_no,
            product_id: cmd.product_id,
            quantity: cmd.quantity,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_post(&self, cmd: &PostReceipt) -> Result<Vec<ReceiptEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_branch(cmd.branch_id)?;
        self.ensure_receipt_id(cmd.receipt_id)?;

        // Invariant: a receipt posts exactly once; the issued batch is final.
        if self.status != ReceiptStatus::Draft {
            return Err(DomainError::invariant("receipt is already posted"));
        }

        if self.lines.is_empty() {
            return Err(DomainError::validation("cannot post a receipt without lines"));
        }

        // Every line must be issued in full, against its own product.
        for line in &self.lines {
            let issued_for_line = cmd
                .issued
                .iter()
                .filter(|u| u.line_no == line.line_no)
                .collect::<Vec<_>>();

            if issued_for_line.len() != line.quantity as usize {
                return Err(DomainError::validation(format!(
                    "line {} expects {} units, got {}",
                    line.line_no,
                    line.quantity,
                    issued_for_line.len()
                )));
            }
            if issued_for_line.iter().any(|u| u.product_id != line.product_id) {
                return Err(DomainError::validation(format!(
                    "line {} contains units for a different product",
                    line.line_no
                )));
            }
        }

        let expected_total: usize = self.lines.iter().map(|l| l.quantity as usize).sum();
        if cmd.issued.len() != expected_total {
            return Err(DomainError::validation(format!(
                "issued batch has {} units, lines require {}",
                cmd.issued.len(),
                expected_total
            )));
        }

        // The batch itself must be collision-free.
        let distinct: BTreeSet<SerialNumber> = cmd.issued.iter().map(|u| u.serial).collect();
        if distinct.len() != cmd.issued.len() {
            return Err(DomainError::invariant("issued batch contains duplicate serials"));
        }

        Ok(vec![ReceiptEvent::ReceiptPosted(ReceiptPosted {
            branch_id: cmd.branch_id,
            receipt_id: cmd.receipt_id,
            issued: cmd.issued.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_mark_printed(
        &self,
        cmd: &MarkLabelsPrinted,
    ) -> Result<Vec<ReceiptEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_branch(cmd.branch_id)?;
        self.ensure_receipt_id(cmd.receipt_id)?;

        if self.status != ReceiptStatus::Posted {
            return Err(DomainError::invariant(
                "labels can only be printed for a posted receipt",
            ));
        }

        let requested: Vec<SerialNumber> = match &cmd.serials {
            Some(list) => {
                if let Some(unknown) = list.iter().find(|s| !self.issued.contains(s)) {
                    return Err(DomainError::validation(format!(
                        "serial {unknown} was not issued by this receipt"
                    )));
                }
                list.clone()
            }
            None => self.issued.iter().copied().collect(),
        };

        // Idempotent: skip already-printed serials.
        let newly_printed: Vec<SerialNumber> = requested
            .into_iter()
            .filter(|s| !self.printed.contains(s))
            .collect();

        if newly_printed.is_empty() {
            return Ok(vec![]);
        }

        Ok(vec![ReceiptEvent::LabelsPrinted(LabelsPrinted {
            branch_id: cmd.branch_id,
            receipt_id: cmd.receipt_id,
            serials: newly_printed,
            occurred_at: cmd.occurred_at,
        })])
    }
}
