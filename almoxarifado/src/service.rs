//! CustodyService - the cautela workflow.
//!
//! Runs every transition through the custody policy, moves ammunition stock
//! and appends to the audit trail. Transitions are serialized so running
//! holdings and stock checks see a consistent view.

use chrono::{DateTime, Utc};
use custody_policy::{
    check_dual_control, check_quantity, check_window, ActorId, ActorProfile, Authorizer,
    Capability, CustodyOperation, CustodyPolicy, Denial, OperationKind, PolicyEvaluator,
    WindowCheck,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditDraft, AuditError, AuditEvent, AuditTrail};
use crate::clock::{Clock, SystemClock};
use crate::inventory::{
    AssetClass, Inventory, InventoryError, StockEntry, StockLevel, StockMemo, StockMovement,
    DEFAULT_LOCATION,
};
use crate::permanent::{PeriodicCheck, PermanentAssignment, PermanentError, PermanentRegister};
use crate::store::{CautelaStore, InMemoryCautelaStore, StoreError};
use crate::types::{
    AssetId, Cautela, CautelaItem, CautelaStatus, Holdings, ItemKind, ItemSpec, LotId,
    MAX_LINE_QUANTITY,
};

/// Capability to receive and write off stock outside a cautela.
pub const MOVE_STOCK_CAPABILITY: &str = "almoxarifado.movimentar_estoque";
/// Capability to read the ammunition book.
pub const AMMUNITION_BOOK_CAPABILITY: &str = "almoxarifado.ver_livro_municao";
/// Capability to open and end permanent custody terms.
pub const PERMANENT_CUSTODY_CAPABILITY: &str = "almoxarifado.gerir_assignacoes_fixas";
/// Capability to record periodic checks of permanently assigned assets.
pub const PERIODIC_CHECK_CAPABILITY: &str = "almoxarifado.verificacao_periodica";

/// Error types for the custody workflow.
#[derive(Debug, thiserror::Error)]
pub enum CustodyError {
    /// The custody policy rejected the operation
    #[error("Denied by policy: {0}")]
    Denied(#[from] Denial),

    #[error("Cautela {0} not found")]
    NotFound(Uuid),

    /// Operation not allowed from the current status
    #[error("Cannot {operation} cautela {id} while it is {status}")]
    InvalidTransition {
        id: Uuid,
        status: CautelaStatus,
        operation: &'static str,
    },

    /// Requester has overdue custody outstanding
    #[error("{requester} has overdue custody {cautela} and cannot request more")]
    Blocked { requester: ActorId, cautela: Uuid },

    #[error("A cautela needs at least one item")]
    NoItems,

    /// Item does not exist, is inactive or is of the wrong class
    #[error("Invalid {kind} {object_id}: {reason}")]
    InvalidItem {
        kind: ItemKind,
        object_id: u64,
        reason: &'static str,
    },

    /// Line quantity is zero or above [`MAX_LINE_QUANTITY`]
    #[error("Quantity {quantity} for {kind} {object_id} must be between 1 and {MAX_LINE_QUANTITY}")]
    InvalidQuantity {
        kind: ItemKind,
        object_id: u64,
        quantity: u32,
    },

    /// Returned rounds exceed what was issued from a lot
    #[error("Cannot return {returned} rounds of lot {lot}: {issued} were issued")]
    ExcessReturn { lot: LotId, issued: u32, returned: u32 },

    #[error("Only the designated supervisor {expected} may do this ({actual} tried)")]
    NotDesignatedSupervisor { expected: ActorId, actual: ActorId },

    #[error("{actor} may not cancel cautela {id}")]
    NotPermitted { actor: ActorId, id: Uuid },

    #[error("{actor} lacks the {capability} capability")]
    MissingCapability { actor: ActorId, capability: &'static str },

    #[error("Ammunition calibre {ammunition} does not match the weapons ({weapons:?})")]
    CalibreMismatch {
        ammunition: String,
        weapons: Vec<String>,
    },

    /// Weapon under maintenance that impacts availability
    #[error("Weapon {0} is under maintenance and cannot be delivered")]
    UnderMaintenance(AssetId),

    #[error("Inventory error: {0}")]
    Inventory(#[from] InventoryError),

    #[error("Permanent custody error: {0}")]
    Permanent(#[from] PermanentError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),
}

pub type Result<T> = std::result::Result<T, CustodyError>;

/// Configuration for the CustodyService.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Stock location ammunition is reserved from and returned to
    pub stock_location: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            stock_location: DEFAULT_LOCATION.to_string(),
        }
    }
}

/// A new custody request.
#[derive(Debug, Clone)]
pub struct CustodyRequest {
    pub requester: ActorProfile,
    /// Supervisor expected to approve
    pub supervisor: Option<ActorId>,
    pub items: Vec<ItemSpec>,
    pub expected_return: Option<DateTime<Utc>>,
    pub reason: String,
    pub notes: String,
}

impl CustodyRequest {
    pub fn new(requester: ActorProfile) -> Self {
        Self {
            requester,
            supervisor: None,
            items: Vec::new(),
            expected_return: None,
            reason: String::new(),
            notes: String::new(),
        }
    }

    pub fn with_supervisor(mut self, supervisor: impl Into<ActorId>) -> Self {
        self.supervisor = Some(supervisor.into());
        self
    }

    pub fn with_item(mut self, item: ItemSpec) -> Self {
        self.items.push(item);
        self
    }

    pub fn with_expected_return(mut self, at: DateTime<Utc>) -> Self {
        self.expected_return = Some(at);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }
}

/// What comes back at return time.
#[derive(Debug, Clone)]
pub struct ReturnReceipt {
    /// Clerk receiving the equipment
    pub receiver: ActorId,
    /// Supervisor signing off, checked against the designated one
    pub supervisor: Option<ActorId>,
    pub checklist: Option<serde_json::Value>,
    /// Unused rounds handed back, per lot
    pub returned_ammunition: BTreeMap<LotId, u32>,
}

impl ReturnReceipt {
    pub fn new(receiver: impl Into<ActorId>) -> Self {
        Self {
            receiver: receiver.into(),
            supervisor: None,
            checklist: None,
            returned_ammunition: BTreeMap::new(),
        }
    }

    pub fn signed_by(mut self, supervisor: impl Into<ActorId>) -> Self {
        self.supervisor = Some(supervisor.into());
        self
    }

    pub fn with_checklist(mut self, checklist: serde_json::Value) -> Self {
        self.checklist = Some(checklist);
        self
    }

    pub fn with_returned(mut self, lot: LotId, quantity: u32) -> Self {
        let total = self.returned_ammunition.entry(lot).or_default();
        *total = total.saturating_add(quantity);
        self
    }
}

/// A stock change made outside any cautela.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockChange {
    /// Rounds received into the armory
    Receive(u32),
    /// Rounds taken out: training use, losses, count corrections
    WriteOff(u32),
}

/// The cautela workflow service.
pub struct CustodyService {
    evaluator: PolicyEvaluator,
    store: Arc<dyn CautelaStore>,
    inventory: Arc<Inventory>,
    permanent: Arc<PermanentRegister>,
    audit: AuditTrail,
    clock: Arc<dyn Clock>,
    config: ServiceConfig,
    /// Serializes state transitions
    transitions: Mutex<()>,
}

impl CustodyService {
    /// Create a service with an in-memory store and the system clock.
    pub fn new(
        policy: Arc<CustodyPolicy>,
        authorizer: Arc<dyn Authorizer>,
        inventory: Arc<Inventory>,
    ) -> Self {
        info!(policy = %policy.fingerprint(), "Creating CustodyService");
        Self {
            evaluator: PolicyEvaluator::new(policy, authorizer),
            store: Arc::new(InMemoryCautelaStore::new()),
            inventory,
            permanent: Arc::new(PermanentRegister::new()),
            audit: AuditTrail::new(),
            clock: Arc::new(SystemClock),
            config: ServiceConfig::default(),
            transitions: Mutex::new(()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn CautelaStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_permanent_register(mut self, register: Arc<PermanentRegister>) -> Self {
        self.permanent = register;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_audit(mut self, audit: AuditTrail) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn policy(&self) -> &CustodyPolicy {
        self.evaluator.policy()
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    // ---- transitions ----

    /// Open a custody request in `Pending`.
    pub async fn request(&self, request: CustodyRequest) -> Result<Cautela> {
        let _guard = self.transitions.lock().await;
        let now = self.clock.now();
        let requester = &request.requester.id;

        let history = self.store.list_for_requester(requester).await?;
        if let Some(blocking) = history
            .iter()
            .find(|c| c.status == CautelaStatus::Overdue || c.is_past_due(now))
        {
            warn!(
                requester = %requester,
                cautela_id = %blocking.id,
                "Request blocked by overdue custody"
            );
            return Err(CustodyError::Blocked {
                requester: requester.clone(),
                cautela: blocking.id,
            });
        }

        if request.items.is_empty() {
            return Err(CustodyError::NoItems);
        }
        let items = request
            .items
            .iter()
            .map(|spec| self.validate_item(*spec))
            .collect::<Result<Vec<_>>>()?;

        let cautela = Cautela {
            id: Uuid::new_v4(),
            requester: request.requester,
            supervisor: request.supervisor,
            issuer: None,
            receiver: None,
            status: CautelaStatus::Pending,
            items,
            reason: request.reason,
            notes: request.notes,
            checklist_out: None,
            checklist_back: None,
            expected_return: request.expected_return,
            requested_at: now,
            approved_at: None,
            withdrawn_at: None,
            returned_at: None,
            cancelled_at: None,
            rev: 1,
        };
        self.store.insert(cautela.clone()).await?;

        self.audit
            .append(
                AuditDraft::new(cautela.audit_object(), AuditEvent::Request, now)
                    .by(&cautela.requester.id)
                    .message("Custody request created")
                    .after(cautela.snapshot()),
            )
            .await;

        info!(
            cautela_id = %cautela.id,
            requester = %cautela.requester.id,
            items = cautela.items.len(),
            ammunition = cautela.ammunition_total(),
            "Cautela requested"
        );
        Ok(cautela)
    }

    /// Approve a pending cautela and reserve its ammunition.
    pub async fn approve(&self, id: Uuid, supervisor: &ActorId) -> Result<Cautela> {
        let _guard = self.transitions.lock().await;
        let now = self.clock.now();
        let mut cautela = self.load(id).await?;

        self.expect_status(&cautela, &[CautelaStatus::Pending], "approve")?;
        Self::check_designated_supervisor(&cautela, supervisor)?;

        let op = CustodyOperation::new(OperationKind::Withdrawal, cautela.requester.clone(), now)
            .with_approver(supervisor.clone())
            .acting_as(supervisor.clone());
        check_dual_control(self.policy(), &op)?;

        self.check_calibres(&cautela)?;

        let op = self.with_running_totals(op, &cautela).await?;
        let cap = check_quantity(self.policy(), &op)?;
        debug!(
            cautela_id = %id,
            cap = cap.limits.ammunition_total_max,
            source = %cap.source,
            "Cap satisfied"
        );

        let memo = StockMemo::new("cautela approved")
            .by(supervisor)
            .for_cautela(id)
            .at(now);
        let lines = cautela.ammunition_lines();
        self.inventory
            .apply_batch(StockMovement::Reserve, &self.config.stock_location, &lines, &memo)?;

        let before = cautela.snapshot();
        cautela.status = CautelaStatus::Approved;
        cautela.supervisor = Some(supervisor.clone());
        cautela.approved_at = Some(now);

        let cautela = self
            .commit(cautela, Some((StockMovement::Reserve, lines.as_slice())), &memo)
            .await?;

        self.audit
            .append(
                AuditDraft::new(cautela.audit_object(), AuditEvent::Approve, now)
                    .by(supervisor)
                    .message("Cautela approved")
                    .before(before)
                    .after(cautela.snapshot()),
            )
            .await;

        info!(cautela_id = %id, supervisor = %supervisor, "Cautela approved");
        Ok(cautela)
    }

    /// Hand the equipment over.
    pub async fn deliver(
        &self,
        id: Uuid,
        issuer: &ActorId,
        checklist: Option<serde_json::Value>,
    ) -> Result<Cautela> {
        let _guard = self.transitions.lock().await;
        let now = self.clock.now();
        let mut cautela = self.load(id).await?;

        self.expect_status(&cautela, &[CautelaStatus::Approved], "deliver")?;

        let requester = cautela.requester.clone();
        let mut op = CustodyOperation::new(OperationKind::Withdrawal, requester, now)
            .with_issuer(issuer.clone());
        op.approver = cautela.supervisor.clone();
        let op = self.with_running_totals(op, &cautela).await?;

        let evaluation = self.evaluator.evaluate(&op);
        let window_override = evaluation.decision.into_result()?;

        if let Some(asset) = self.inventory.blocked_by_maintenance(&cautela.weapon_ids()) {
            warn!(cautela_id = %id, asset_id = asset, "Delivery blocked by maintenance");
            return Err(CustodyError::UnderMaintenance(asset));
        }

        let memo = StockMemo::new("cautela delivered")
            .by(issuer)
            .for_cautela(id)
            .at(now);
        let lines = cautela.ammunition_lines();
        self.inventory.apply_batch(
            StockMovement::ConsumeReserved,
            &self.config.stock_location,
            &lines,
            &memo,
        )?;

        let before = cautela.snapshot();
        cautela.status = CautelaStatus::Open;
        cautela.issuer = Some(issuer.clone());
        cautela.withdrawn_at = Some(now);
        cautela.checklist_out = checklist;

        let cautela = self
            .commit(cautela, Some((StockMovement::ConsumeReserved, lines.as_slice())), &memo)
            .await?;

        let message = if window_override {
            format!(
                "Cautela delivered outside the withdrawal window (local {}) by exception",
                evaluation.local_time.format("%H:%M")
            )
        } else {
            "Cautela delivered".to_string()
        };
        self.audit
            .append(
                AuditDraft::new(cautela.audit_object(), AuditEvent::Deliver, now)
                    .by(issuer)
                    .message(message)
                    .before(before)
                    .after(cautela.snapshot()),
            )
            .await;

        info!(cautela_id = %id, issuer = %issuer, window_override, "Cautela delivered");
        Ok(cautela)
    }

    /// Receive the equipment back and close the cautela.
    pub async fn return_items(&self, id: Uuid, receipt: ReturnReceipt) -> Result<Cautela> {
        let _guard = self.transitions.lock().await;
        let now = self.clock.now();
        let mut cautela = self.load(id).await?;

        self.expect_status(
            &cautela,
            &[CautelaStatus::Open, CautelaStatus::Overdue, CautelaStatus::Approved],
            "return",
        )?;

        let mut op = CustodyOperation::new(OperationKind::Return, cautela.requester.clone(), now)
            .with_issuer(receipt.receiver.clone());
        op.approver = cautela.supervisor.clone();
        check_dual_control(self.policy(), &op)?;
        let window = check_window(self.policy(), &op, self.evaluator.authorizer())?;

        if let Some(supervisor) = &receipt.supervisor {
            Self::check_designated_supervisor(&cautela, supervisor)?;
        }

        let delivered = cautela.status != CautelaStatus::Approved;
        let (movement, lines) = if delivered {
            (StockMovement::Restock, self.returned_lines(&cautela, &receipt)?)
        } else {
            (StockMovement::ReleaseReserved, cautela.ammunition_lines())
        };
        let memo = StockMemo::new("cautela returned")
            .by(&receipt.receiver)
            .for_cautela(id)
            .at(now);
        self.inventory
            .apply_batch(movement, &self.config.stock_location, &lines, &memo)?;

        let before = cautela.snapshot();
        cautela.status = CautelaStatus::Closed;
        cautela.receiver = Some(receipt.receiver.clone());
        cautela.returned_at = Some(now);
        cautela.checklist_back = receipt.checklist;

        let cautela = self.commit(cautela, Some((movement, lines.as_slice())), &memo).await?;

        let mut message = if delivered {
            "Cautela returned and closed".to_string()
        } else {
            "Cautela closed before delivery, reservations released".to_string()
        };
        if window == WindowCheck::Overridden {
            message.push_str(" (outside the return window by exception)");
        }
        self.audit
            .append(
                AuditDraft::new(cautela.audit_object(), AuditEvent::Return, now)
                    .by(&receipt.receiver)
                    .message(message)
                    .before(before)
                    .after(cautela.snapshot()),
            )
            .await;

        info!(
            cautela_id = %id,
            receiver = %receipt.receiver,
            restocked = lines.iter().fold(0u32, |acc, (_, q)| acc.saturating_add(*q)),
            "Cautela closed"
        );
        Ok(cautela)
    }

    /// Withdraw a cautela before delivery. Allowed for the requester and the
    /// designated supervisor.
    pub async fn cancel(&self, id: Uuid, actor: &ActorId) -> Result<Cautela> {
        let _guard = self.transitions.lock().await;
        let now = self.clock.now();
        let mut cautela = self.load(id).await?;

        self.expect_status(
            &cautela,
            &[CautelaStatus::Pending, CautelaStatus::Approved],
            "cancel",
        )?;

        let allowed = &cautela.requester.id == actor || cautela.supervisor.as_ref() == Some(actor);
        if !allowed {
            return Err(CustodyError::NotPermitted {
                actor: actor.clone(),
                id,
            });
        }

        let memo = StockMemo::new("cautela cancelled")
            .by(actor)
            .for_cautela(id)
            .at(now);
        let lines = cautela.ammunition_lines();
        let released = cautela.status == CautelaStatus::Approved;
        if released {
            self.inventory.apply_batch(
                StockMovement::ReleaseReserved,
                &self.config.stock_location,
                &lines,
                &memo,
            )?;
        }

        let before = cautela.snapshot();
        cautela.status = CautelaStatus::Cancelled;
        cautela.cancelled_at = Some(now);
        let applied = released.then_some((StockMovement::ReleaseReserved, lines.as_slice()));
        let cautela = self.commit(cautela, applied, &memo).await?;

        self.audit
            .append(
                AuditDraft::new(cautela.audit_object(), AuditEvent::Cancel, now)
                    .by(actor)
                    .message("Cautela cancelled")
                    .before(before)
                    .after(cautela.snapshot()),
            )
            .await;

        info!(cautela_id = %id, actor = %actor, "Cautela cancelled");
        Ok(cautela)
    }

    /// Move open cautelas past their expected return to `Overdue`.
    ///
    /// Returns the IDs that changed.
    pub async fn mark_overdue(&self) -> Result<Vec<Uuid>> {
        let _guard = self.transitions.lock().await;
        let now = self.clock.now();
        let mut marked = Vec::new();

        for mut cautela in self.store.list_by_status(CautelaStatus::Open).await? {
            if !cautela.is_past_due(now) {
                continue;
            }

            let before = cautela.snapshot();
            cautela.status = CautelaStatus::Overdue;
            let cautela = self.store.update(cautela).await?;

            self.audit
                .append(
                    AuditDraft::new(cautela.audit_object(), AuditEvent::Overdue, now)
                        .message("Expected return passed")
                        .before(before)
                        .after(cautela.snapshot()),
                )
                .await;

            warn!(cautela_id = %cautela.id, requester = %cautela.requester.id, "Cautela overdue");
            marked.push(cautela.id);
        }

        Ok(marked)
    }

    // ---- queries ----

    pub async fn get(&self, id: Uuid) -> Result<Cautela> {
        self.load(id).await
    }

    /// Every cautela of a requester, newest first.
    pub async fn list_for_user(&self, requester: &ActorId) -> Result<Vec<Cautela>> {
        Ok(self.store.list_for_requester(requester).await?)
    }

    /// What a requester holds or has reserved right now.
    pub async fn holdings_for_user(&self, requester: &ActorId) -> Result<Holdings> {
        let cautelas = self.store.list_for_requester(requester).await?;
        Ok(Holdings::from_cautelas(&cautelas))
    }

    /// Verify the audit chain of a cautela. Returns the number of records.
    pub async fn verify_audit(&self, id: Uuid) -> Result<usize> {
        let cautela = self.load(id).await?;
        Ok(self.audit.verify(&cautela.audit_object()).await?)
    }

    // ---- stock and permanent custody ----

    /// Receive or write off rounds outside any cautela.
    pub async fn move_stock(
        &self,
        actor: &ActorId,
        lot: LotId,
        change: StockChange,
        note: &str,
    ) -> Result<StockLevel> {
        self.require(actor, MOVE_STOCK_CAPABILITY)?;
        let _guard = self.transitions.lock().await;

        let memo = StockMemo::new(note).by(actor).at(self.clock.now());
        let location = &self.config.stock_location;
        let level = match change {
            StockChange::Receive(quantity) => {
                self.inventory.receive(lot, location, quantity, &memo)?
            }
            StockChange::WriteOff(quantity) => {
                self.inventory.write_off(lot, location, quantity, &memo)?
            }
        };
        Ok(level)
    }

    /// The ammunition book: stock ledger lines, newest first.
    pub fn ammunition_book(&self, actor: &ActorId, lot: Option<LotId>) -> Result<Vec<StockEntry>> {
        self.require(actor, AMMUNITION_BOOK_CAPABILITY)?;
        Ok(self.inventory.ledger(lot))
    }

    /// Put an asset under permanent custody of `holder`.
    pub async fn assign_permanent(
        &self,
        asset_id: AssetId,
        holder: &ActorId,
        by: &ActorId,
        notes: &str,
    ) -> Result<PermanentAssignment> {
        self.require(by, PERMANENT_CUSTODY_CAPABILITY)?;
        let _guard = self.transitions.lock().await;
        let now = self.clock.now();

        let invalid = |reason| CustodyError::InvalidItem {
            kind: ItemKind::Weapon,
            object_id: asset_id,
            reason,
        };
        let asset = self.inventory.asset(asset_id).ok_or_else(|| invalid("not found"))?;
        if !asset.active {
            return Err(invalid("inactive"));
        }
        if self.on_outstanding_cautela(asset_id).await? {
            return Err(invalid("on an outstanding cautela"));
        }

        let assignment = self.permanent.assign(asset_id, holder, by, now, notes)?;
        self.audit
            .append(
                AuditDraft::new(assignment.audit_object(), AuditEvent::Assign, now)
                    .by(by)
                    .message(format!("{} assigned permanently to {holder}", asset.name))
                    .after(permanent_snapshot(&assignment)),
            )
            .await;
        Ok(assignment)
    }

    /// End a permanent custody term when the asset comes back.
    pub async fn end_permanent(&self, id: Uuid, by: &ActorId) -> Result<PermanentAssignment> {
        self.require(by, PERMANENT_CUSTODY_CAPABILITY)?;
        let _guard = self.transitions.lock().await;
        let now = self.clock.now();

        let before = self.permanent.get(id).map(|a| permanent_snapshot(&a));
        let assignment = self.permanent.end(id, now)?;

        let mut draft = AuditDraft::new(assignment.audit_object(), AuditEvent::Unassign, now)
            .by(by)
            .message("Permanent custody ended")
            .after(permanent_snapshot(&assignment));
        if let Some(before) = before {
            draft = draft.before(before);
        }
        self.audit.append(draft).await;
        Ok(assignment)
    }

    /// Record a periodic check of a permanently assigned asset.
    pub async fn record_periodic_check(
        &self,
        id: Uuid,
        by: &ActorId,
        in_order: bool,
        notes: &str,
    ) -> Result<PermanentAssignment> {
        self.require(by, PERIODIC_CHECK_CAPABILITY)?;
        let _guard = self.transitions.lock().await;
        let now = self.clock.now();

        let check = PeriodicCheck {
            at: now,
            by: by.clone(),
            in_order,
            notes: notes.to_string(),
        };
        let assignment = self.permanent.record_check(id, check)?;
        if !in_order {
            warn!(
                assignment_id = %id,
                asset_id = assignment.asset_id,
                "Periodic check found a problem"
            );
        }

        self.audit
            .append(
                AuditDraft::new(assignment.audit_object(), AuditEvent::Verify, now)
                    .by(by)
                    .message(if in_order {
                        "Periodic check: in order"
                    } else {
                        "Periodic check: problem found"
                    })
                    .after(permanent_snapshot(&assignment)),
            )
            .await;
        Ok(assignment)
    }

    /// Permanent custody terms of a holder, newest first.
    pub fn permanent_for_user(&self, holder: &ActorId) -> Vec<PermanentAssignment> {
        self.permanent.for_holder(holder)
    }

    // ---- helpers ----

    async fn load(&self, id: Uuid) -> Result<Cautela> {
        self.store.get(id).await?.ok_or(CustodyError::NotFound(id))
    }

    fn expect_status(
        &self,
        cautela: &Cautela,
        allowed: &[CautelaStatus],
        operation: &'static str,
    ) -> Result<()> {
        if allowed.contains(&cautela.status) {
            return Ok(());
        }
        Err(CustodyError::InvalidTransition {
            id: cautela.id,
            status: cautela.status,
            operation,
        })
    }

    fn check_designated_supervisor(cautela: &Cautela, actual: &ActorId) -> Result<()> {
        match &cautela.supervisor {
            Some(expected) if expected != actual => Err(CustodyError::NotDesignatedSupervisor {
                expected: expected.clone(),
                actual: actual.clone(),
            }),
            _ => Ok(()),
        }
    }

    fn validate_item(&self, spec: ItemSpec) -> Result<CautelaItem> {
        let invalid = |reason| CustodyError::InvalidItem {
            kind: spec.kind,
            object_id: spec.object_id,
            reason,
        };

        match spec.kind {
            ItemKind::Ammunition | ItemKind::Magazine
                if spec.quantity == 0 || spec.quantity > MAX_LINE_QUANTITY =>
            {
                Err(CustodyError::InvalidQuantity {
                    kind: spec.kind,
                    object_id: spec.object_id,
                    quantity: spec.quantity,
                })
            }
            ItemKind::Ammunition => {
                let lot = self
                    .inventory
                    .lot(spec.object_id)
                    .ok_or_else(|| invalid("not found"))?;
                if !lot.active {
                    return Err(invalid("inactive"));
                }
                Ok(spec.into())
            }
            kind => {
                let asset = self
                    .inventory
                    .asset(spec.object_id)
                    .ok_or_else(|| invalid("not found"))?;
                if !asset.active {
                    return Err(invalid("inactive"));
                }
                let expected = match kind {
                    ItemKind::Weapon => AssetClass::Weapon,
                    ItemKind::Magazine => AssetClass::Magazine,
                    _ => AssetClass::Accessory,
                };
                if asset.class != expected {
                    return Err(invalid("wrong asset class"));
                }
                if self.permanent.current_for_asset(spec.object_id).is_some() {
                    return Err(invalid("permanently assigned"));
                }
                Ok(CautelaItem {
                    kind,
                    object_id: spec.object_id,
                    quantity: spec.quantity.max(1),
                })
            }
        }
    }

    /// Every ammunition calibre must match a weapon calibre when both are
    /// present on the cautela.
    fn check_calibres(&self, cautela: &Cautela) -> Result<()> {
        let weapons: BTreeSet<String> = cautela
            .weapon_ids()
            .into_iter()
            .filter_map(|id| self.inventory.asset(id))
            .filter_map(|asset| asset.calibre)
            .map(|c| normalize_calibre(&c))
            .filter(|c| !c.is_empty())
            .collect();

        let ammunition: BTreeSet<String> = cautela
            .ammunition_lines()
            .into_iter()
            .filter_map(|(lot, _)| self.inventory.lot(lot))
            .map(|lot| normalize_calibre(&lot.calibre))
            .collect();

        if cautela.weapon_ids().is_empty() || ammunition.is_empty() {
            return Ok(());
        }

        match ammunition.into_iter().find(|c| !weapons.contains(c)) {
            Some(mismatch) => Err(CustodyError::CalibreMismatch {
                ammunition: mismatch,
                weapons: weapons.into_iter().collect(),
            }),
            None => Ok(()),
        }
    }

    /// Fill in the requester's post-operation totals: other outstanding
    /// cautelas plus this one.
    async fn with_running_totals(
        &self,
        op: CustodyOperation,
        cautela: &Cautela,
    ) -> Result<CustodyOperation> {
        let others: Vec<Cautela> = self
            .store
            .list_for_requester(&cautela.requester.id)
            .await?
            .into_iter()
            .filter(|c| c.id != cautela.id)
            .collect();
        let held = Holdings::from_cautelas(&others);

        Ok(op
            .with_ammunition_total(held.ammunition.saturating_add(cautela.ammunition_total()))
            .with_magazines_total(held.magazines.saturating_add(cautela.magazines_total())))
    }

    /// Returned rounds per lot, checked against what was issued.
    fn returned_lines(
        &self,
        cautela: &Cautela,
        receipt: &ReturnReceipt,
    ) -> Result<Vec<(LotId, u32)>> {
        let mut issued: BTreeMap<LotId, u32> = BTreeMap::new();
        for (lot, quantity) in cautela.ammunition_lines() {
            let total = issued.entry(lot).or_default();
            *total = total.saturating_add(quantity);
        }

        receipt
            .returned_ammunition
            .iter()
            .filter(|&(_, &quantity)| quantity > 0)
            .map(|(&lot, &returned)| {
                let issued = issued.get(&lot).copied().unwrap_or(0);
                if returned > issued {
                    return Err(CustodyError::ExcessReturn { lot, issued, returned });
                }
                Ok((lot, returned))
            })
            .collect()
    }

    async fn on_outstanding_cautela(&self, asset_id: AssetId) -> Result<bool> {
        for status in [CautelaStatus::Approved, CautelaStatus::Open, CautelaStatus::Overdue] {
            let cautelas = self.store.list_by_status(status).await?;
            let held = cautelas
                .iter()
                .flat_map(|c| &c.items)
                .any(|item| item.kind != ItemKind::Ammunition && item.object_id == asset_id);
            if held {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Store a transition. When the write fails the stock movement made for
    /// it is reversed, so stock and the stored status stay in step.
    async fn commit(
        &self,
        cautela: Cautela,
        applied: Option<(StockMovement, &[(LotId, u32)])>,
        memo: &StockMemo,
    ) -> Result<Cautela> {
        let id = cautela.id;
        let err = match self.store.update(cautela).await {
            Ok(stored) => return Ok(stored),
            Err(err) => err,
        };

        warn!(cautela_id = %id, error = %err, "Storing cautela failed");
        if let Some((movement, lines)) = applied {
            if let Err(rollback) =
                self.inventory
                    .reverse_batch(movement, &self.config.stock_location, lines, memo)
            {
                error!(
                    cautela_id = %id,
                    ?movement,
                    error = %rollback,
                    "Stock rollback failed after storage error"
                );
            }
        }
        Err(err.into())
    }

    fn require(&self, actor: &ActorId, capability: &'static str) -> Result<()> {
        let granted = Capability::parse(capability)
            .map(|cap| self.evaluator.authorizer().has_capability(actor, &cap))
            .unwrap_or(false);
        if granted {
            return Ok(());
        }
        warn!(actor = %actor, capability, "Missing capability");
        Err(CustodyError::MissingCapability {
            actor: actor.clone(),
            capability,
        })
    }
}

fn permanent_snapshot(assignment: &PermanentAssignment) -> serde_json::Value {
    serde_json::json!({
        "id": assignment.id,
        "asset_id": assignment.asset_id,
        "holder": assignment.holder,
        "assigned_at": assignment.assigned_at,
        "returned_at": assignment.returned_at,
        "checks": assignment.checks.len(),
    })
}

fn normalize_calibre(calibre: &str) -> String {
    calibre.trim().to_uppercase()
}
