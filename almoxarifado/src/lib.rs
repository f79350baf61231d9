//! Cautela workflow for the GCM almoxarifado.
//!
//! A cautela is the custody record for weapons, magazines, accessories and
//! ammunition issued to an officer. This crate drives it through its
//! lifecycle, enforcing the custody policy at each step:
//!
//! - **request**: requester with no overdue custody asks for active items
//! - **approve**: designated supervisor, dual control, calibre match,
//!   quantity cap on running holdings; ammunition is reserved
//! - **deliver**: clerk hands over inside the withdrawal window (or by
//!   exception); reservations are consumed
//! - **return**: clerk receives inside the return window; unused rounds
//!   go back to stock
//!
//! Every transition is recorded in a hash-chained [`AuditTrail`], and every
//! stock movement in the inventory's ledger. Assets can also be held under
//! permanent custody terms, see [`PermanentRegister`].

pub mod audit;
pub mod clock;
pub mod inventory;
pub mod permanent;
pub mod service;
pub mod store;
pub mod types;

// Re-export main types
pub use audit::{AuditDraft, AuditError, AuditEvent, AuditRecord, AuditTrail};
pub use clock::{Clock, FixedClock, SystemClock};
pub use inventory::{
    AmmunitionLot, Asset, AssetClass, Inventory, InventoryError, MaintenanceKind, StockEntry,
    StockLevel, StockMemo, StockMovement, DEFAULT_LOCATION,
};
pub use permanent::{PeriodicCheck, PermanentAssignment, PermanentError, PermanentRegister};
pub use service::{
    CustodyError, CustodyRequest, CustodyService, ReturnReceipt, ServiceConfig, StockChange,
    AMMUNITION_BOOK_CAPABILITY, MOVE_STOCK_CAPABILITY, PERIODIC_CHECK_CAPABILITY,
    PERMANENT_CUSTODY_CAPABILITY,
};
pub use store::{CautelaStore, InMemoryCautelaStore, StoreError};
pub use types::*;
