//! Asset register, ammunition stock ledger and maintenance records.
//!
//! Stock is kept per `(lot, location)` as an available/reserved pair.
//! Approval moves rounds from available to reserved, delivery consumes the
//! reservation, and a return puts unused rounds back into available.
//!
//! Every committed movement is written to the stock ledger (the ammunition
//! book), one [`StockEntry`] per lot line.

use chrono::{DateTime, NaiveDate, Utc};
use custody_policy::ActorId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::{AssetId, LotId};

/// Stock location used when none is given.
pub const DEFAULT_LOCATION: &str = "ALMOXARIFADO";

/// Inventory errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InventoryError {
    #[error("Asset {0} not found")]
    UnknownAsset(AssetId),

    #[error("Ammunition lot {0} not found")]
    UnknownLot(LotId),

    #[error("Maintenance record {0} not found")]
    UnknownMaintenance(Uuid),

    /// Not enough available rounds to reserve
    #[error("Lot {lot} at {location}: requested {requested}, only {available} available")]
    InsufficientStock {
        lot: LotId,
        location: String,
        requested: u32,
        available: u32,
    },

    /// Not enough reserved rounds to consume
    #[error("Lot {lot} at {location}: requested {requested}, only {reserved} reserved")]
    InsufficientReservation {
        lot: LotId,
        location: String,
        requested: u32,
        reserved: u32,
    },
}

pub type Result<T> = std::result::Result<T, InventoryError>;

/// Register class of a non-consumable asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    Weapon,
    Accessory,
    Magazine,
}

/// A tracked piece of equipment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    pub name: String,
    pub class: AssetClass,
    /// Calibre, for weapons and magazines
    pub calibre: Option<String>,
    pub serial_number: Option<String>,
    pub active: bool,
}

impl Asset {
    pub fn new(id: AssetId, name: impl Into<String>, class: AssetClass) -> Self {
        Self {
            id,
            name: name.into(),
            class,
            calibre: None,
            serial_number: None,
            active: true,
        }
    }

    pub fn with_calibre(mut self, calibre: impl Into<String>) -> Self {
        self.calibre = Some(calibre.into());
        self
    }

    pub fn with_serial_number(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = Some(serial.into());
        self
    }
}

/// Training or duty ammunition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmmunitionUse {
    Training,
    #[default]
    Operational,
}

/// A lot of ammunition of one calibre.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmmunitionLot {
    pub id: LotId,
    pub calibre: String,
    pub lot: String,
    #[serde(default)]
    pub usage: AmmunitionUse,
    pub expires_on: Option<NaiveDate>,
    pub active: bool,
}

impl AmmunitionLot {
    pub fn new(id: LotId, calibre: impl Into<String>, lot: impl Into<String>) -> Self {
        Self {
            id,
            calibre: calibre.into(),
            lot: lot.into(),
            usage: AmmunitionUse::default(),
            expires_on: None,
            active: true,
        }
    }
}

impl fmt::Display for AmmunitionLot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} lot {}", self.calibre, self.lot)
    }
}

/// Stock of one lot at one location.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub available: u32,
    pub reserved: u32,
}

/// A stock movement applied to a batch of lots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockMovement {
    /// Available → reserved
    Reserve,
    /// Reserved → out of the armory
    ConsumeReserved,
    /// Reserved → available, clamped to what is reserved
    ReleaseReserved,
    /// Into available
    Restock,
    /// Out of available, for losses, training use and adjustments
    WriteOff,
}

impl StockMovement {
    /// The movement that puts stock back where this one found it, when a
    /// single movement can.
    pub const fn inverse(self) -> Option<Self> {
        match self {
            Self::Reserve => Some(Self::ReleaseReserved),
            Self::ReleaseReserved => Some(Self::Reserve),
            Self::Restock => Some(Self::WriteOff),
            Self::WriteOff => Some(Self::Restock),
            Self::ConsumeReserved => None,
        }
    }

    fn apply(
        self,
        level: &mut StockLevel,
        lot: LotId,
        location: &str,
        quantity: u32,
    ) -> Result<()> {
        let short = |available: u32| InventoryError::InsufficientStock {
            lot,
            location: location.to_string(),
            requested: quantity,
            available,
        };

        match self {
            Self::Reserve => {
                if level.available < quantity {
                    return Err(short(level.available));
                }
                level.available -= quantity;
                level.reserved = level.reserved.saturating_add(quantity);
            }
            Self::ConsumeReserved => {
                if level.reserved < quantity {
                    return Err(InventoryError::InsufficientReservation {
                        lot,
                        location: location.to_string(),
                        requested: quantity,
                        reserved: level.reserved,
                    });
                }
                level.reserved -= quantity;
            }
            Self::ReleaseReserved => {
                let released = quantity.min(level.reserved);
                if released < quantity {
                    warn!(
                        lot,
                        location,
                        quantity,
                        reserved = level.reserved,
                        "Releasing more than reserved, clamping"
                    );
                }
                level.reserved -= released;
                level.available = level.available.saturating_add(released);
            }
            Self::Restock => {
                level.available = level.available.saturating_add(quantity);
            }
            Self::WriteOff => {
                if level.available < quantity {
                    return Err(short(level.available));
                }
                level.available -= quantity;
            }
        }
        Ok(())
    }

    /// Reverse a line of a batch that is being rolled back.
    fn undo(self, level: &mut StockLevel, quantity: u32) {
        match self {
            Self::Reserve => {
                level.reserved = level.reserved.saturating_sub(quantity);
                level.available = level.available.saturating_add(quantity);
            }
            Self::ConsumeReserved => {
                level.reserved = level.reserved.saturating_add(quantity);
            }
            Self::WriteOff => {
                level.available = level.available.saturating_add(quantity);
            }
            // Never fail, so never part of a rollback.
            Self::ReleaseReserved | Self::Restock => {}
        }
    }
}

/// Who moved stock and why.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StockMemo {
    pub actor: Option<ActorId>,
    /// Cautela the movement belongs to
    pub cautela: Option<Uuid>,
    pub note: String,
    /// Defaults to the wall clock at commit time
    pub at: Option<DateTime<Utc>>,
}

impl StockMemo {
    pub fn new(note: impl Into<String>) -> Self {
        Self {
            note: note.into(),
            ..Self::default()
        }
    }

    pub fn by(mut self, actor: &ActorId) -> Self {
        self.actor = Some(actor.clone());
        self
    }

    pub fn for_cautela(mut self, id: Uuid) -> Self {
        self.cautela = Some(id);
        self
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = Some(at);
        self
    }
}

/// One line of the stock ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockEntry {
    /// Position in the ledger, starting at 1
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub lot: LotId,
    pub location: String,
    pub movement: StockMovement,
    pub quantity: u32,
    pub actor: Option<ActorId>,
    pub cautela: Option<Uuid>,
    pub note: String,
    /// Stock of the lot at the location after this line
    pub balance: StockLevel,
}

/// Preventive, corrective or decommissioning work on a weapon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceKind {
    Preventive,
    Corrective,
    Decommission,
}

/// A maintenance record. Open while `ended_on` is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Maintenance {
    pub id: Uuid,
    pub asset_id: AssetId,
    pub kind: MaintenanceKind,
    pub started_on: NaiveDate,
    pub ended_on: Option<NaiveDate>,
    /// Whether the asset may not be issued while this is open
    pub impacts_availability: bool,
    pub notes: String,
}

impl Maintenance {
    pub fn is_open(&self) -> bool {
        self.ended_on.is_none()
    }
}

/// In-memory inventory shared by the custody service.
#[derive(Debug, Default)]
pub struct Inventory {
    assets: DashMap<AssetId, Asset>,
    lots: DashMap<LotId, AmmunitionLot>,
    stock: DashMap<(LotId, String), StockLevel>,
    maintenance: DashMap<Uuid, Maintenance>,
    ledger: RwLock<Vec<StockEntry>>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace an asset.
    pub fn add_asset(&self, asset: Asset) {
        debug!(asset_id = asset.id, class = ?asset.class, "Registering asset");
        self.assets.insert(asset.id, asset);
    }

    pub fn asset(&self, id: AssetId) -> Option<Asset> {
        self.assets.get(&id).map(|a| a.clone())
    }

    /// Mark an asset inactive so it can no longer be requested.
    pub fn deactivate_asset(&self, id: AssetId) -> Result<()> {
        let mut asset = self.assets.get_mut(&id).ok_or(InventoryError::UnknownAsset(id))?;
        asset.active = false;
        info!(asset_id = id, "Asset deactivated");
        Ok(())
    }

    /// Register or replace an ammunition lot.
    pub fn add_lot(&self, lot: AmmunitionLot) {
        debug!(lot_id = lot.id, calibre = %lot.calibre, "Registering ammunition lot");
        self.lots.insert(lot.id, lot);
    }

    pub fn lot(&self, id: LotId) -> Option<AmmunitionLot> {
        self.lots.get(&id).map(|l| l.clone())
    }

    /// Current stock of a lot at a location (zero when never stocked).
    pub fn stock(&self, lot: LotId, location: &str) -> StockLevel {
        self.stock
            .get(&(lot, location.to_string()))
            .map(|level| *level)
            .unwrap_or_default()
    }

    /// Add received rounds to available stock.
    pub fn receive(
        &self,
        lot: LotId,
        location: &str,
        quantity: u32,
        memo: &StockMemo,
    ) -> Result<StockLevel> {
        self.apply_batch(StockMovement::Restock, location, &[(lot, quantity)], memo)?;
        let level = self.stock(lot, location);
        info!(lot, location, quantity, available = level.available, "Stock received");
        Ok(level)
    }

    /// Take rounds out of available stock outside any cautela.
    pub fn write_off(
        &self,
        lot: LotId,
        location: &str,
        quantity: u32,
        memo: &StockMemo,
    ) -> Result<StockLevel> {
        self.apply_batch(StockMovement::WriteOff, location, &[(lot, quantity)], memo)?;
        let level = self.stock(lot, location);
        info!(lot, location, quantity, available = level.available, "Stock written off");
        Ok(level)
    }

    /// Apply one movement to several lots, all or nothing.
    ///
    /// On failure the lines already moved are reversed before the error is
    /// returned and nothing reaches the ledger.
    pub fn apply_batch(
        &self,
        movement: StockMovement,
        location: &str,
        lines: &[(LotId, u32)],
        memo: &StockMemo,
    ) -> Result<()> {
        if let Some(&(lot, _)) = lines.iter().find(|(lot, _)| !self.lots.contains_key(lot)) {
            return Err(InventoryError::UnknownLot(lot));
        }

        let mut balances = Vec::with_capacity(lines.len());
        for (index, &(lot, quantity)) in lines.iter().enumerate() {
            let outcome = {
                let mut level = self.stock.entry((lot, location.to_string())).or_default();
                movement
                    .apply(&mut level, lot, location, quantity)
                    .map(|()| *level)
            };

            match outcome {
                Ok(balance) => balances.push(balance),
                Err(err) => {
                    warn!(
                        ?movement,
                        lot,
                        location,
                        error = %err,
                        "Stock movement failed, rolling back"
                    );
                    for &(done_lot, done_quantity) in &lines[..index] {
                        let key = (done_lot, location.to_string());
                        if let Some(mut level) = self.stock.get_mut(&key) {
                            movement.undo(&mut level, done_quantity);
                        }
                    }
                    return Err(err);
                }
            }
        }

        self.record(movement, location, lines, &balances, memo);
        debug!(?movement, location, lines = lines.len(), "Stock movement applied");
        Ok(())
    }

    /// Undo a batch that was applied, writing the compensating movements to
    /// the ledger. Consumed rounds go back into the reservation they left.
    pub fn reverse_batch(
        &self,
        movement: StockMovement,
        location: &str,
        lines: &[(LotId, u32)],
        memo: &StockMemo,
    ) -> Result<()> {
        let mut memo = memo.clone();
        memo.note = format!("reversal of {movement:?}: {}", memo.note);

        match movement.inverse() {
            Some(inverse) => self.apply_batch(inverse, location, lines, &memo),
            None => {
                self.apply_batch(StockMovement::Restock, location, lines, &memo)?;
                self.apply_batch(StockMovement::Reserve, location, lines, &memo)
            }
        }
    }

    fn record(
        &self,
        movement: StockMovement,
        location: &str,
        lines: &[(LotId, u32)],
        balances: &[StockLevel],
        memo: &StockMemo,
    ) {
        let at = memo.at.unwrap_or_else(Utc::now);
        let mut ledger = self.ledger.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        for (&(lot, quantity), &balance) in lines.iter().zip(balances) {
            let seq = ledger.len() as u64 + 1;
            ledger.push(StockEntry {
                seq,
                at,
                lot,
                location: location.to_string(),
                movement,
                quantity,
                actor: memo.actor.clone(),
                cautela: memo.cautela,
                note: memo.note.clone(),
                balance,
            });
        }
    }

    /// Ledger lines, newest first, optionally for one lot.
    pub fn ledger(&self, lot: Option<LotId>) -> Vec<StockEntry> {
        let ledger = self.ledger.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        ledger
            .iter()
            .rev()
            .filter(|entry| lot.map_or(true, |lot| entry.lot == lot))
            .cloned()
            .collect()
    }

    /// Ledger lines of one cautela, oldest first.
    pub fn ledger_for_cautela(&self, id: Uuid) -> Vec<StockEntry> {
        let ledger = self.ledger.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        ledger
            .iter()
            .filter(|entry| entry.cautela == Some(id))
            .cloned()
            .collect()
    }

    /// Open a maintenance record for an asset.
    pub fn open_maintenance(
        &self,
        asset_id: AssetId,
        kind: MaintenanceKind,
        started_on: NaiveDate,
        impacts_availability: bool,
    ) -> Result<Uuid> {
        if !self.assets.contains_key(&asset_id) {
            return Err(InventoryError::UnknownAsset(asset_id));
        }

        let record = Maintenance {
            id: Uuid::new_v4(),
            asset_id,
            kind,
            started_on,
            ended_on: None,
            impacts_availability,
            notes: String::new(),
        };
        let id = record.id;
        self.maintenance.insert(id, record);

        info!(asset_id, maintenance_id = %id, ?kind, impacts_availability, "Maintenance opened");
        Ok(id)
    }

    /// Close a maintenance record.
    pub fn close_maintenance(&self, id: Uuid, ended_on: NaiveDate) -> Result<()> {
        let mut record = self
            .maintenance
            .get_mut(&id)
            .ok_or(InventoryError::UnknownMaintenance(id))?;
        record.ended_on = Some(ended_on);
        info!(maintenance_id = %id, asset_id = record.asset_id, "Maintenance closed");
        Ok(())
    }

    /// First of `assets` held by open maintenance that impacts availability.
    pub fn blocked_by_maintenance(&self, assets: &[AssetId]) -> Option<AssetId> {
        self.maintenance
            .iter()
            .find(|m| m.is_open() && m.impacts_availability && assets.contains(&m.asset_id))
            .map(|m| m.asset_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    fn memo() -> StockMemo {
        StockMemo::new("test")
    }

    fn stocked() -> Inventory {
        let inventory = Inventory::new();
        inventory.add_lot(AmmunitionLot::new(1, ".40", "L-001"));
        inventory.add_lot(AmmunitionLot::new(2, "9MM", "L-002"));
        inventory.receive(1, DEFAULT_LOCATION, 100, &memo()).unwrap();
        inventory.receive(2, DEFAULT_LOCATION, 10, &memo()).unwrap();
        inventory
    }

    #[test]
    fn test_reserve_consume_restock() {
        let inventory = stocked();

        inventory
            .apply_batch(StockMovement::Reserve, DEFAULT_LOCATION, &[(1, 30)], &memo())
            .unwrap();
        assert_eq!(
            inventory.stock(1, DEFAULT_LOCATION),
            StockLevel { available: 70, reserved: 30 }
        );

        inventory
            .apply_batch(StockMovement::ConsumeReserved, DEFAULT_LOCATION, &[(1, 30)], &memo())
            .unwrap();
        assert_eq!(
            inventory.stock(1, DEFAULT_LOCATION),
            StockLevel { available: 70, reserved: 0 }
        );

        inventory
            .apply_batch(StockMovement::Restock, DEFAULT_LOCATION, &[(1, 12)], &memo())
            .unwrap();
        assert_eq!(inventory.stock(1, DEFAULT_LOCATION).available, 82);
    }

    #[test]
    fn test_failed_batch_rolls_back() {
        let inventory = stocked();

        let err = inventory
            .apply_batch(StockMovement::Reserve, DEFAULT_LOCATION, &[(1, 30), (2, 11)], &memo())
            .unwrap_err();
        assert!(matches!(err, InventoryError::InsufficientStock { lot: 2, available: 10, .. }));

        assert_eq!(
            inventory.stock(1, DEFAULT_LOCATION),
            StockLevel { available: 100, reserved: 0 }
        );
        assert_eq!(inventory.stock(2, DEFAULT_LOCATION).available, 10);
    }

    #[test]
    fn test_release_clamps_to_reserved() {
        let inventory = stocked();
        inventory
            .apply_batch(StockMovement::Reserve, DEFAULT_LOCATION, &[(2, 4)], &memo())
            .unwrap();

        inventory
            .apply_batch(StockMovement::ReleaseReserved, DEFAULT_LOCATION, &[(2, 9)], &memo())
            .unwrap();
        assert_eq!(
            inventory.stock(2, DEFAULT_LOCATION),
            StockLevel { available: 10, reserved: 0 }
        );
    }

    #[test]
    fn test_locations_are_independent() {
        let inventory = stocked();
        assert_eq!(inventory.stock(1, "BASE-NORTE"), StockLevel::default());
        assert!(inventory
            .apply_batch(StockMovement::Reserve, "BASE-NORTE", &[(1, 1)], &memo())
            .is_err());
        assert!(matches!(
            inventory.receive(99, DEFAULT_LOCATION, 1, &memo()),
            Err(InventoryError::UnknownLot(99))
        ));
    }

    #[test]
    fn test_maintenance_blocks_until_closed() {
        let inventory = Inventory::new();
        inventory.add_asset(Asset::new(10, "Pistola", AssetClass::Weapon).with_calibre(".40"));
        inventory.add_asset(Asset::new(11, "Pistola", AssetClass::Weapon).with_calibre(".40"));

        let id = inventory
            .open_maintenance(10, MaintenanceKind::Corrective, day(1), true)
            .unwrap();
        inventory
            .open_maintenance(11, MaintenanceKind::Preventive, day(1), false)
            .unwrap();

        assert_eq!(inventory.blocked_by_maintenance(&[10, 11]), Some(10));
        assert_eq!(inventory.blocked_by_maintenance(&[11]), None);

        inventory.close_maintenance(id, day(3)).unwrap();
        assert_eq!(inventory.blocked_by_maintenance(&[10]), None);
    }

    #[test]
    fn test_deactivate_asset() {
        let inventory = Inventory::new();
        inventory.add_asset(Asset::new(5, "Colete", AssetClass::Accessory));
        inventory.deactivate_asset(5).unwrap();
        assert!(!inventory.asset(5).unwrap().active);
        assert_eq!(inventory.deactivate_asset(6), Err(InventoryError::UnknownAsset(6)));
    }

    #[test]
    fn test_ledger_records_committed_movements() {
        let inventory = stocked();
        let clerk = ActorId::new("A1");
        let cautela = Uuid::new_v4();

        inventory
            .apply_batch(
                StockMovement::Reserve,
                DEFAULT_LOCATION,
                &[(1, 30), (2, 4)],
                &StockMemo::new("approval").by(&clerk).for_cautela(cautela),
            )
            .unwrap();
        // A failed batch leaves no trace.
        inventory
            .apply_batch(StockMovement::Reserve, DEFAULT_LOCATION, &[(1, 1), (2, 99)], &memo())
            .unwrap_err();

        let book = inventory.ledger(Some(1));
        assert_eq!(book.len(), 2);
        assert_eq!(book[0].movement, StockMovement::Reserve);
        assert_eq!(book[0].quantity, 30);
        assert_eq!(book[0].actor, Some(clerk));
        assert_eq!(book[0].balance, StockLevel { available: 70, reserved: 30 });
        assert_eq!(book[1].movement, StockMovement::Restock);

        let lines = inventory.ledger_for_cautela(cautela);
        assert_eq!(lines.iter().map(|e| e.lot).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(inventory.ledger(None).len(), 4);
        assert!(inventory.ledger(None).windows(2).all(|w| w[0].seq > w[1].seq));
    }

    #[test]
    fn test_reverse_batch() {
        let inventory = stocked();
        let lines = [(1, 30)];

        inventory
            .apply_batch(StockMovement::Restock, DEFAULT_LOCATION, &lines, &memo())
            .unwrap();
        inventory
            .reverse_batch(StockMovement::Restock, DEFAULT_LOCATION, &lines, &memo())
            .unwrap();
        assert_eq!(inventory.stock(1, DEFAULT_LOCATION).available, 100);

        inventory
            .apply_batch(StockMovement::Reserve, DEFAULT_LOCATION, &lines, &memo())
            .unwrap();
        inventory
            .apply_batch(StockMovement::ConsumeReserved, DEFAULT_LOCATION, &lines, &memo())
            .unwrap();
        inventory
            .reverse_batch(StockMovement::ConsumeReserved, DEFAULT_LOCATION, &lines, &memo())
            .unwrap();
        assert_eq!(
            inventory.stock(1, DEFAULT_LOCATION),
            StockLevel { available: 70, reserved: 30 }
        );

        let latest = &inventory.ledger(Some(1))[0];
        assert_eq!(latest.movement, StockMovement::Reserve);
        assert!(latest.note.starts_with("reversal of ConsumeReserved"));
    }

    #[test]
    fn test_write_off() {
        let inventory = stocked();
        let level = inventory
            .write_off(2, DEFAULT_LOCATION, 4, &StockMemo::new("training session"))
            .unwrap();
        assert_eq!(level.available, 6);
        assert!(matches!(
            inventory.write_off(2, DEFAULT_LOCATION, 7, &memo()),
            Err(InventoryError::InsufficientStock { requested: 7, available: 6, .. })
        ));
        assert!(matches!(
            inventory.apply_batch(StockMovement::Restock, DEFAULT_LOCATION, &[(42, 1)], &memo()),
            Err(InventoryError::UnknownLot(42))
        ));
    }
}
