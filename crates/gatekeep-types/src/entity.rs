//! Business entity references.
//!
//! The engine never owns products, orders or invoices. It only needs to know
//! what kind of object is under approval, its id, and a frozen snapshot of its
//! data taken when the workflow was triggered.

use serde::{Deserialize, Serialize};

use std::fmt;
use std::str::FromStr;

/// Kinds of business objects a workflow template can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    PurchaseOrder,
    SalesOrder,
    Invoice,
    Product,
    Customer,
    Supplier,
    StockAdjustment,
    StockTransfer,
    Expense,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::PurchaseOrder => "purchase_order",
            EntityType::SalesOrder => "sales_order",
            EntityType::Invoice => "invoice",
            EntityType::Product => "product",
            EntityType::Customer => "customer",
            EntityType::Supplier => "supplier",
            EntityType::StockAdjustment => "stock_adjustment",
            EntityType::StockTransfer => "stock_transfer",
            EntityType::Expense => "expense",
        }
    }

    /// Human-readable label used in approval request titles.
    pub fn label(&self) -> &'static str {
        match self {
            EntityType::PurchaseOrder => "Purchase order",
            EntityType::SalesOrder => "Sales order",
            EntityType::Invoice => "Invoice",
            EntityType::Product => "Product",
            EntityType::Customer => "Customer",
            EntityType::Supplier => "Supplier",
            EntityType::StockAdjustment => "Stock adjustment",
            EntityType::StockTransfer => "Stock transfer",
            EntityType::Expense => "Expense",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "purchase_order" => Ok(EntityType::PurchaseOrder),
            "sales_order" => Ok(EntityType::SalesOrder),
            "invoice" => Ok(EntityType::Invoice),
            "product" => Ok(EntityType::Product),
            "customer" => Ok(EntityType::Customer),
            "supplier" => Ok(EntityType::Supplier),
            "stock_adjustment" => Ok(EntityType::StockAdjustment),
            "stock_transfer" => Ok(EntityType::StockTransfer),
            "expense" => Ok(EntityType::Expense),
            other => Err(format!("invalid entity type: '{other}'")),
        }
    }
}

/// Immutable reference to the business object under approval.
///
/// `snapshot` is the entity payload as it looked when the workflow fired; it
/// is stored on the instance and never refreshed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub entity_id: String,
    #[serde(default)]
    pub snapshot: serde_json::Value,
}

impl EntityRef {
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        snapshot: serde_json::Value,
    ) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            snapshot,
        }
    }

    /// Best-effort display reference (`number`, `reference` or `name` field of
    /// the snapshot, falling back to the raw id).
    pub fn display_reference(&self) -> String {
        ["number", "reference", "name"]
            .iter()
            .find_map(|key| self.snapshot.get(*key).and_then(|v| v.as_str()))
            .map(str::to_string)
            .unwrap_or_else(|| self.entity_id.clone())
    }
}
