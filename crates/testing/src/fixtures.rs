//! Saga state types and legacy table rows shared across the test suite.

use sagastore_core::SagaData;
use sagastore_export::{CellValue, TableRow, SECONDARY_INDEX_COLUMN};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order saga state. Carries its identity, so reads restore the saga id
/// into the `Id` property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSagaData {
    #[serde(rename = "Id")]
    pub id: Uuid,
    #[serde(rename = "OrderId")]
    pub order_id: String,
    #[serde(rename = "ItemCount")]
    pub item_count: i32,
}

impl OrderSagaData {
    /// New order state. The `Id` field is assigned by the persister on
    /// save, so it starts out nil.
    pub fn new(order_id: impl Into<String>, item_count: i32) -> Self {
        Self {
            id: Uuid::nil(),
            order_id: order_id.into(),
            item_count,
        }
    }
}

impl SagaData for OrderSagaData {
    const ENTITY_TYPE: &'static str = "Samples.OrderSagaData";
    const CORRELATION_PROPERTY: &'static str = "OrderId";

    fn correlation_value(&self) -> String {
        self.order_id.clone()
    }
}

/// Shipping saga state without an `Id` property of its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShippingSagaData {
    #[serde(rename = "OrderNumber")]
    pub order_number: String,
    #[serde(rename = "Shipped")]
    pub shipped: bool,
}

impl ShippingSagaData {
    pub fn new(order_number: impl Into<String>) -> Self {
        Self {
            order_number: order_number.into(),
            shipped: false,
        }
    }
}

impl SagaData for ShippingSagaData {
    const ENTITY_TYPE: &'static str = "Samples.ShippingSagaData";
    const CORRELATION_PROPERTY: &'static str = "OrderNumber";

    fn correlation_value(&self) -> String {
        self.order_number.clone()
    }
}

/// The secondary index marker the legacy table store attached to order
/// saga rows.
pub fn order_index_marker(order_id: &str) -> String {
    format!("Index_Samples.OrderSagaData_OrderId_\"{}\"#", order_id)
}

/// A marked legacy data row for an order saga, laid out the way the old
/// table store stored it.
pub fn legacy_order_row(row_key: &str, order_id: &str, item_count: i32) -> TableRow {
    TableRow::new("Samples.OrderSagaData", row_key)
        .with_cell(
            SECONDARY_INDEX_COLUMN,
            CellValue::String(order_index_marker(order_id)),
        )
        .with_cell("OrderId", CellValue::String(order_id.to_string()))
        .with_cell("ItemCount", CellValue::Int32(item_count))
        .with_cell(
            "Originator",
            CellValue::String("orders@machine-1".to_string()),
        )
}

/// The secondary index row that pairs with [`legacy_order_row`]. The
/// legacy store keyed these rows by the marker itself.
pub fn legacy_order_index_row(order_id: &str) -> TableRow {
    let marker = order_index_marker(order_id);
    TableRow::new(marker.clone(), marker)
}
