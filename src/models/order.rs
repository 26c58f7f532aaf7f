use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Completed,
    Failed,
}

impl OrderStatus {
    /// Whether an order in this status may move to `next`.
    ///
    /// `completed` is terminal. A `failed` order may still complete when the
    /// gateway later confirms the capture.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        match (self, next) {
            (OrderStatus::Completed, _) => false,
            (OrderStatus::Pending, OrderStatus::Completed | OrderStatus::Failed) => true,
            (OrderStatus::Failed, OrderStatus::Completed) => true,
            _ => false,
        }
    }
}

/// One checkout attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOrder {
    pub order_code: i64,
    pub customer_email: String,
    pub package_code: String,
    /// Charged amount in the smallest currency unit
    pub amount: i64,
    pub status: OrderStatus,
    pub payment_url: Option<String>,
    pub payment_link_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug)]
pub struct CreatePaymentOrder {
    pub customer_email: String,
    pub package_code: String,
    pub amount: i64,
}
