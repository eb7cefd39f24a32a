use serde::Deserialize;

/// One order as returned by the paged open-order listing.
#[derive(Deserialize, Debug, Clone)]
pub struct RemoteOrder {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub customer: Option<RemoteCustomer>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub fulfillment_status: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RemoteCustomer {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

impl RemoteCustomer {
    pub fn display_name(&self) -> Option<String> {
        let name = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        if name.trim().is_empty() {
            None
        } else {
            Some(name)
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct RemoteLineItem {
    pub id: i64,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub assigned_location_id: Option<i64>,
}

fn default_quantity() -> i64 {
    1
}

impl RemoteLineItem {
    /// The remote sends money as decimal strings; unparsable values read as 0.
    pub fn unit_price(&self) -> f64 {
        self.price
            .as_deref()
            .and_then(|p| p.trim().parse::<f64>().ok())
            .unwrap_or(0.0)
    }
}

#[derive(Deserialize, Debug)]
pub struct OrdersResp {
    pub orders: Vec<RemoteOrder>,
}

#[derive(Deserialize, Debug)]
pub struct OrderDetailResp {
    pub order: OrderDetail,
}

/// Full order payload from the detail endpoint: the same header fields as
/// the listing plus line items.
#[derive(Deserialize, Debug, Clone)]
pub struct OrderDetail {
    #[serde(flatten)]
    pub order: RemoteOrder,
    #[serde(default)]
    pub line_items: Vec<RemoteLineItem>,
}

#[derive(Deserialize, Debug)]
pub struct CountResp {
    pub count: i64,
}
