use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::fmt;
use tracing::warn;

use crate::config::Config;
use crate::shopify::model::{CountResp, OrderDetail, OrderDetailResp, OrdersResp, RemoteOrder};

pub mod model;

const API_PATH: &str = "admin/api";

/// Remote order source boundary. The pipeline and the refresh workflow only
/// ever talk to this trait; tests script it.
#[async_trait]
pub trait OrderSource: Send + Sync {
    /// Count of open, not-fully-fulfilled orders on the remote side.
    async fn count_open_orders(&self) -> Result<i64>;

    /// One page of open orders. Pages are 1-based; an empty page means the
    /// listing is exhausted.
    async fn list_open_orders(&self, page: usize, page_size: usize) -> Result<Vec<RemoteOrder>>;

    /// Full detail for one order: the header fields plus line items with
    /// their location assignment.
    async fn order_detail(&self, remote_order_id: i64) -> Result<OrderDetail>;
}

#[derive(Clone)]
pub struct ShopifyClient {
    http: Client,
    base_url: Url,
    token: String,
    version: String,
}

impl fmt::Debug for ShopifyClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShopifyClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ShopifyClient {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(&cfg.shop.base_url).context("invalid shop.base_url")?;
        Ok(Self::with_base_url(
            cfg.shop.access_token.clone(),
            cfg.shop.api_version.clone(),
            base_url,
        ))
    }

    pub fn with_base_url(token: String, version: String, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("partsdesk/0.1")
            .no_proxy()
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            token,
            version,
        }
    }

    fn endpoint(&self, resource: &str) -> Result<Url> {
        self.base_url
            .join(&format!("{}/{}/{}", API_PATH, self.version, resource))
            .context("invalid shop base URL")
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T> {
        let res = self
            .http
            .get(url.clone())
            .header("X-Shopify-Access-Token", &self.token)
            .header("Accept", "application/json")
            .send()
            .await
            .context("failed to reach order source")?;

        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!(%url, "rate limited by order source");
            return Err(anyhow!("received 429 from order source: {}", body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            warn!(%url, %status, "order source error");
            return Err(anyhow!("order source error {}: {}", status, body));
        }

        let body = res
            .text()
            .await
            .context("failed to read order source response")?;
        serde_json::from_str(&body).context("invalid order source response JSON")
    }
}

#[async_trait]
impl OrderSource for ShopifyClient {
    async fn count_open_orders(&self) -> Result<i64> {
        let mut url = self.endpoint("orders/count.json")?;
        url.query_pairs_mut()
            .append_pair("status", "open")
            .append_pair("fulfillment_status", "unshipped,partial");
        let resp: CountResp = self.get_json(url).await?;
        Ok(resp.count)
    }

    async fn list_open_orders(&self, page: usize, page_size: usize) -> Result<Vec<RemoteOrder>> {
        let mut url = self.endpoint("orders.json")?;
        url.query_pairs_mut()
            .append_pair("status", "open")
            .append_pair("fulfillment_status", "unshipped,partial")
            .append_pair("limit", &page_size.to_string())
            .append_pair("page", &page.to_string());
        let resp: OrdersResp = self.get_json(url).await?;
        Ok(resp.orders)
    }

    async fn order_detail(&self, remote_order_id: i64) -> Result<OrderDetail> {
        let url = self.endpoint(&format!("orders/{}.json", remote_order_id))?;
        let resp: OrderDetailResp = self.get_json(url).await?;
        Ok(resp.order)
    }
}
