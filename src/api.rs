use anyhow::{Context, Result, anyhow};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use tracing::debug;

use crate::types::{
    Ack, BalanceResponse, DrawOutcome, Lottery, LotteryId, LotteryResult, LotteryStats,
    NewLottery, PurchaseOutcome, PurchaseRequest, RateResponse, Ticket, UserId, UserRecord,
    UserStats, WalletUpdateRequest,
};

/// Every call the client makes against the lottery API.
///
/// Implementations own no state beyond their connection; any call may fail
/// with a connectivity error and nothing here retries.
pub trait LotteryGateway: Send + Sync + 'static {
    fn list_lotteries(&self) -> impl Future<Output = Result<Vec<Lottery>>> + Send;

    fn list_tickets(&self, lottery_id: LotteryId) -> impl Future<Output = Result<Vec<Ticket>>> + Send;

    /// All-or-nothing: the server rejects the whole request if any number is gone.
    fn submit_purchase(
        &self,
        lottery_id: LotteryId,
        request: &PurchaseRequest,
    ) -> impl Future<Output = Result<PurchaseOutcome>> + Send;

    fn get_user(&self, user_id: UserId) -> impl Future<Output = Result<UserRecord>> + Send;

    fn save_wallet(&self, user_id: UserId, address: &str) -> impl Future<Output = Result<()>> + Send;

    fn user_stats(&self, user_id: UserId) -> impl Future<Output = Result<UserStats>> + Send;

    fn user_balance(&self, user_id: UserId) -> impl Future<Output = Result<f64>> + Send;

    fn ton_star_rate(&self) -> impl Future<Output = Result<f64>> + Send;

    fn create_lottery(&self, lottery: &NewLottery) -> impl Future<Output = Result<Ack>> + Send;

    fn update_lottery(
        &self,
        lottery_id: LotteryId,
        lottery: &NewLottery,
    ) -> impl Future<Output = Result<Ack>> + Send;

    fn delete_lottery(&self, lottery_id: LotteryId) -> impl Future<Output = Result<Ack>> + Send;

    fn draw(&self, lottery_id: LotteryId) -> impl Future<Output = Result<DrawOutcome>> + Send;

    fn lottery_stats(&self, lottery_id: LotteryId) -> impl Future<Output = Result<LotteryStats>> + Send;

    fn lottery_result(&self, lottery_id: LotteryId) -> impl Future<Output = Result<LotteryResult>> + Send;

    /// `Ok(false)` when the API refuses the token.
    fn verify_admin_token(&self, token: &str) -> impl Future<Output = Result<bool>> + Send;
}

pub struct HttpGateway {
    client: Client,
    base_url: String,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        debug!("GET {}", path);
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .with_context(|| format!("connection error: GET {path}"))?;
        read_json(path, response).await
    }

    async fn post_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Response> {
        debug!("POST {}", path);
        self.client
            .post(self.url(path))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .with_context(|| format!("connection error: POST {path}"))
    }
}

async fn read_json<T: DeserializeOwned>(path: &str, response: Response) -> Result<T> {
    let status = response.status();
    let body = response
        .text()
        .await
        .with_context(|| format!("connection error: reading {path}"))?;
    if !status.is_success() {
        return Err(anyhow!("{path}: {}", error_detail(status, &body)));
    }
    serde_json::from_str(&body).with_context(|| format!("{path}: unexpected response body"))
}

/// Reads a mutation response where 4xx answers are business rejections,
/// turned into a value through `reject`, and 5xx answers are failures.
async fn read_outcome<T, F>(path: &str, response: Response, reject: F) -> Result<T>
where
    T: DeserializeOwned,
    F: FnOnce(String) -> T,
{
    let status = response.status();
    let body = response
        .text()
        .await
        .with_context(|| format!("connection error: reading {path}"))?;
    decode_outcome(path, status, &body, reject)
}

fn decode_outcome<T, F>(path: &str, status: StatusCode, body: &str, reject: F) -> Result<T>
where
    T: DeserializeOwned,
    F: FnOnce(String) -> T,
{
    if status.is_success() {
        return serde_json::from_str(body).with_context(|| format!("{path}: unexpected response body"));
    }
    if status.is_client_error() {
        return Ok(reject(error_detail(status, body)));
    }
    Err(anyhow!("{path}: {}", error_detail(status, body)))
}

/// FastAPI errors look like `{"detail": "..."}`; validation errors carry a list.
fn error_detail(status: StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| value.get("detail").cloned())
        .and_then(|detail| match detail {
            serde_json::Value::String(text) => Some(text),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        });
    detail.unwrap_or_else(|| format!("HTTP {}", status.as_u16()))
}

impl LotteryGateway for HttpGateway {
    async fn list_lotteries(&self) -> Result<Vec<Lottery>> {
        self.get_json("/lotteries").await
    }

    async fn list_tickets(&self, lottery_id: LotteryId) -> Result<Vec<Ticket>> {
        self.get_json(&format!("/lotteries/{lottery_id}/tickets")).await
    }

    async fn submit_purchase(
        &self,
        lottery_id: LotteryId,
        request: &PurchaseRequest,
    ) -> Result<PurchaseOutcome> {
        let path = format!("/lotteries/{lottery_id}/buy");
        let response = self.post_json(&path, request).await?;
        read_outcome(&path, response, PurchaseOutcome::rejected).await
    }

    async fn get_user(&self, user_id: UserId) -> Result<UserRecord> {
        self.get_json(&format!("/users/{user_id}")).await
    }

    async fn save_wallet(&self, user_id: UserId, address: &str) -> Result<()> {
        let path = format!("/users/{user_id}/wallet");
        let body = WalletUpdateRequest {
            ton_wallet_address: address.to_string(),
        };
        let response = self.post_json(&path, &body).await?;
        let _: serde_json::Value = read_json(&path, response).await?;
        Ok(())
    }

    async fn user_stats(&self, user_id: UserId) -> Result<UserStats> {
        self.get_json(&format!("/users/{user_id}/stats")).await
    }

    async fn user_balance(&self, user_id: UserId) -> Result<f64> {
        let balance: BalanceResponse = self.get_json(&format!("/users/{user_id}/balance")).await?;
        Ok(balance.stars_balance)
    }

    async fn ton_star_rate(&self) -> Result<f64> {
        let rate: RateResponse = self.get_json("/rates/ton_star").await?;
        Ok(rate.ton_to_star)
    }

    async fn create_lottery(&self, lottery: &NewLottery) -> Result<Ack> {
        let path = "/lotteries/add";
        let response = self.post_json(path, lottery).await?;
        read_outcome(path, response, Ack::rejected).await
    }

    async fn update_lottery(&self, lottery_id: LotteryId, lottery: &NewLottery) -> Result<Ack> {
        let path = format!("/lotteries/{lottery_id}");
        debug!("PATCH {}", path);
        let response = self
            .client
            .patch(self.url(&path))
            .json(lottery)
            .send()
            .await
            .with_context(|| format!("connection error: PATCH {path}"))?;
        read_outcome(&path, response, Ack::rejected).await
    }

    async fn delete_lottery(&self, lottery_id: LotteryId) -> Result<Ack> {
        let path = format!("/lotteries/{lottery_id}");
        debug!("DELETE {}", path);
        let response = self
            .client
            .delete(self.url(&path))
            .send()
            .await
            .with_context(|| format!("connection error: DELETE {path}"))?;
        read_outcome(&path, response, Ack::rejected).await
    }

    async fn draw(&self, lottery_id: LotteryId) -> Result<DrawOutcome> {
        let path = format!("/lotteries/{lottery_id}/draw");
        debug!("POST {}", path);
        let response = self
            .client
            .post(self.url(&path))
            .send()
            .await
            .with_context(|| format!("connection error: POST {path}"))?;
        read_outcome(&path, response, DrawOutcome::rejected).await
    }

    async fn lottery_stats(&self, lottery_id: LotteryId) -> Result<LotteryStats> {
        self.get_json(&format!("/lotteries/{lottery_id}/stats")).await
    }

    async fn lottery_result(&self, lottery_id: LotteryId) -> Result<LotteryResult> {
        self.get_json(&format!("/lotteries/{lottery_id}/result")).await
    }

    async fn verify_admin_token(&self, token: &str) -> Result<bool> {
        let path = "/admin/star_price";
        debug!("GET {}", path);
        let response = self
            .client
            .get(self.url(path))
            .query(&[("token", token)])
            .send()
            .await
            .with_context(|| format!("connection error: GET {path}"))?;
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(anyhow!("{path}: HTTP {}", status.as_u16())),
        }
    }
}
