use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;

pub type LotteryId = i64;
pub type UserId = i64;
pub type TicketNumber = u32;

pub const DEFAULT_CURRENCY: &str = "STARS";

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Lottery {
    pub id: LotteryId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub ticket_price: f64,
    #[serde(default = "default_currency")]
    pub ticket_price_currency: String,
    pub max_tickets: u32,
    #[serde(default)]
    pub tickets_sold: u32,
    #[serde(default)]
    pub participants: Option<u32>,
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub winner_id: Option<UserId>,
    #[serde(default)]
    pub winner_username: Option<String>,
    #[serde(default)]
    pub winner_first_name: Option<String>,
    #[serde(default)]
    pub winner_ticket_number: Option<TicketNumber>,
    #[serde(default)]
    pub random_link: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub finished_at: Option<DateTime<Utc>>,
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LotteryStatus {
    Active,
    Finished,
}

impl Lottery {
    /// A lottery is finished exactly when the draw has recorded a winner.
    pub fn is_finished(&self) -> bool {
        self.winner_id.is_some()
    }

    pub fn status(&self) -> LotteryStatus {
        if self.is_finished() {
            LotteryStatus::Finished
        } else {
            LotteryStatus::Active
        }
    }

    pub fn prize_pool(&self) -> f64 {
        self.ticket_price * f64::from(self.max_tickets)
    }

    pub fn percent_sold(&self) -> u32 {
        if self.max_tickets == 0 {
            return 0;
        }
        let percent = (100.0 * f64::from(self.tickets_sold) / f64::from(self.max_tickets)).round();
        (percent as u32).min(100)
    }

    pub fn tickets_left(&self) -> u32 {
        self.max_tickets.saturating_sub(self.tickets_sold)
    }

    pub fn contains_number(&self, number: TicketNumber) -> bool {
        (1..=self.max_tickets).contains(&number)
    }

    /// Username first, then first name, then the raw id.
    pub fn winner_display(&self) -> Option<String> {
        let id = self.winner_id?;
        let name = [&self.winner_username, &self.winner_first_name]
            .into_iter()
            .flatten()
            .find(|name| !name.is_empty())
            .cloned();
        Some(name.unwrap_or_else(|| id.to_string()))
    }

    pub fn ton_equivalent(&self, ton_to_star: Option<f64>) -> Option<f64> {
        let rate = ton_to_star.filter(|rate| *rate > 0.0)?;
        Some((self.prize_pool() / rate * 100.0).round() / 100.0)
    }

    pub fn days_left(&self, now: DateTime<Utc>) -> Option<i64> {
        let end = self.end_date?;
        let seconds = (end - now).num_seconds();
        Some((seconds as f64 / 86_400.0).ceil() as i64)
    }
}

/// Splits a snapshot into (active, finished), preserving order.
pub fn partition(lotteries: &[Lottery]) -> (Vec<&Lottery>, Vec<&Lottery>) {
    lotteries.iter().partition(|lottery| !lottery.is_finished())
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub id: i64,
    #[serde(default)]
    pub lottery_id: Option<LotteryId>,
    pub ticket_number: TicketNumber,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub owner: Option<String>,
}

impl Ticket {
    pub fn owner_display(&self) -> Option<String> {
        self.owner
            .clone()
            .filter(|owner| !owner.is_empty())
            .or_else(|| self.user_id.map(|id| id.to_string()))
    }
}

pub fn taken_numbers(tickets: &[Ticket]) -> BTreeSet<TicketNumber> {
    tickets.iter().map(|ticket| ticket.ticket_number).collect()
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PurchaseRequest {
    pub user_id: UserId,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub ticket_numbers: Vec<TicketNumber>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PurchaseOutcome {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub tickets: Option<Vec<TicketNumber>>,
}

impl PurchaseOutcome {
    pub fn accepted(tickets: Vec<TicketNumber>) -> Self {
        Self { ok: true, detail: None, tickets: Some(tickets) }
    }

    pub fn rejected(detail: impl Into<String>) -> Self {
        Self { ok: false, detail: Some(detail.into()), tickets: None }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub user_id: UserId,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub ton_wallet_address: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct UserStats {
    #[serde(default)]
    pub wins: u32,
    #[serde(default)]
    pub tickets: u32,
    #[serde(default)]
    pub active_lotteries: u32,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct BalanceResponse {
    pub stars_balance: f64,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct RateResponse {
    pub ton_to_star: f64,
    #[serde(default)]
    pub cached: bool,
}

#[derive(Serialize, Debug, Clone)]
pub struct WalletUpdateRequest {
    pub ton_wallet_address: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NewLottery {
    pub name: String,
    pub ticket_price: f64,
    pub max_tickets: u32,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub id: Option<LotteryId>,
    #[serde(default)]
    pub detail: Option<String>,
}

impl Ack {
    pub fn rejected(detail: impl Into<String>) -> Self {
        Self { ok: false, id: None, detail: Some(detail.into()) }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DrawOutcome {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub winner_id: Option<UserId>,
    #[serde(default)]
    pub ticket_number: Option<TicketNumber>,
    #[serde(default)]
    pub detail: Option<String>,
}

impl DrawOutcome {
    pub fn rejected(detail: impl Into<String>) -> Self {
        Self { ok: false, winner_id: None, ticket_number: None, detail: Some(detail.into()) }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct LotteryStats {
    pub tickets_sold: u32,
    pub revenue: f64,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LotteryResult {
    pub lottery_id: LotteryId,
    #[serde(default)]
    pub winner_id: Option<UserId>,
    #[serde(default)]
    pub winner_username: Option<String>,
    #[serde(default)]
    pub winner_first_name: Option<String>,
    #[serde(default)]
    pub winner_last_name: Option<String>,
    #[serde(default)]
    pub winner_ticket_number: Option<TicketNumber>,
    #[serde(default)]
    pub random_link: Option<String>,
}

impl LotteryResult {
    pub fn winner_display(&self) -> Option<String> {
        let id = self.winner_id?;
        let name = [&self.winner_username, &self.winner_first_name]
            .into_iter()
            .flatten()
            .find(|name| !name.is_empty())
            .cloned();
        Some(name.unwrap_or_else(|| id.to_string()))
    }
}

/// The API emits both RFC 3339 and offset-less ISO timestamps; the latter are UTC.
fn lenient_datetime<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    let Some(raw) = raw.filter(|raw| !raw.trim().is_empty()) else {
        return Ok(None);
    };
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(parsed.with_timezone(&Utc)));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| Some(naive.and_utc()))
        .map_err(serde::de::Error::custom)
}
