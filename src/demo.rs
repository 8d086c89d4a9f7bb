//! In-memory lottery backend.
//!
//! Mirrors the API's observable rules (all-or-nothing purchases, one draw
//! per lottery) so the bridge can run without a server and the client logic
//! can be exercised end to end.

use anyhow::{Result, anyhow};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::info;

use crate::api::LotteryGateway;
use crate::types::{
    Ack, DEFAULT_CURRENCY, DrawOutcome, Lottery, LotteryId, LotteryResult, LotteryStats,
    NewLottery, PurchaseOutcome, PurchaseRequest, Ticket, TicketNumber, UserId, UserRecord,
    UserStats,
};

pub const DEMO_ADMIN_TOKEN: &str = "demo-admin";
pub const DEMO_TON_TO_STAR: f64 = 25.0;

/// Owner id given to tickets pre-sold by [`DemoGateway::add_lottery`].
pub const HOUSE_USER: UserId = 1;

#[derive(Default)]
struct Backend {
    lotteries: Vec<Lottery>,
    tickets: Vec<Ticket>,
    users: HashMap<UserId, UserRecord>,
    balances: HashMap<UserId, f64>,
    next_lottery_id: LotteryId,
    next_ticket_id: i64,
}

impl Backend {
    fn lottery_mut(&mut self, lottery_id: LotteryId) -> Option<&mut Lottery> {
        self.lotteries.iter_mut().find(|lottery| lottery.id == lottery_id)
    }

    fn push_ticket(&mut self, lottery_id: LotteryId, number: TicketNumber, user_id: UserId, owner: Option<String>) {
        self.next_ticket_id += 1;
        self.tickets.push(Ticket {
            id: self.next_ticket_id,
            lottery_id: Some(lottery_id),
            ticket_number: number,
            user_id: Some(user_id),
            owner,
        });
    }
}

#[derive(Default)]
pub struct DemoGateway {
    backend: Mutex<Backend>,
    offline: AtomicBool,
    purchase_calls: AtomicUsize,
    purchase_gate: Mutex<Option<Arc<Notify>>>,
    ticket_gate: Mutex<Option<Arc<Notify>>>,
}

impl DemoGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend with a few lotteries in different stages.
    pub fn seeded() -> Self {
        let gateway = Self::new();
        gateway.add_lottery("Daily Stars", 10.0, 10, &[2, 5, 7]);
        gateway.add_lottery("Weekend Jackpot", 50.0, 100, &[1, 13, 42]);
        let finished = gateway.add_lottery("Launch Party", 5.0, 4, &[1, 2, 3, 4]);
        gateway.finish(finished, 3);
        info!("🎲 demo backend seeded with 3 lotteries");
        gateway
    }

    fn backend(&self) -> MutexGuard<'_, Backend> {
        self.backend.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(anyhow!("connection error: backend unreachable"));
        }
        Ok(())
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Adds an active lottery whose `sold` numbers belong to [`HOUSE_USER`].
    pub fn add_lottery(&self, name: &str, ticket_price: f64, max_tickets: u32, sold: &[TicketNumber]) -> LotteryId {
        let mut backend = self.backend();
        backend.next_lottery_id += 1;
        let id = backend.next_lottery_id;
        backend.lotteries.push(Lottery {
            id,
            name: name.to_string(),
            description: None,
            ticket_price,
            ticket_price_currency: DEFAULT_CURRENCY.to_string(),
            max_tickets,
            tickets_sold: sold.len() as u32,
            participants: Some(u32::from(!sold.is_empty())),
            end_date: None,
            winner_id: None,
            winner_username: None,
            winner_first_name: None,
            winner_ticket_number: None,
            random_link: None,
            code: None,
            created_at: None,
            finished_at: None,
        });
        for &number in sold {
            backend.push_ticket(id, number, HOUSE_USER, Some("house".to_string()));
        }
        id
    }

    pub fn tickets_of(&self, lottery_id: LotteryId) -> Vec<Ticket> {
        self.backend()
            .tickets
            .iter()
            .filter(|ticket| ticket.lottery_id == Some(lottery_id))
            .cloned()
            .collect()
    }

    pub fn set_wallet(&self, user_id: UserId, address: &str) {
        self.with_user(user_id, |user| user.ton_wallet_address = Some(address.to_string()));
    }

    pub fn set_balance(&self, user_id: UserId, stars: f64) {
        self.backend().balances.insert(user_id, stars);
    }

    fn with_user<R>(&self, user_id: UserId, update: impl FnOnce(&mut UserRecord) -> R) -> R {
        let mut backend = self.backend();
        let user = backend.users.entry(user_id).or_insert_with(|| UserRecord {
            user_id,
            username: None,
            first_name: None,
            last_name: None,
            ton_wallet_address: None,
        });
        update(user)
    }

    /// Makes purchases wait until the returned handle is notified.
    pub fn hold_purchases(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.purchase_gate.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&gate));
        gate
    }

    /// Makes ticket list requests wait until the returned handle is notified.
    pub fn hold_ticket_lists(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.ticket_gate.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&gate));
        gate
    }

    pub fn purchase_calls(&self) -> usize {
        self.purchase_calls.load(Ordering::SeqCst)
    }

    /// Marks the ticket `number` as winning, like the API's draw does.
    fn finish(&self, lottery_id: LotteryId, number: TicketNumber) -> Option<UserId> {
        let mut backend = self.backend();
        let winner = backend
            .tickets
            .iter()
            .find(|t| t.lottery_id == Some(lottery_id) && t.ticket_number == number)
            .cloned()?;
        let user = winner.user_id.and_then(|id| backend.users.get(&id).cloned());
        let lottery = backend.lottery_mut(lottery_id)?;
        lottery.winner_id = winner.user_id;
        lottery.winner_ticket_number = Some(number);
        lottery.winner_username = user.as_ref().and_then(|u| u.username.clone()).or(winner.owner);
        lottery.winner_first_name = user.and_then(|u| u.first_name);
        lottery.random_link = Some(format!("https://api.random.org/signatures/form?demo={lottery_id}"));
        winner.user_id
    }
}

impl LotteryGateway for DemoGateway {
    async fn list_lotteries(&self) -> Result<Vec<Lottery>> {
        self.online()?;
        Ok(self.backend().lotteries.clone())
    }

    async fn list_tickets(&self, lottery_id: LotteryId) -> Result<Vec<Ticket>> {
        let gate = self.ticket_gate.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.online()?;
        Ok(self.tickets_of(lottery_id))
    }

    async fn submit_purchase(&self, lottery_id: LotteryId, request: &PurchaseRequest) -> Result<PurchaseOutcome> {
        self.purchase_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.purchase_gate.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.online()?;

        self.with_user(request.user_id, |user| {
            if !request.username.is_empty() {
                user.username = Some(request.username.clone());
            }
            if !request.first_name.is_empty() {
                user.first_name = Some(request.first_name.clone());
            }
            if !request.last_name.is_empty() {
                user.last_name = Some(request.last_name.clone());
            }
        });

        let mut backend = self.backend();
        let Some(lottery) = backend.lotteries.iter().find(|l| l.id == lottery_id).cloned() else {
            return Ok(PurchaseOutcome::rejected("Lottery not found"));
        };
        if request.ticket_numbers.is_empty() {
            return Ok(PurchaseOutcome::rejected("No tickets selected"));
        }
        if lottery.is_finished() {
            return Ok(PurchaseOutcome::rejected("Lottery already finished"));
        }
        if request.ticket_numbers.len() as u32 + lottery.tickets_sold > lottery.max_tickets {
            return Ok(PurchaseOutcome::rejected("Not enough tickets left"));
        }
        let taken: BTreeSet<TicketNumber> = backend
            .tickets
            .iter()
            .filter(|t| t.lottery_id == Some(lottery_id))
            .map(|t| t.ticket_number)
            .collect();
        let mut requested = BTreeSet::new();
        for number in &request.ticket_numbers {
            if !requested.insert(*number) {
                return Ok(PurchaseOutcome::rejected(format!("Ticket {number} requested twice")));
            }
            if taken.contains(number) {
                return Ok(PurchaseOutcome::rejected(format!("Ticket {number} already sold")));
            }
            if !lottery.contains_number(*number) {
                return Ok(PurchaseOutcome::rejected(format!("Ticket {number} out of range")));
            }
        }

        let owner = (!request.username.is_empty()).then(|| request.username.clone());
        for &number in &request.ticket_numbers {
            backend.push_ticket(lottery_id, number, request.user_id, owner.clone());
        }
        let buyers: BTreeSet<Option<UserId>> = backend
            .tickets
            .iter()
            .filter(|t| t.lottery_id == Some(lottery_id))
            .map(|t| t.user_id)
            .collect();
        if let Some(lottery) = backend.lottery_mut(lottery_id) {
            lottery.tickets_sold += request.ticket_numbers.len() as u32;
            lottery.participants = Some(buyers.len() as u32);
        }
        Ok(PurchaseOutcome::accepted(request.ticket_numbers.clone()))
    }

    async fn get_user(&self, user_id: UserId) -> Result<UserRecord> {
        self.online()?;
        self.backend()
            .users
            .get(&user_id)
            .cloned()
            .ok_or_else(|| anyhow!("/users/{user_id}: User not found"))
    }

    async fn save_wallet(&self, user_id: UserId, address: &str) -> Result<()> {
        self.online()?;
        self.set_wallet(user_id, address);
        Ok(())
    }

    async fn user_stats(&self, user_id: UserId) -> Result<UserStats> {
        self.online()?;
        let backend = self.backend();
        let mine: Vec<&Ticket> = backend.tickets.iter().filter(|t| t.user_id == Some(user_id)).collect();
        let active: BTreeSet<LotteryId> = mine
            .iter()
            .filter_map(|t| t.lottery_id)
            .filter(|id| backend.lotteries.iter().any(|l| l.id == *id && !l.is_finished()))
            .collect();
        Ok(UserStats {
            wins: backend.lotteries.iter().filter(|l| l.winner_id == Some(user_id)).count() as u32,
            tickets: mine.len() as u32,
            active_lotteries: active.len() as u32,
        })
    }

    async fn user_balance(&self, user_id: UserId) -> Result<f64> {
        self.online()?;
        let backend = self.backend();
        anyhow::ensure!(backend.users.contains_key(&user_id), "/users/{user_id}/balance: User not found");
        Ok(backend.balances.get(&user_id).copied().unwrap_or_default())
    }

    async fn ton_star_rate(&self) -> Result<f64> {
        self.online()?;
        Ok(DEMO_TON_TO_STAR)
    }

    async fn create_lottery(&self, lottery: &NewLottery) -> Result<Ack> {
        self.online()?;
        let id = self.add_lottery(&lottery.name, lottery.ticket_price, lottery.max_tickets, &[]);
        Ok(Ack { ok: true, id: Some(id), detail: None })
    }

    async fn update_lottery(&self, lottery_id: LotteryId, update: &NewLottery) -> Result<Ack> {
        self.online()?;
        let mut backend = self.backend();
        let Some(lottery) = backend.lottery_mut(lottery_id) else {
            return Ok(Ack::rejected("Lottery not found"));
        };
        if update.max_tickets < lottery.tickets_sold {
            return Ok(Ack::rejected("max_tickets cannot be less than tickets_sold"));
        }
        lottery.name = update.name.clone();
        lottery.ticket_price = update.ticket_price;
        lottery.max_tickets = update.max_tickets;
        Ok(Ack { ok: true, id: None, detail: None })
    }

    async fn delete_lottery(&self, lottery_id: LotteryId) -> Result<Ack> {
        self.online()?;
        let mut backend = self.backend();
        if backend.lottery_mut(lottery_id).is_none() {
            return Ok(Ack::rejected("Lottery not found"));
        }
        backend.lotteries.retain(|l| l.id != lottery_id);
        backend.tickets.retain(|t| t.lottery_id != Some(lottery_id));
        Ok(Ack { ok: true, id: None, detail: None })
    }

    async fn draw(&self, lottery_id: LotteryId) -> Result<DrawOutcome> {
        self.online()?;
        let (finished, lowest) = {
            let backend = self.backend();
            let Some(lottery) = backend.lotteries.iter().find(|l| l.id == lottery_id) else {
                return Ok(DrawOutcome::rejected("Lottery not found"));
            };
            let lowest = backend
                .tickets
                .iter()
                .filter(|t| t.lottery_id == Some(lottery_id))
                .map(|t| t.ticket_number)
                .min();
            (lottery.is_finished(), lowest)
        };
        if finished {
            return Ok(DrawOutcome::rejected("Winner already chosen"));
        }
        let Some(number) = lowest else {
            return Ok(DrawOutcome::rejected("Unable to draw"));
        };
        let winner_id = self.finish(lottery_id, number);
        Ok(DrawOutcome { ok: true, winner_id, ticket_number: Some(number), detail: None })
    }

    async fn lottery_stats(&self, lottery_id: LotteryId) -> Result<LotteryStats> {
        self.online()?;
        let backend = self.backend();
        let lottery = backend
            .lotteries
            .iter()
            .find(|l| l.id == lottery_id)
            .ok_or_else(|| anyhow!("/lotteries/{lottery_id}/stats: Lottery not found"))?;
        Ok(LotteryStats {
            tickets_sold: lottery.tickets_sold,
            revenue: lottery.ticket_price * f64::from(lottery.tickets_sold),
        })
    }

    async fn lottery_result(&self, lottery_id: LotteryId) -> Result<LotteryResult> {
        self.online()?;
        let backend = self.backend();
        let lottery = backend
            .lotteries
            .iter()
            .find(|l| l.id == lottery_id)
            .ok_or_else(|| anyhow!("/lotteries/{lottery_id}/result: Lottery not found"))?;
        let last_name = lottery
            .winner_id
            .and_then(|id| backend.users.get(&id))
            .and_then(|user| user.last_name.clone());
        Ok(LotteryResult {
            lottery_id,
            winner_id: lottery.winner_id,
            winner_username: lottery.winner_username.clone(),
            winner_first_name: lottery.winner_first_name.clone(),
            winner_last_name: last_name,
            winner_ticket_number: lottery.winner_ticket_number,
            random_link: lottery.random_link.clone(),
        })
    }

    async fn verify_admin_token(&self, token: &str) -> Result<bool> {
        self.online()?;
        Ok(token == DEMO_ADMIN_TOKEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn purchase(user_id: UserId, numbers: &[TicketNumber]) -> PurchaseRequest {
        PurchaseRequest {
            user_id,
            username: "buyer".to_string(),
            first_name: String::new(),
            last_name: String::new(),
            ticket_numbers: numbers.to_vec(),
        }
    }

    #[tokio::test]
    async fn purchase_is_all_or_nothing() {
        let gateway = DemoGateway::new();
        let id = gateway.add_lottery("A", 10.0, 10, &[2, 5, 7]);

        let outcome = gateway.submit_purchase(id, &purchase(9, &[1, 5])).await.unwrap();
        assert_eq!(outcome.detail.as_deref(), Some("Ticket 5 already sold"));
        assert_eq!(gateway.tickets_of(id).len(), 3);

        let outcome = gateway.submit_purchase(id, &purchase(9, &[1, 3])).await.unwrap();
        assert!(outcome.ok);
        let lottery = gateway.list_lotteries().await.unwrap().remove(0);
        assert_eq!(lottery.tickets_sold, 5);
        assert_eq!(lottery.participants, Some(2));
    }

    #[tokio::test]
    async fn duplicate_numbers_are_rejected() {
        let gateway = DemoGateway::new();
        let id = gateway.add_lottery("A", 10.0, 10, &[]);

        let outcome = gateway.submit_purchase(id, &purchase(9, &[3, 3])).await.unwrap();
        assert!(!outcome.ok);
        assert_eq!(outcome.detail.as_deref(), Some("Ticket 3 requested twice"));
        assert!(gateway.tickets_of(id).is_empty());
    }

    #[tokio::test]
    async fn draw_happens_once() {
        let gateway = DemoGateway::new();
        let id = gateway.add_lottery("A", 1.0, 3, &[]);
        assert!(!gateway.draw(id).await.unwrap().ok);

        gateway.submit_purchase(id, &purchase(9, &[2, 3])).await.unwrap();
        let drawn = gateway.draw(id).await.unwrap();
        assert_eq!((drawn.winner_id, drawn.ticket_number), (Some(9), Some(2)));

        let again = gateway.draw(id).await.unwrap();
        assert_eq!(again.detail.as_deref(), Some("Winner already chosen"));
        let result = gateway.lottery_result(id).await.unwrap();
        assert_eq!(result.winner_display().as_deref(), Some("buyer"));
    }

    #[tokio::test]
    async fn seeded_backend_has_active_and_finished() {
        let gateway = DemoGateway::seeded();
        let lotteries = gateway.list_lotteries().await.unwrap();
        assert_eq!(lotteries.iter().filter(|l| l.is_finished()).count(), 1);
        assert_eq!(lotteries.iter().filter(|l| !l.is_finished()).count(), 2);
    }
}
