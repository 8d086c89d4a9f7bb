//! Operator console: create, edit, draw, inspect.
//!
//! Credentials are checked by an [`AdminAuthenticator`]; the console itself
//! only refuses blank input before asking it.

use anyhow::{Result, anyhow};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use crate::api::LotteryGateway;
use crate::cache::{LotteryListCache, Snapshot};
use crate::types::{
    Ack, DrawOutcome, LotteryId, LotteryResult, LotteryStats, NewLottery, Ticket, TicketNumber,
};

pub trait AdminAuthenticator: Send + Sync + 'static {
    fn authenticate(&self, token: &str) -> impl Future<Output = Result<bool>> + Send;
}

/// Lets the lottery API decide whether an admin token is valid.
pub struct ApiAuthenticator<G> {
    gateway: Arc<G>,
}

impl<G> ApiAuthenticator<G> {
    pub fn new(gateway: Arc<G>) -> Self {
        Self { gateway }
    }
}

impl<G: LotteryGateway> AdminAuthenticator for ApiAuthenticator<G> {
    async fn authenticate(&self, token: &str) -> Result<bool> {
        self.gateway.verify_admin_token(token).await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LotteryOverview {
    pub lottery_id: LotteryId,
    pub tickets: Vec<Ticket>,
    pub stats: LotteryStats,
    pub result: LotteryResult,
    pub winning_ticket: Option<TicketNumber>,
}

impl LotteryOverview {
    pub fn is_winning(&self, ticket: &Ticket) -> bool {
        self.winning_ticket == Some(ticket.ticket_number)
    }
}

pub struct AdminConsole<G, A> {
    gateway: Arc<G>,
    cache: Arc<LotteryListCache<G>>,
    auth: A,
    logged_in: AtomicBool,
}

impl<G: LotteryGateway, A: AdminAuthenticator> AdminConsole<G, A> {
    pub fn new(gateway: Arc<G>, cache: Arc<LotteryListCache<G>>, auth: A) -> Self {
        Self {
            gateway,
            cache,
            auth,
            logged_in: AtomicBool::new(false),
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    pub async fn login(&self, token: &str) -> Result<bool> {
        let token = token.trim();
        if token.is_empty() {
            warn!("admin login with empty credentials refused");
            return Ok(false);
        }
        let accepted = self.auth.authenticate(token).await?;
        self.logged_in.store(accepted, Ordering::SeqCst);
        if accepted {
            info!("🔑 admin logged in");
        } else {
            warn!("admin login rejected");
        }
        Ok(accepted)
    }

    pub fn logout(&self) {
        self.logged_in.store(false, Ordering::SeqCst);
    }

    fn require_login(&self) -> Result<()> {
        if self.is_logged_in() {
            Ok(())
        } else {
            Err(anyhow!("admin login required"))
        }
    }

    async fn refresh_after_mutation(&self) {
        if let Err(e) = self.cache.refresh().await {
            warn!("lottery list refresh after admin change failed: {:#}", e);
        }
    }

    pub fn lotteries(&self) -> Result<Arc<Snapshot>> {
        self.require_login()?;
        Ok(self.cache.snapshot())
    }

    pub async fn create_lottery(&self, lottery: NewLottery) -> Result<Ack> {
        self.require_login()?;
        validate(&lottery)?;
        let ack = self.gateway.create_lottery(&lottery).await?;
        if ack.ok {
            info!("created lottery {:?} ({:?})", lottery.name, ack.id);
            self.refresh_after_mutation().await;
        }
        Ok(ack)
    }

    pub async fn update_lottery(&self, lottery_id: LotteryId, lottery: NewLottery) -> Result<Ack> {
        self.require_login()?;
        validate(&lottery)?;
        if let Some(current) = self.cache.lottery(lottery_id) {
            anyhow::ensure!(
                lottery.max_tickets >= current.tickets_sold,
                "max_tickets cannot be less than tickets_sold ({})",
                current.tickets_sold
            );
        }
        let ack = self.gateway.update_lottery(lottery_id, &lottery).await?;
        if ack.ok {
            self.refresh_after_mutation().await;
        }
        Ok(ack)
    }

    pub async fn delete_lottery(&self, lottery_id: LotteryId) -> Result<Ack> {
        self.require_login()?;
        let ack = self.gateway.delete_lottery(lottery_id).await?;
        if ack.ok {
            info!("deleted lottery {}", lottery_id);
            self.refresh_after_mutation().await;
        }
        Ok(ack)
    }

    /// Triggers the irreversible draw. The API refuses a second draw.
    pub async fn draw(&self, lottery_id: LotteryId) -> Result<DrawOutcome> {
        self.require_login()?;
        let outcome = self.gateway.draw(lottery_id).await?;
        if outcome.ok {
            info!(
                "🏆 lottery {} drawn: ticket {:?} won",
                lottery_id, outcome.ticket_number
            );
            self.refresh_after_mutation().await;
        }
        Ok(outcome)
    }

    pub async fn stats(&self, lottery_id: LotteryId) -> Result<LotteryStats> {
        self.require_login()?;
        self.gateway.lottery_stats(lottery_id).await
    }

    pub async fn result(&self, lottery_id: LotteryId) -> Result<LotteryResult> {
        self.require_login()?;
        self.gateway.lottery_result(lottery_id).await
    }

    /// Tickets, stats and result of one lottery, fetched together.
    pub async fn open_lottery(&self, lottery_id: LotteryId) -> Result<LotteryOverview> {
        self.require_login()?;
        let (tickets, stats, result) = tokio::try_join!(
            self.gateway.list_tickets(lottery_id),
            self.stats(lottery_id),
            self.result(lottery_id),
        )?;
        let winning_ticket = result.winner_id.and(result.winner_ticket_number);
        Ok(LotteryOverview {
            lottery_id,
            tickets,
            stats,
            result,
            winning_ticket,
        })
    }
}

fn validate(lottery: &NewLottery) -> Result<()> {
    anyhow::ensure!(!lottery.name.trim().is_empty(), "lottery name is required");
    anyhow::ensure!(
        lottery.ticket_price.is_finite() && lottery.ticket_price > 0.0,
        "ticket price must be positive"
    );
    anyhow::ensure!(lottery.max_tickets > 0, "max_tickets must be positive");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::{DEMO_ADMIN_TOKEN, DemoGateway};
    use crate::types::PurchaseRequest;

    type Console = AdminConsole<DemoGateway, ApiAuthenticator<DemoGateway>>;

    fn console() -> (Arc<DemoGateway>, Console) {
        let gateway = Arc::new(DemoGateway::new());
        let cache = Arc::new(LotteryListCache::new(Arc::clone(&gateway)));
        let auth = ApiAuthenticator::new(Arc::clone(&gateway));
        (Arc::clone(&gateway), AdminConsole::new(gateway, cache, auth))
    }

    fn new_lottery(name: &str, max_tickets: u32) -> NewLottery {
        NewLottery {
            name: name.to_string(),
            ticket_price: 10.0,
            max_tickets,
        }
    }

    #[tokio::test]
    async fn operations_require_login() {
        let (_, console) = console();
        assert!(console.create_lottery(new_lottery("A", 5)).await.is_err());
        assert!(!console.login("wrong").await.unwrap());
        assert!(console.lotteries().is_err());
        assert!(console.login(DEMO_ADMIN_TOKEN).await.unwrap());
        assert!(console.lotteries().is_ok());
        console.logout();
        assert!(!console.is_logged_in());
    }

    #[tokio::test]
    async fn blank_credentials_never_reach_the_api() {
        let (gateway, console) = console();
        gateway.set_offline(true);
        // Offline would turn any API call into an error.
        assert!(!console.login("   ").await.unwrap());
    }

    #[tokio::test]
    async fn create_validates_and_refreshes_list() {
        let (_, console) = console();
        console.login(DEMO_ADMIN_TOKEN).await.unwrap();
        assert!(console.create_lottery(new_lottery(" ", 5)).await.is_err());
        assert!(console.create_lottery(new_lottery("A", 0)).await.is_err());

        let ack = console.create_lottery(new_lottery("Friday", 5)).await.unwrap();
        assert!(ack.ok);
        let snapshot = console.lotteries().unwrap();
        assert_eq!(snapshot.lotteries.len(), 1);
        assert_eq!(snapshot.lotteries[0].name, "Friday");
    }

    #[tokio::test]
    async fn update_cannot_shrink_below_sold() {
        let (gateway, console) = console();
        console.login(DEMO_ADMIN_TOKEN).await.unwrap();
        let id = gateway.add_lottery("A", 10.0, 10, &[1, 2, 3]);
        console.cache.refresh().await.unwrap();

        assert!(console.update_lottery(id, new_lottery("A", 2)).await.is_err());
        let ack = console.update_lottery(id, new_lottery("A+", 20)).await.unwrap();
        assert!(ack.ok);
        assert_eq!(console.cache.lottery(id).unwrap().max_tickets, 20);
    }

    #[tokio::test]
    async fn draw_then_open_marks_winner() {
        let (gateway, console) = console();
        console.login(DEMO_ADMIN_TOKEN).await.unwrap();
        let id = gateway.add_lottery("A", 10.0, 3, &[]);
        let buy = PurchaseRequest {
            user_id: 12,
            username: "lucky".to_string(),
            first_name: String::new(),
            last_name: String::new(),
            ticket_numbers: vec![2, 3],
        };
        gateway.submit_purchase(id, &buy).await.unwrap();

        let drawn = console.draw(id).await.unwrap();
        assert!(drawn.ok);
        assert!(console.cache.lottery(id).unwrap().is_finished());

        let again = console.draw(id).await.unwrap();
        assert!(!again.ok);

        let overview = console.open_lottery(id).await.unwrap();
        assert_eq!(overview.stats.tickets_sold, 2);
        assert_eq!(overview.stats.revenue, 20.0);
        assert_eq!(overview.winning_ticket, Some(2));
        assert_eq!(overview.tickets.iter().filter(|t| overview.is_winning(t)).count(), 1);
        assert_eq!(overview.result.winner_display().as_deref(), Some("lucky"));
    }

    #[tokio::test]
    async fn delete_removes_from_list() {
        let (gateway, console) = console();
        console.login(DEMO_ADMIN_TOKEN).await.unwrap();
        let id = gateway.add_lottery("A", 10.0, 3, &[]);
        assert!(console.delete_lottery(id).await.unwrap().ok);
        assert!(console.lotteries().unwrap().lotteries.is_empty());
        assert!(!console.delete_lottery(id).await.unwrap().ok);
    }
}
