//! Ticket selection for one open lottery.
//!
//! ```text
//! Closed -> Open -> Submitting -> PurchaseSucceeded -> Closed
//!                        |
//!                        +-> (failure) -> Open, selection kept
//! ```
//!
//! `PurchaseSucceeded` lasts while the cache is refreshed after a purchase.
//!
//! The session lives behind a mutex that is never held across a network
//! call. Each `open`/`close` bumps an epoch; responses that come back under
//! an older epoch are dropped.

use anyhow::{Result, anyhow};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::api::LotteryGateway;
use crate::cache::{LotteryListCache, Snapshot};
use crate::identity::HostIdentity;
use crate::types::{LotteryId, PurchaseRequest, TicketNumber, taken_numbers};

pub const CONNECTION_ERROR: &str = "connection error";
pub const PURCHASE_FAILED: &str = "purchase failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Closed,
    Open,
    Submitting,
    PurchaseSucceeded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ToggleOutcome {
    Selected,
    Deselected,
    /// Already sold; the selection is untouched.
    Taken,
    OutOfRange,
    NotOpen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Purchased { tickets: Vec<TicketNumber> },
    /// Business rejection or connection failure. The session is back in
    /// `Open` with the selection untouched.
    Failed { reason: String },
    /// Rejected locally, no request was sent.
    NothingSelected,
    /// Another submit is still in flight.
    Busy,
    NotOpen,
    /// The session was closed or reopened while the request was in flight.
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionView {
    pub state: SessionState,
    pub lottery_id: Option<LotteryId>,
    pub max_tickets: u32,
    pub taken: Vec<TicketNumber>,
    pub selection: Vec<TicketNumber>,
    pub last_error: Option<String>,
}

impl SessionView {
    pub fn available(&self) -> usize {
        (self.max_tickets as usize).saturating_sub(self.taken.len())
    }

    pub fn can_submit(&self) -> bool {
        self.state == SessionState::Open && !self.selection.is_empty()
    }
}

struct Inner {
    epoch: u64,
    state: SessionState,
    lottery_id: Option<LotteryId>,
    /// Lottery whose `open` is still waiting for its ticket list.
    opening: Option<LotteryId>,
    max_tickets: u32,
    taken: BTreeSet<TicketNumber>,
    selection: BTreeSet<TicketNumber>,
    applied_revision: u64,
    last_error: Option<String>,
}

impl Inner {
    fn closed(epoch: u64) -> Self {
        Self {
            epoch,
            state: SessionState::Closed,
            lottery_id: None,
            opening: None,
            max_tickets: 0,
            taken: BTreeSet::new(),
            selection: BTreeSet::new(),
            applied_revision: 0,
            last_error: None,
        }
    }

    /// Pulls newer server data from the cache and evicts anything that is
    /// no longer selectable.
    fn sync(&mut self, snapshot: &Snapshot) {
        let Some(lottery_id) = self.lottery_id else {
            return;
        };
        if let Some(lottery) = snapshot.lottery(lottery_id) {
            self.max_tickets = lottery.max_tickets;
        }
        if let Some(tickets) = snapshot
            .tickets
            .as_ref()
            .filter(|t| t.lottery_id == lottery_id && t.revision > self.applied_revision)
        {
            self.taken = tickets.taken.clone();
            self.applied_revision = tickets.revision;
        }
        let (max, taken) = (self.max_tickets, &self.taken);
        let before = self.selection.len();
        self.selection.retain(|n| (1..=max).contains(n) && !taken.contains(n));
        if self.selection.len() != before {
            info!(
                "evicted {} sold ticket(s) from selection in lottery {}",
                before - self.selection.len(),
                lottery_id
            );
        }
    }

    fn view(&self) -> SessionView {
        SessionView {
            state: self.state,
            lottery_id: self.lottery_id,
            max_tickets: self.max_tickets,
            taken: self.taken.iter().copied().collect(),
            selection: self.selection.iter().copied().collect(),
            last_error: self.last_error.clone(),
        }
    }
}

pub struct TicketSelectionSession<G> {
    gateway: Arc<G>,
    cache: Arc<LotteryListCache<G>>,
    identity: HostIdentity,
    inner: Mutex<Inner>,
}

impl<G: LotteryGateway> TicketSelectionSession<G> {
    pub fn new(gateway: Arc<G>, cache: Arc<LotteryListCache<G>>, identity: HostIdentity) -> Self {
        Self {
            gateway,
            cache,
            identity,
            inner: Mutex::new(Inner::closed(0)),
        }
    }

    pub fn identity(&self) -> &HostIdentity {
        &self.identity
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_synced(&self) -> MutexGuard<'_, Inner> {
        let snapshot = self.cache.snapshot();
        let mut inner = self.lock();
        inner.sync(&snapshot);
        inner
    }

    pub fn view(&self) -> SessionView {
        self.lock_synced().view()
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Opens `lottery_id` with an empty selection.
    ///
    /// If the ticket list cannot be fetched the session still opens with an
    /// empty taken set; the purchase call remains the final arbiter.
    pub async fn open(&self, lottery_id: LotteryId) -> Result<SessionView> {
        let lottery = match self.cache.lottery(lottery_id) {
            Some(lottery) => lottery,
            None => {
                let _ = self.cache.refresh().await;
                self.cache
                    .lottery(lottery_id)
                    .ok_or_else(|| anyhow!("lottery {lottery_id} not found"))?
            }
        };
        anyhow::ensure!(!lottery.is_finished(), "lottery {lottery_id} is already finished");

        let epoch = {
            let mut inner = self.lock();
            let epoch = inner.epoch + 1;
            *inner = Inner::closed(epoch);
            inner.opening = Some(lottery_id);
            epoch
        };
        self.cache.watch_lottery(lottery_id);

        let fetched = self.gateway.list_tickets(lottery_id).await;
        self.ensure_current(epoch, lottery_id)?;
        let (taken, revision) = match fetched {
            Ok(tickets) => {
                let taken = taken_numbers(&tickets);
                let revision = self.cache.store_tickets(lottery_id, tickets);
                (taken, revision)
            }
            Err(e) => {
                warn!("ticket list for lottery {} unavailable, opening with none taken: {:#}", lottery_id, e);
                (BTreeSet::new(), None)
            }
        };

        let mut inner = self.lock();
        if inner.epoch != epoch {
            debug!("open of lottery {} superseded", lottery_id);
            return Err(anyhow!("session for lottery {lottery_id} was superseded"));
        }
        inner.state = SessionState::Open;
        inner.opening = None;
        inner.lottery_id = Some(lottery_id);
        inner.max_tickets = lottery.max_tickets;
        inner.taken = taken;
        inner.applied_revision = revision.unwrap_or_else(|| {
            self.cache
                .snapshot()
                .tickets
                .as_ref()
                .map_or(0, |tickets| tickets.revision)
        });
        info!("🎟 opened lottery {} ({} taken of {})", lottery_id, inner.taken.len(), lottery.max_tickets);
        Ok(inner.view())
    }

    fn ensure_current(&self, epoch: u64, lottery_id: LotteryId) -> Result<()> {
        if self.lock().epoch == epoch {
            Ok(())
        } else {
            debug!("open of lottery {} superseded", lottery_id);
            Err(anyhow!("session for lottery {lottery_id} was superseded"))
        }
    }

    pub fn toggle(&self, number: TicketNumber) -> ToggleOutcome {
        let mut inner = self.lock_synced();
        if inner.state != SessionState::Open {
            return ToggleOutcome::NotOpen;
        }
        if !(1..=inner.max_tickets).contains(&number) {
            return ToggleOutcome::OutOfRange;
        }
        if inner.taken.contains(&number) {
            return ToggleOutcome::Taken;
        }
        if inner.selection.remove(&number) {
            ToggleOutcome::Deselected
        } else {
            inner.selection.insert(number);
            ToggleOutcome::Selected
        }
    }

    pub async fn submit(&self) -> SubmitOutcome {
        let (epoch, lottery_id, numbers) = {
            let mut inner = self.lock_synced();
            match inner.state {
                SessionState::Submitting => return SubmitOutcome::Busy,
                SessionState::Open => {}
                _ => return SubmitOutcome::NotOpen,
            }
            let Some(lottery_id) = inner.lottery_id else {
                return SubmitOutcome::NotOpen;
            };
            if inner.selection.is_empty() {
                return SubmitOutcome::NothingSelected;
            }
            inner.state = SessionState::Submitting;
            inner.last_error = None;
            let numbers: Vec<TicketNumber> = inner.selection.iter().copied().collect();
            (inner.epoch, lottery_id, numbers)
        };

        let request = PurchaseRequest {
            user_id: self.identity.user_id,
            username: self.identity.username.clone(),
            first_name: self.identity.first_name.clone(),
            last_name: self.identity.last_name.clone(),
            ticket_numbers: numbers.clone(),
        };
        info!("🛒 buying tickets {:?} in lottery {}", numbers, lottery_id);
        let response = self.gateway.submit_purchase(lottery_id, &request).await;

        {
            let mut inner = self.lock();
            if inner.epoch != epoch {
                debug!("purchase response for lottery {} arrived after close", lottery_id);
                return SubmitOutcome::Discarded;
            }
            let reason = match response {
                Ok(outcome) if outcome.ok => {
                    inner.state = SessionState::PurchaseSucceeded;
                    inner.taken.extend(numbers.iter().copied());
                    inner.selection.clear();
                    None
                }
                Ok(outcome) => Some(outcome.detail.unwrap_or_else(|| PURCHASE_FAILED.to_string())),
                Err(e) => {
                    warn!("purchase in lottery {} failed: {:#}", lottery_id, e);
                    Some(CONNECTION_ERROR.to_string())
                }
            };
            if let Some(reason) = reason {
                info!("purchase in lottery {} rejected: {}", lottery_id, reason);
                inner.state = SessionState::Open;
                inner.last_error = Some(reason.clone());
                return SubmitOutcome::Failed { reason };
            }
        }

        info!("✅ bought {} ticket(s) in lottery {}", numbers.len(), lottery_id);
        if let Err(e) = self.cache.refresh().await {
            warn!("refresh after purchase failed: {:#}", e);
        }
        self.reset(Some(epoch));
        SubmitOutcome::Purchased { tickets: numbers }
    }

    /// Leaves the lottery from any state. In-flight responses are discarded.
    pub fn close(&self) {
        self.reset(None);
    }

    /// Returns to `Closed` unless `expected` names an epoch that is already gone.
    fn reset(&self, expected: Option<u64>) {
        let mut inner = self.lock();
        if expected.is_some_and(|epoch| epoch != inner.epoch) {
            return;
        }
        let lottery_id = inner.lottery_id.or(inner.opening);
        let epoch = inner.epoch + 1;
        *inner = Inner::closed(epoch);
        drop(inner);
        if lottery_id.is_some() && self.cache.watched() == lottery_id {
            self.cache.unwatch();
        }
        debug!("session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::DemoGateway;
    use std::time::Duration;

    struct Fixture {
        gateway: Arc<DemoGateway>,
        cache: Arc<LotteryListCache<DemoGateway>>,
        session: Arc<TicketSelectionSession<DemoGateway>>,
        lottery: LotteryId,
    }

    async fn fixture() -> Fixture {
        let gateway = Arc::new(DemoGateway::new());
        let lottery = gateway.add_lottery("Daily", 10.0, 10, &[2, 5, 7]);
        let cache = Arc::new(LotteryListCache::new(Arc::clone(&gateway)));
        cache.refresh().await.unwrap();
        let mut identity = HostIdentity::new(77);
        identity.username = "player".to_string();
        let session = Arc::new(TicketSelectionSession::new(
            Arc::clone(&gateway),
            Arc::clone(&cache),
            identity,
        ));
        Fixture { gateway, cache, session, lottery }
    }

    fn invariant_holds(view: &SessionView) -> bool {
        view.selection
            .iter()
            .all(|n| (1..=view.max_tickets).contains(n) && !view.taken.contains(n))
    }

    #[tokio::test]
    async fn open_seeds_taken_and_clears_selection() {
        let f = fixture().await;
        let view = f.session.open(f.lottery).await.unwrap();
        assert_eq!(view.state, SessionState::Open);
        assert_eq!(view.taken, vec![2, 5, 7]);
        assert!(view.selection.is_empty());
        assert_eq!(view.available(), 7);
        assert_eq!(f.cache.watched(), Some(f.lottery));
    }

    #[tokio::test]
    async fn toggling_a_taken_number_is_a_no_op() {
        let f = fixture().await;
        f.session.open(f.lottery).await.unwrap();
        assert_eq!(f.session.toggle(2), ToggleOutcome::Taken);
        assert!(f.session.view().selection.is_empty());
        assert_eq!(f.session.toggle(0), ToggleOutcome::OutOfRange);
        assert_eq!(f.session.toggle(11), ToggleOutcome::OutOfRange);
    }

    #[tokio::test]
    async fn toggle_flips_membership() {
        let f = fixture().await;
        assert_eq!(f.session.toggle(1), ToggleOutcome::NotOpen);
        f.session.open(f.lottery).await.unwrap();
        assert_eq!(f.session.toggle(4), ToggleOutcome::Selected);
        assert_eq!(f.session.toggle(6), ToggleOutcome::Selected);
        assert_eq!(f.session.toggle(4), ToggleOutcome::Deselected);
        let view = f.session.view();
        assert_eq!(view.selection, vec![6]);
        assert!(invariant_holds(&view));
    }

    #[tokio::test]
    async fn successful_purchase_refreshes_cache() {
        let f = fixture().await;
        f.session.open(f.lottery).await.unwrap();
        f.session.toggle(1);
        f.session.toggle(3);

        let mut updates = f.cache.subscribe();
        let outcome = f.session.submit().await;
        assert_eq!(outcome, SubmitOutcome::Purchased { tickets: vec![1, 3] });

        // The post-purchase refresh carried the new taken set before the visit ended.
        updates.changed().await.unwrap();
        assert_eq!(f.cache.snapshot().lottery(f.lottery).unwrap().tickets_sold, 5);
        let taken = taken_numbers(&f.gateway.tickets_of(f.lottery));
        assert!([1, 2, 3, 5, 7].iter().all(|n| taken.contains(n)));

        let view = f.session.view();
        assert_eq!(view.state, SessionState::Closed);
        assert!(view.selection.is_empty());
        assert_eq!(f.cache.watched(), None);
        assert_eq!(f.session.toggle(4), ToggleOutcome::NotOpen);
    }

    #[tokio::test]
    async fn purchase_succeeded_is_visible_while_refreshing() {
        let f = fixture().await;
        f.session.open(f.lottery).await.unwrap();
        f.session.toggle(1);
        // The refresh after the purchase waits on the ticket list.
        let lists = f.gateway.hold_ticket_lists();

        let pending = tokio::spawn({
            let session = Arc::clone(&f.session);
            async move { session.submit().await }
        });
        while f.session.state() != SessionState::PurchaseSucceeded {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        lists.notify_one();

        assert_eq!(pending.await.unwrap(), SubmitOutcome::Purchased { tickets: vec![1] });
        assert_eq!(f.session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn close_during_open_drops_the_late_ticket_list() {
        let f = fixture().await;
        let lists = f.gateway.hold_ticket_lists();

        let pending = tokio::spawn({
            let (session, lottery) = (Arc::clone(&f.session), f.lottery);
            async move { session.open(lottery).await }
        });
        while f.cache.watched() != Some(f.lottery) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        f.session.close();
        assert_eq!(f.cache.watched(), None);
        lists.notify_one();

        let err = pending.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("superseded"), "{err}");
        assert_eq!(f.session.state(), SessionState::Closed);
        assert_eq!(f.cache.watched(), None);
        assert!(f.cache.snapshot().tickets.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn polling_evicts_numbers_sold_elsewhere() {
        let f = fixture().await;
        f.session.open(f.lottery).await.unwrap();
        f.session.toggle(4);
        f.session.toggle(6);
        let poller = f.cache.start_polling(Duration::from_secs(3));

        let other = PurchaseRequest {
            user_id: 5,
            username: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            ticket_numbers: vec![4],
        };
        f.gateway.submit_purchase(f.lottery, &other).await.unwrap();
        tokio::time::sleep(Duration::from_millis(3_100)).await;

        let view = f.session.view();
        assert_eq!(view.selection, vec![6]);
        assert!(view.taken.contains(&4));
        poller.stop().await;
    }

    #[tokio::test]
    async fn empty_selection_is_rejected_without_a_request() {
        let f = fixture().await;
        f.session.open(f.lottery).await.unwrap();
        assert_eq!(f.session.submit().await, SubmitOutcome::NothingSelected);
        assert_eq!(f.gateway.purchase_calls(), 0);
    }

    #[tokio::test]
    async fn rejection_returns_to_open_with_selection_kept() {
        let f = fixture().await;
        f.session.open(f.lottery).await.unwrap();
        f.session.toggle(4);
        f.session.toggle(6);

        // Someone else buys 4 behind our back; our taken set is stale.
        let other = PurchaseRequest {
            user_id: 5,
            username: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            ticket_numbers: vec![4],
        };
        f.gateway.submit_purchase(f.lottery, &other).await.unwrap();

        let outcome = f.session.submit().await;
        assert_eq!(outcome, SubmitOutcome::Failed { reason: "Ticket 4 already sold".to_string() });
        let view = f.session.view();
        assert_eq!(view.state, SessionState::Open);
        assert_eq!(view.selection, vec![4, 6]);
        assert_eq!(view.last_error.as_deref(), Some("Ticket 4 already sold"));
    }

    #[tokio::test]
    async fn connection_failure_keeps_selection() {
        let f = fixture().await;
        f.session.open(f.lottery).await.unwrap();
        f.session.toggle(9);
        f.gateway.set_offline(true);

        let outcome = f.session.submit().await;
        assert_eq!(outcome, SubmitOutcome::Failed { reason: CONNECTION_ERROR.to_string() });
        assert_eq!(f.session.view().selection, vec![9]);
    }

    #[tokio::test]
    async fn open_degrades_to_empty_taken_set_when_offline() {
        let f = fixture().await;
        f.gateway.set_offline(true);
        let view = f.session.open(f.lottery).await.unwrap();
        assert_eq!(view.state, SessionState::Open);
        assert!(view.taken.is_empty());
        // The stale-looking number is selectable; the server will refuse it.
        assert_eq!(f.session.toggle(2), ToggleOutcome::Selected);
    }

    #[tokio::test]
    async fn refresh_evicts_newly_taken_numbers() {
        let f = fixture().await;
        f.session.open(f.lottery).await.unwrap();
        f.session.toggle(4);
        f.session.toggle(6);

        let other = PurchaseRequest {
            user_id: 5,
            username: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            ticket_numbers: vec![4],
        };
        f.gateway.submit_purchase(f.lottery, &other).await.unwrap();
        f.cache.refresh().await.unwrap();

        let view = f.session.view();
        assert_eq!(view.selection, vec![6]);
        assert!(view.taken.contains(&4));
        assert!(invariant_holds(&view));
    }

    #[tokio::test]
    async fn second_submit_while_submitting_is_a_no_op() {
        let f = fixture().await;
        f.session.open(f.lottery).await.unwrap();
        f.session.toggle(1);
        let gate = f.gateway.hold_purchases();

        let first = tokio::spawn({
            let session = Arc::clone(&f.session);
            async move { session.submit().await }
        });
        while f.session.state() != SessionState::Submitting {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert_eq!(f.session.submit().await, SubmitOutcome::Busy);
        assert_eq!(f.gateway.purchase_calls(), 1);

        gate.notify_one();
        assert_eq!(first.await.unwrap(), SubmitOutcome::Purchased { tickets: vec![1] });
        assert_eq!(f.gateway.purchase_calls(), 1);
    }

    #[tokio::test]
    async fn late_purchase_response_after_close_is_discarded() {
        let f = fixture().await;
        f.session.open(f.lottery).await.unwrap();
        f.session.toggle(1);
        let gate = f.gateway.hold_purchases();

        let pending = tokio::spawn({
            let session = Arc::clone(&f.session);
            async move { session.submit().await }
        });
        while f.session.state() != SessionState::Submitting {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        f.session.close();
        gate.notify_one();

        assert_eq!(pending.await.unwrap(), SubmitOutcome::Discarded);
        let view = f.session.view();
        assert_eq!(view.state, SessionState::Closed);
        assert!(view.selection.is_empty());
    }

    #[tokio::test]
    async fn finished_lottery_cannot_be_opened() {
        let f = fixture().await;
        f.gateway.draw(f.lottery).await.unwrap();
        f.cache.refresh().await.unwrap();
        assert!(f.session.open(f.lottery).await.is_err());
    }
}
