use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::LotteryGateway;
use crate::poll::{self, PollHandle};
use crate::types::{Lottery, LotteryId, Ticket, TicketNumber, taken_numbers};

/// Sold tickets of the lottery currently opened by the user.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TicketSnapshot {
    pub lottery_id: LotteryId,
    /// Increases with every stored ticket list, across lotteries.
    pub revision: u64,
    pub tickets: Vec<Ticket>,
    pub taken: BTreeSet<TicketNumber>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub lotteries: Vec<Lottery>,
    pub tickets: Option<TicketSnapshot>,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Snapshot {
    pub fn lottery(&self, lottery_id: LotteryId) -> Option<&Lottery> {
        self.lotteries.iter().find(|lottery| lottery.id == lottery_id)
    }

    pub fn taken_for(&self, lottery_id: LotteryId) -> Option<&BTreeSet<TicketNumber>> {
        self.tickets
            .as_ref()
            .filter(|tickets| tickets.lottery_id == lottery_id)
            .map(|tickets| &tickets.taken)
    }
}

/// Last-known lottery list plus the taken set of the watched lottery.
///
/// Readers always get the current snapshot immediately, even while a refresh
/// is in flight. A failed refresh keeps the previous data and only records
/// the error. Concurrent refreshes are not coordinated: whichever response
/// lands last wins.
pub struct LotteryListCache<G> {
    gateway: Arc<G>,
    watched: Mutex<Option<LotteryId>>,
    revision: AtomicU64,
    snapshot: watch::Sender<Arc<Snapshot>>,
}

impl<G: LotteryGateway> LotteryListCache<G> {
    pub fn new(gateway: Arc<G>) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Snapshot::default()));
        Self {
            gateway,
            watched: Mutex::new(None),
            revision: AtomicU64::new(0),
            snapshot,
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshot.subscribe()
    }

    pub fn lottery(&self, lottery_id: LotteryId) -> Option<Lottery> {
        self.snapshot().lottery(lottery_id).cloned()
    }

    pub fn watched(&self) -> Option<LotteryId> {
        *self.watched.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts including `lottery_id`'s tickets in every refresh.
    pub fn watch_lottery(&self, lottery_id: LotteryId) {
        *self.watched.lock().unwrap_or_else(PoisonError::into_inner) = Some(lottery_id);
        self.snapshot.send_if_modified(|snapshot| {
            if snapshot.tickets.as_ref().is_some_and(|t| t.lottery_id != lottery_id) {
                Arc::make_mut(snapshot).tickets = None;
                true
            } else {
                false
            }
        });
        debug!("watching tickets of lottery {}", lottery_id);
    }

    pub fn unwatch(&self) {
        *self.watched.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.snapshot.send_if_modified(|snapshot| {
            if snapshot.tickets.is_some() {
                Arc::make_mut(snapshot).tickets = None;
                true
            } else {
                false
            }
        });
    }

    /// Stores a ticket list fetched elsewhere. Ignored, returning `None`,
    /// when `lottery_id` is no longer the watched lottery.
    pub fn store_tickets(&self, lottery_id: LotteryId, tickets: Vec<Ticket>) -> Option<u64> {
        if self.watched() != Some(lottery_id) {
            debug!("dropping late ticket list for lottery {}", lottery_id);
            return None;
        }
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let taken = taken_numbers(&tickets);
        self.snapshot.send_modify(|snapshot| {
            Arc::make_mut(snapshot).tickets = Some(TicketSnapshot {
                lottery_id,
                revision,
                tickets,
                taken,
            });
        });
        Some(revision)
    }

    /// Fetches the lottery list and, if a lottery is watched, its tickets.
    pub async fn refresh(&self) -> Result<()> {
        let watched = self.watched();
        let tickets = async {
            match watched {
                Some(id) => Some(self.gateway.list_tickets(id).await.map(|t| (id, t))),
                None => None,
            }
        };
        let (lotteries, tickets) = tokio::join!(self.gateway.list_lotteries(), tickets);

        let mut errors = Vec::new();
        match lotteries {
            Ok(lotteries) => {
                debug!("refreshed {} lotteries", lotteries.len());
                self.snapshot.send_modify(|snapshot| {
                    let snapshot = Arc::make_mut(snapshot);
                    snapshot.lotteries = lotteries;
                    snapshot.refreshed_at = Some(Utc::now());
                });
            }
            Err(e) => {
                warn!("lottery list refresh failed: {:#}", e);
                errors.push(format!("{e:#}"));
            }
        }
        match tickets {
            Some(Ok((id, tickets))) => {
                self.store_tickets(id, tickets);
            }
            Some(Err(e)) => {
                warn!("ticket refresh failed: {:#}", e);
                errors.push(format!("{e:#}"));
            }
            None => {}
        }

        let last_error = (!errors.is_empty()).then(|| errors.join("; "));
        self.snapshot.send_if_modified(|snapshot| {
            if snapshot.last_error == last_error {
                return false;
            }
            Arc::make_mut(snapshot).last_error = last_error.clone();
            true
        });

        match last_error {
            None => Ok(()),
            Some(error) => Err(anyhow!("refresh failed: {error}")),
        }
    }

    /// Spawns the periodic refresh. The returned handle stops it.
    pub fn start_polling(self: &Arc<Self>, period: Duration) -> PollHandle {
        let cache = Arc::clone(self);
        info!("🎰 lottery list cache online");
        poll::spawn_periodic("lottery list", period, move || {
            let cache = Arc::clone(&cache);
            async move {
                let _ = cache.refresh().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::DemoGateway;

    fn cache(gateway: &Arc<DemoGateway>) -> Arc<LotteryListCache<DemoGateway>> {
        Arc::new(LotteryListCache::new(Arc::clone(gateway)))
    }

    #[tokio::test]
    async fn refresh_fills_snapshot_and_watched_tickets() {
        let gateway = Arc::new(DemoGateway::new());
        let id = gateway.add_lottery("Weekly", 10.0, 10, &[2, 5, 7]);
        let cache = cache(&gateway);

        cache.refresh().await.unwrap();
        let snapshot = cache.snapshot();
        assert_eq!(snapshot.lotteries.len(), 1);
        assert!(snapshot.tickets.is_none());
        assert!(snapshot.refreshed_at.is_some());

        cache.watch_lottery(id);
        cache.refresh().await.unwrap();
        let taken: Vec<_> = cache.snapshot().taken_for(id).unwrap().iter().copied().collect();
        assert_eq!(taken, vec![2, 5, 7]);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_last_good_snapshot() {
        let gateway = Arc::new(DemoGateway::new());
        gateway.add_lottery("Weekly", 10.0, 10, &[]);
        let cache = cache(&gateway);
        cache.refresh().await.unwrap();

        gateway.set_offline(true);
        assert!(cache.refresh().await.is_err());
        let snapshot = cache.snapshot();
        assert_eq!(snapshot.lotteries.len(), 1);
        assert!(snapshot.last_error.as_deref().unwrap().contains("connection error"));

        gateway.set_offline(false);
        cache.refresh().await.unwrap();
        assert!(cache.snapshot().last_error.is_none());
    }

    #[tokio::test]
    async fn late_ticket_lists_for_unwatched_lottery_are_dropped() {
        let gateway = Arc::new(DemoGateway::new());
        let first = gateway.add_lottery("A", 1.0, 5, &[1]);
        let second = gateway.add_lottery("B", 1.0, 5, &[2]);
        let cache = cache(&gateway);

        cache.watch_lottery(second);
        assert!(cache.store_tickets(first, gateway.tickets_of(first)).is_none());
        assert!(cache.snapshot().tickets.is_none());

        let rev = cache.store_tickets(second, gateway.tickets_of(second)).unwrap();
        assert_eq!(cache.snapshot().tickets.as_ref().unwrap().revision, rev);

        cache.unwatch();
        assert!(cache.snapshot().tickets.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn polling_picks_up_new_lotteries() {
        let gateway = Arc::new(DemoGateway::new());
        let cache = cache(&gateway);
        let mut updates = cache.subscribe();
        let handle = cache.start_polling(Duration::from_secs(3));

        gateway.add_lottery("Fresh", 5.0, 20, &[]);
        tokio::time::sleep(Duration::from_millis(3_100)).await;
        updates.changed().await.unwrap();
        assert_eq!(cache.snapshot().lotteries[0].name, "Fresh");

        handle.stop().await;
    }
}
