use anyhow::{Result, anyhow};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::admin::{AdminConsole, ApiAuthenticator};
use crate::api::LotteryGateway;
use crate::cache::LotteryListCache;
use crate::identity::HostIdentity;
use crate::poll::PollHandle;
use crate::session::{SubmitOutcome, TicketSelectionSession};
use crate::types::{Lottery, LotteryId, LotteryStatus, NewLottery, TicketNumber, partition};
use crate::wallet::{self, UserContextCache};

fn required_i64(arguments: &HashMap<String, Value>, key: &str) -> Result<i64> {
    arguments
        .get(key)
        .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok())))
        .ok_or_else(|| anyhow!("Missing {} parameter", key))
}

fn required_f64(arguments: &HashMap<String, Value>, key: &str) -> Result<f64> {
    arguments
        .get(key)
        .and_then(|v| v.as_f64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok())))
        .ok_or_else(|| anyhow!("Missing {} parameter", key))
}

fn required_str<'a>(arguments: &'a HashMap<String, Value>, key: &str) -> Result<&'a str> {
    arguments
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("Missing {} parameter", key))
}

fn lottery_id(arguments: &HashMap<String, Value>) -> Result<LotteryId> {
    required_i64(arguments, "lottery_id")
}

fn new_lottery(arguments: &HashMap<String, Value>) -> Result<NewLottery> {
    let max_tickets = required_i64(arguments, "max_tickets")?;
    Ok(NewLottery {
        name: required_str(arguments, "name")?.to_string(),
        ticket_price: required_f64(arguments, "ticket_price")?,
        max_tickets: u32::try_from(max_tickets).map_err(|_| anyhow!("max_tickets out of range"))?,
    })
}

#[derive(Serialize)]
struct LotteryCard<'a> {
    #[serde(flatten)]
    lottery: &'a Lottery,
    status: LotteryStatus,
    prize_pool: f64,
    percent_sold: u32,
    tickets_left: u32,
    winner: Option<String>,
    ton_equivalent: Option<f64>,
}

impl<'a> LotteryCard<'a> {
    fn new(lottery: &'a Lottery, ton_to_star: Option<f64>) -> Self {
        Self {
            lottery,
            status: lottery.status(),
            prize_pool: lottery.prize_pool(),
            percent_sold: lottery.percent_sold(),
            tickets_left: lottery.tickets_left(),
            winner: lottery.winner_display(),
            ton_equivalent: lottery.ton_equivalent(ton_to_star),
        }
    }
}

async fn has_wallet<G: LotteryGateway>(context: &UserContextCache<G>) -> bool {
    context.current().can_purchase() || context.refresh().await.can_purchase()
}

struct Player<G> {
    session: TicketSelectionSession<G>,
    context: Arc<UserContextCache<G>>,
}

pub struct PlayerUseCase<G> {
    cache: Arc<LotteryListCache<G>>,
    player: std::result::Result<Player<G>, String>,
}

impl<G: LotteryGateway> PlayerUseCase<G> {
    /// `identity` is the outcome of parsing the host payload; an error there
    /// blocks every player tool except the lottery listing.
    pub fn new(
        gateway: Arc<G>,
        cache: Arc<LotteryListCache<G>>,
        identity: Result<HostIdentity>,
    ) -> Self {
        let player = identity
            .map(|identity| Player {
                context: Arc::new(UserContextCache::new(Arc::clone(&gateway), identity.user_id)),
                session: TicketSelectionSession::new(gateway, Arc::clone(&cache), identity),
            })
            .map_err(|e| format!("{e:#}"));
        Self { cache, player }
    }

    fn player(&self) -> Result<&Player<G>> {
        self.player.as_ref().map_err(|e| anyhow!("{}", e))
    }

    pub async fn refresh_context(&self) {
        if let Ok(player) = self.player() {
            player.context.refresh().await;
        }
    }

    pub fn start_context_polling(&self, period: Duration) -> Option<PollHandle> {
        self.player().ok().map(|player| player.context.start_polling(period))
    }

    pub async fn list_lotteries(&self, _arguments: &HashMap<String, Value>) -> Result<String> {
        let snapshot = self.cache.snapshot();
        let rate = self.player().ok().and_then(|p| p.context.current().ton_to_star);
        let (active, finished) = partition(&snapshot.lotteries);
        let cards = |lotteries: Vec<&Lottery>| -> Vec<Value> {
            lotteries
                .into_iter()
                .map(|lottery| json!(LotteryCard::new(lottery, rate)))
                .collect()
        };

        Ok(json!({
            "success": true,
            "active": cards(active),
            "finished": cards(finished),
            "refreshed_at": snapshot.refreshed_at,
            "last_error": snapshot.last_error
        })
        .to_string())
    }

    pub async fn open_lottery(&self, arguments: &HashMap<String, Value>) -> Result<String> {
        let player = self.player()?;
        let lottery_id = lottery_id(arguments)?;
        let view = player.session.open(lottery_id).await?;

        Ok(json!({
            "success": true,
            "session": view,
            "can_purchase": player.context.current().can_purchase()
        })
        .to_string())
    }

    pub async fn toggle_ticket(&self, arguments: &HashMap<String, Value>) -> Result<String> {
        let player = self.player()?;
        let number = required_i64(arguments, "number")?;
        let number = TicketNumber::try_from(number).map_err(|_| anyhow!("number out of range"))?;
        let outcome = player.session.toggle(number);

        Ok(json!({
            "success": true,
            "outcome": outcome,
            "session": player.session.view()
        })
        .to_string())
    }

    pub async fn submit_purchase(&self, _arguments: &HashMap<String, Value>) -> Result<String> {
        let player = self.player()?;
        // Refusals the session decides locally need no wallet lookup.
        if player.session.view().can_submit() && !has_wallet(&player.context).await {
            return Err(anyhow!("link a TON wallet before buying tickets"));
        }
        let outcome = player.session.submit().await;
        if matches!(outcome, SubmitOutcome::Purchased { .. }) {
            player.context.refresh().await;
        }

        Ok(json!({
            "success": matches!(outcome, SubmitOutcome::Purchased { .. }),
            "outcome": outcome,
            "session": player.session.view()
        })
        .to_string())
    }

    pub async fn close_lottery(&self, _arguments: &HashMap<String, Value>) -> Result<String> {
        let player = self.player()?;
        player.session.close();

        Ok(json!({
            "success": true,
            "session": player.session.view()
        })
        .to_string())
    }

    pub async fn session_state(&self, _arguments: &HashMap<String, Value>) -> Result<String> {
        let player = self.player()?;

        Ok(json!({
            "success": true,
            "session": player.session.view()
        })
        .to_string())
    }

    pub async fn user_context(&self, arguments: &HashMap<String, Value>) -> Result<String> {
        let player = self.player()?;
        let refresh = arguments.get("refresh").and_then(|v| v.as_bool()).unwrap_or(false);
        let context = if refresh {
            player.context.refresh().await
        } else {
            player.context.current()
        };
        let identity = player.session.identity();

        Ok(json!({
            "success": true,
            "user": {
                "id": identity.user_id,
                "display_name": identity.display_name(),
                "photo_url": identity.photo_url
            },
            "context": context,
            "short_address": context.short_address(),
            "can_purchase": context.can_purchase()
        })
        .to_string())
    }

    pub async fn connect_wallet(&self, arguments: &HashMap<String, Value>) -> Result<String> {
        let player = self.player()?;
        let address = arguments.get("address").and_then(|v| v.as_str());
        let result = wallet::connect_wallet(&player.context, address).await?;

        Ok(json!({
            "success": true,
            "wallet": result
        })
        .to_string())
    }
}

pub struct AdminUseCase<G> {
    console: AdminConsole<G, ApiAuthenticator<G>>,
}

impl<G: LotteryGateway> AdminUseCase<G> {
    pub fn new(gateway: Arc<G>, cache: Arc<LotteryListCache<G>>) -> Self {
        let auth = ApiAuthenticator::new(Arc::clone(&gateway));
        Self {
            console: AdminConsole::new(gateway, cache, auth),
        }
    }

    pub async fn login(&self, arguments: &HashMap<String, Value>) -> Result<String> {
        let token = arguments.get("token").and_then(|v| v.as_str()).unwrap_or_default();
        let accepted = self.console.login(token).await?;

        Ok(json!({
            "success": accepted,
            "message": if accepted { "Logged in" } else { "Wrong password" }
        })
        .to_string())
    }

    pub async fn list_lotteries(&self, _arguments: &HashMap<String, Value>) -> Result<String> {
        let snapshot = self.console.lotteries()?;
        let rows: Vec<Value> = snapshot
            .lotteries
            .iter()
            .map(|lottery| json!(LotteryCard::new(lottery, None)))
            .collect();

        Ok(json!({
            "success": true,
            "lotteries": rows
        })
        .to_string())
    }

    pub async fn create_lottery(&self, arguments: &HashMap<String, Value>) -> Result<String> {
        let lottery = new_lottery(arguments)?;
        let ack = self.console.create_lottery(lottery).await?;

        Ok(json!({
            "success": ack.ok,
            "lottery_id": ack.id,
            "message": ack.detail.unwrap_or_else(|| "Lottery created".to_string())
        })
        .to_string())
    }

    pub async fn update_lottery(&self, arguments: &HashMap<String, Value>) -> Result<String> {
        let lottery_id = lottery_id(arguments)?;
        let lottery = new_lottery(arguments)?;
        let ack = self.console.update_lottery(lottery_id, lottery).await?;

        Ok(json!({
            "success": ack.ok,
            "message": ack.detail.unwrap_or_else(|| format!("Lottery {} updated", lottery_id))
        })
        .to_string())
    }

    pub async fn delete_lottery(&self, arguments: &HashMap<String, Value>) -> Result<String> {
        let lottery_id = lottery_id(arguments)?;
        let ack = self.console.delete_lottery(lottery_id).await?;

        Ok(json!({
            "success": ack.ok,
            "message": ack.detail.unwrap_or_else(|| format!("Lottery {} deleted", lottery_id))
        })
        .to_string())
    }

    pub async fn draw(&self, arguments: &HashMap<String, Value>) -> Result<String> {
        let lottery_id = lottery_id(arguments)?;
        let outcome = self.console.draw(lottery_id).await?;

        Ok(json!({
            "success": outcome.ok,
            "result": outcome
        })
        .to_string())
    }

    pub async fn lottery_stats(&self, arguments: &HashMap<String, Value>) -> Result<String> {
        let lottery_id = lottery_id(arguments)?;
        let stats = self.console.stats(lottery_id).await?;

        Ok(json!({
            "success": true,
            "stats": stats
        })
        .to_string())
    }

    pub async fn open_lottery(&self, arguments: &HashMap<String, Value>) -> Result<String> {
        let lottery_id = lottery_id(arguments)?;
        let overview = self.console.open_lottery(lottery_id).await?;

        Ok(json!({
            "success": true,
            "overview": overview,
            "winner": overview.result.winner_display()
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::DemoGateway;

    fn player(gateway: &Arc<DemoGateway>) -> PlayerUseCase<DemoGateway> {
        let cache = Arc::new(LotteryListCache::new(Arc::clone(gateway)));
        PlayerUseCase::new(Arc::clone(gateway), cache, Ok(HostIdentity::new(7)))
    }

    fn args(value: Value) -> HashMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn empty_submit_skips_wallet_lookup() {
        let gateway = Arc::new(DemoGateway::seeded());
        let player = player(&gateway);
        player.open_lottery(&args(json!({ "lottery_id": 1 }))).await.unwrap();

        // Offline: any wallet lookup would leave no wallet and refuse the call.
        gateway.set_offline(true);
        let reply: Value = serde_json::from_str(&player.submit_purchase(&HashMap::new()).await.unwrap()).unwrap();
        assert_eq!(reply["success"], false);
        assert_eq!(reply["outcome"]["result"], "nothing_selected");
        assert_eq!(gateway.purchase_calls(), 0);
    }

    #[tokio::test]
    async fn selected_tickets_need_a_wallet() {
        let gateway = Arc::new(DemoGateway::seeded());
        let player = player(&gateway);
        player.open_lottery(&args(json!({ "lottery_id": 1 }))).await.unwrap();
        player.toggle_ticket(&args(json!({ "number": 1 }))).await.unwrap();

        let err = player.submit_purchase(&HashMap::new()).await.unwrap_err();
        assert!(err.to_string().contains("TON wallet"), "{err}");
        assert_eq!(gateway.purchase_calls(), 0);
    }
}
