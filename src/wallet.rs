use anyhow::{Context, Result};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::api::LotteryGateway;
use crate::poll::{self, PollHandle};
use crate::types::{UserId, UserStats};

pub const WALLET_APP_LINK: &str = "https://t.me/wallet";

/// Read model for the header: wallet, balance, exchange rate, stats.
/// `None` means the value could not be loaded.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UserContext {
    pub wallet_address: Option<String>,
    pub stars_balance: Option<f64>,
    pub ton_to_star: Option<f64>,
    pub stats: Option<UserStats>,
}

impl UserContext {
    /// Buying is only offered once a payout wallet is linked.
    pub fn can_purchase(&self) -> bool {
        self.wallet_address.as_deref().is_some_and(|a| !a.is_empty())
    }

    pub fn short_address(&self) -> Option<String> {
        self.wallet_address.as_deref().map(short_address)
    }
}

pub fn short_address(address: &str) -> String {
    let chars: Vec<char> = address.chars().collect();
    if chars.len() <= 10 {
        return address.to_string();
    }
    let head: String = chars[..6].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}

async fn best_effort<T>(what: &str, call: impl Future<Output = Result<T>>) -> Option<T> {
    match call.await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("{} unavailable: {:#}", what, e);
            None
        }
    }
}

/// Loads every part of the context concurrently; one failing part never
/// blocks the others.
pub async fn fetch_user_context<G: LotteryGateway>(gateway: &G, user_id: UserId) -> UserContext {
    let (user, stats, balance, rate) = tokio::join!(
        best_effort("user record", gateway.get_user(user_id)),
        best_effort("user stats", gateway.user_stats(user_id)),
        best_effort("stars balance", gateway.user_balance(user_id)),
        best_effort("TON rate", gateway.ton_star_rate()),
    );
    UserContext {
        wallet_address: user.and_then(|u| u.ton_wallet_address).filter(|a| !a.is_empty()),
        stars_balance: balance,
        ton_to_star: rate,
        stats,
    }
}

/// Keeps a [`UserContext`] fresh on a slow cadence.
pub struct UserContextCache<G> {
    gateway: Arc<G>,
    user_id: UserId,
    context: watch::Sender<UserContext>,
}

impl<G: LotteryGateway> UserContextCache<G> {
    pub fn new(gateway: Arc<G>, user_id: UserId) -> Self {
        let (context, _) = watch::channel(UserContext::default());
        Self { gateway, user_id, context }
    }

    pub fn current(&self) -> UserContext {
        self.context.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<UserContext> {
        self.context.subscribe()
    }

    /// Parts that fail to load keep their previous value.
    pub async fn refresh(&self) -> UserContext {
        let fresh = fetch_user_context(self.gateway.as_ref(), self.user_id).await;
        self.context.send_modify(|context| {
            if fresh.wallet_address.is_some() {
                context.wallet_address = fresh.wallet_address.clone();
            }
            context.stars_balance = fresh.stars_balance.or(context.stars_balance);
            context.ton_to_star = fresh.ton_to_star.or(context.ton_to_star);
            if fresh.stats.is_some() {
                context.stats = fresh.stats.clone();
            }
        });
        self.current()
    }

    fn set_wallet(&self, address: &str) {
        self.context.send_modify(|context| context.wallet_address = Some(address.to_string()));
    }

    pub fn start_polling(self: &Arc<Self>, period: Duration) -> PollHandle {
        let cache = Arc::clone(self);
        poll::spawn_periodic("user context", period, move || {
            let cache = Arc::clone(&cache);
            async move {
                cache.refresh().await;
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WalletConnect {
    Connected { address: String },
    /// No wallet was offered; the host should open the wallet app and retry.
    NeedsWalletApp { link: String },
}

/// Checks the shape of a TON address: raw `workchain:hex64` or the
/// 48-character user-friendly base64/base64url form.
pub fn is_ton_address(address: &str) -> bool {
    if let Some((workchain, hash)) = address.split_once(':') {
        return workchain.parse::<i32>().is_ok()
            && hash.len() == 64
            && hash.chars().all(|c| c.is_ascii_hexdigit());
    }
    address.len() == 48
        && address
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '-' | '_'))
}

/// Links the wallet offered by the host (init payload or wallet-connect
/// bridge) to the user.
pub async fn connect_wallet<G: LotteryGateway>(
    context: &UserContextCache<G>,
    candidate: Option<&str>,
) -> Result<WalletConnect> {
    let Some(address) = candidate.map(str::trim).filter(|a| !a.is_empty()) else {
        info!("no wallet offered, asking host to open {}", WALLET_APP_LINK);
        return Ok(WalletConnect::NeedsWalletApp {
            link: WALLET_APP_LINK.to_string(),
        });
    };
    anyhow::ensure!(is_ton_address(address), "not a TON wallet address: {address}");

    context
        .gateway
        .save_wallet(context.user_id, address)
        .await
        .context("saving wallet failed")?;
    context.set_wallet(address);
    info!("👛 wallet {} linked to user {}", short_address(address), context.user_id);
    Ok(WalletConnect::Connected {
        address: address.to_string(),
    })
}
