// Client core of the Stars lottery Mini App
pub mod admin;
pub mod api;
pub mod bridge;
pub mod cache;
pub mod config;
pub mod demo;
pub mod identity;
pub mod poll;
pub mod session;
pub mod types;
pub mod use_cases;
pub mod wallet;

pub use api::{HttpGateway, LotteryGateway};
pub use cache::{LotteryListCache, Snapshot};
pub use identity::HostIdentity;
pub use session::{SessionState, SessionView, SubmitOutcome, TicketSelectionSession, ToggleOutcome};
pub use types::*;
pub use wallet::{UserContext, UserContextCache};
