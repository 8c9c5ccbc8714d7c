#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tradepool::{
    Agent, AgentSettings, Asset, AssetId, ConstraintIndex, Credentials, Game, GameId, Partner,
    Pool, PoolSettings, SimulatedTransport, UserId,
};

pub const TF2: u32 = 440;
pub const WAIT: Duration = Duration::from_secs(2);

pub fn tf2() -> Game {
    Game::new(TF2, "Team Fortress 2")
}

pub fn user(account_id: u32) -> UserId {
    UserId::from_account_id(account_id)
}

pub fn partner(account_id: u32) -> Partner {
    Partner {
        id: user(account_id),
        name: format!("partner-{}", account_id),
    }
}

pub fn asset(game: u32, n: u64) -> Asset {
    Asset {
        asset_id: AssetId(n),
        game: GameId(game),
        context_id: 2,
        class_id: n,
        instance_id: 0,
        amount: 1,
        name: format!("asset #{}", n),
        tradable: true,
    }
}

/// A pool that never restarts agents or cancels offers on its own
pub fn quiet_pool() -> Pool {
    Pool::new(
        PoolSettings::default()
            .with_restart_policy(None)
            .with_offer_cancel_delay(None)
            .with_start_timeout(WAIT),
    )
}

pub struct TestAgent {
    pub agent: Agent,
    pub transport: Arc<SimulatedTransport>,
}

impl TestAgent {
    pub fn id(&self) -> tradepool::AgentId {
        self.agent.id().expect("test agents have an id")
    }
}

pub fn build_agent(
    constraints: &ConstraintIndex,
    account_id: u32,
    transport: SimulatedTransport,
    settings: AgentSettings,
) -> TestAgent {
    let transport = Arc::new(transport);
    let agent = Agent::builder(
        Credentials::new(format!("bot-{}", account_id), "hunter2"),
        transport.clone(),
    )
    .id(user(account_id))
    .settings(settings)
    .build(constraints)
    .expect("unique username");
    TestAgent { agent, transport }
}

/// An agent with five TF2 items
pub fn test_agent(constraints: &ConstraintIndex, account_id: u32) -> TestAgent {
    build_agent(
        constraints,
        account_id,
        SimulatedTransport::new(user(account_id)).with_inventory(GameId(TF2), 5),
        AgentSettings::new(),
    )
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
