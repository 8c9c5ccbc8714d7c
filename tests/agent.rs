mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use tradepool::{
    Agent, AgentEvent, AgentId, AgentSettings, AgentState, AgentTransport, ConstraintIndex, Credentials,
    EventKind, GameId, PoolError, RestartPolicy, SessionError, SimulatedTransport,
};

#[tokio::test]
async fn start_waits_for_ready_and_stop_is_idempotent() {
    let constraints = ConstraintIndex::new();
    let a = test_agent(&constraints, 1);
    assert_eq!(a.agent.state(), AgentState::Stopped);

    a.agent.start().await.unwrap();
    assert_eq!(a.agent.state(), AgentState::Active);
    assert!(a.agent.is_ready());
    assert!(!a.transport.is_closed());

    // starting a running agent only waits
    a.agent.start().await.unwrap();
    assert_eq!(a.transport.logins(), 1);

    a.agent.stop().await;
    assert_eq!(a.agent.state(), AgentState::Stopped);
    assert!(a.agent.is_closed());
    assert!(a.transport.is_closed());

    a.agent.stop().await;
    assert_eq!(a.agent.state(), AgentState::Stopped);
}

#[tokio::test]
async fn agent_can_start_again_after_stop() {
    let constraints = ConstraintIndex::new();
    let a = test_agent(&constraints, 1);

    a.agent.start().await.unwrap();
    a.agent.stop().await;
    a.agent.start().await.unwrap();

    assert!(a.agent.is_ready());
    assert!(!a.agent.is_closed());
    assert_eq!(a.transport.logins(), 2);

    a.agent.stop().await;
}

#[tokio::test]
async fn invalid_credentials_fail_the_start() {
    let constraints = ConstraintIndex::new();
    let a = build_agent(
        &constraints,
        1,
        SimulatedTransport::new(user(1))
            .with_login_failure(SessionError::InvalidCredentials("bad password".into())),
        AgentSettings::new(),
    );

    let err = a.agent.start().await.unwrap_err();
    assert!(matches!(
        err,
        PoolError::SessionFailed { state: AgentState::InvalidCredentials, .. }
    ));
    assert_eq!(a.agent.state(), AgentState::InvalidCredentials);
    assert!(a.agent.state().is_failed());

    let errors = a.agent.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].error.is_auth_failure());
    assert!(errors[0].event.is_none());
}

#[tokio::test]
async fn other_session_failures_are_unknown_errors() {
    let constraints = ConstraintIndex::new();
    let a = build_agent(
        &constraints,
        1,
        SimulatedTransport::new(user(1)).with_login_failure(SessionError::Login("rate limited".into())),
        AgentSettings::new(),
    );

    assert!(a.agent.start().await.is_err());
    assert_eq!(a.agent.state(), AgentState::UnknownError);
    assert!(!a.agent.errors()[0].error.is_auth_failure());
}

#[tokio::test]
async fn slow_session_times_out_and_can_be_stopped() {
    let constraints = ConstraintIndex::new();
    let a = build_agent(
        &constraints,
        1,
        SimulatedTransport::new(user(1)).with_connect_delay(Duration::from_secs(30)),
        AgentSettings::new(),
    );

    let err = a
        .agent
        .start_with_timeout(Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::ReadyTimeout { timeout_ms: 50, .. }));
    assert_eq!(a.agent.state(), AgentState::Waiting);

    a.agent.stop().await;
    assert_eq!(a.agent.state(), AgentState::Stopped);
    assert!(a.transport.is_closed());
}

#[tokio::test]
async fn dropped_session_leaves_agent_stopped() {
    let constraints = ConstraintIndex::new();
    let a = test_agent(&constraints, 1);
    a.agent.start().await.unwrap();

    a.transport.drop_session();
    assert!(wait_until(|| a.agent.state() == AgentState::Stopped, WAIT).await);
    assert!(a.agent.errors().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_discards_events_queued_by_the_closed_session() {
    let constraints = ConstraintIndex::new();
    let a = test_agent(&constraints, 1);

    for _ in 0..20 {
        a.agent.start().await.unwrap();
        for _ in 0..10 {
            assert!(a.transport.push_event(AgentEvent::Ready { user: user(1) }));
        }
        a.agent.stop().await;
        assert_eq!(a.agent.state(), AgentState::Stopped);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(a.agent.state(), AgentState::Stopped);
        assert!(!a.agent.is_ready());
    }
    assert!(a.transport.is_closed());
}

#[tokio::test]
async fn restart_policy_reconnects_until_stopped() {
    let constraints = ConstraintIndex::new();
    let a = build_agent(
        &constraints,
        1,
        SimulatedTransport::new(user(1)),
        AgentSettings::new().restart_policy(RestartPolicy::Fixed(Duration::from_millis(30))),
    );
    a.agent.start().await.unwrap();

    assert!(wait_until(|| a.transport.logins() >= 3, WAIT).await);
    assert!(wait_until(|| a.agent.is_ready(), WAIT).await);

    a.agent.stop().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let logins = a.transport.logins();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(a.transport.logins(), logins);
    assert_eq!(a.agent.state(), AgentState::Stopped);
}

#[tokio::test]
async fn manual_restart_opens_a_new_session() {
    let constraints = ConstraintIndex::new();
    let a = test_agent(&constraints, 1);
    a.agent.start().await.unwrap();

    a.agent.restart().await.unwrap();
    assert!(a.agent.is_ready());
    assert_eq!(a.transport.logins(), 2);

    a.agent.stop().await;
}

#[tokio::test]
async fn identity_is_learned_from_the_session() {
    let constraints = ConstraintIndex::new();
    let transport = Arc::new(SimulatedTransport::new(user(42)));
    let agent = Agent::new(Credentials::new("learner", "pw"), transport, &constraints).unwrap();
    assert_eq!(agent.id(), None);
    assert!(agent.trade_url().is_none());

    agent.start().await.unwrap();
    assert_eq!(agent.id(), Some(AgentId::from(user(42))));

    assert!(wait_until(|| agent.trade_url().is_some(), WAIT).await);
    let url = agent.trade_url().unwrap();
    assert_eq!(url.partner, user(42));

    let fresh = agent.generate_trade_url().await.unwrap();
    assert_eq!(agent.trade_url(), Some(fresh));

    agent.stop().await;
}

#[tokio::test]
async fn configured_identity_wins_over_session() {
    let constraints = ConstraintIndex::new();
    let a = build_agent(
        &constraints,
        1,
        SimulatedTransport::new(user(2)),
        AgentSettings::new(),
    );
    a.agent.start().await.unwrap();
    assert_eq!(a.agent.id(), Some(AgentId::from(user(1))));
    a.agent.stop().await;
}

#[tokio::test]
async fn api_key_uses_registration_domain() {
    let constraints = ConstraintIndex::new();
    let a = build_agent(
        &constraints,
        1,
        SimulatedTransport::new(user(1)),
        AgentSettings::new().registration_domain("bots.example.com"),
    );
    assert!(matches!(
        a.agent.register_api_key().await,
        Err(PoolError::NotReady(_))
    ));

    a.agent.start().await.unwrap();
    let key = a.agent.register_api_key().await.unwrap();
    assert!(key.starts_with("bots.example.com-"));

    a.agent.stop().await;
}

#[tokio::test]
async fn prefetch_games_are_fetched_when_ready() {
    let constraints = ConstraintIndex::new();
    let a = build_agent(
        &constraints,
        1,
        SimulatedTransport::new(user(1))
            .with_inventory(GameId(TF2), 3)
            .with_inventory(GameId(730), 2),
        AgentSettings::new().prefetch_games(vec![tf2(), tradepool::Game::new(730, "CS2")]),
    );
    a.agent.start().await.unwrap();

    assert!(wait_until(|| a.agent.inventory().len() == 5, WAIT).await);
    assert_eq!(a.transport.inventory_fetches(GameId(TF2)), 1);
    assert_eq!(a.transport.inventory_fetches(GameId(730)), 1);

    a.agent.stop().await;
}

#[tokio::test]
async fn failing_handler_is_recorded_and_isolated() {
    use std::sync::atomic::{AtomicBool, Ordering};

    let constraints = ConstraintIndex::new();
    let a = test_agent(&constraints, 1);

    let sibling_ran = Arc::new(AtomicBool::new(false));
    a.agent.on(EventKind::TradeReceived, |_agent: Agent, _event: AgentEvent| async move {
        Err::<(), _>(PoolError::Transport("boom".into()))
    });
    a.agent.on(EventKind::TradeReceived, |_agent: Agent, _event: AgentEvent| async move {
        if true {
            panic!("handler exploded");
        }
        Ok::<(), PoolError>(())
    });
    {
        let sibling_ran = sibling_ran.clone();
        a.agent.on(EventKind::TradeReceived, move |_agent: Agent, _event: AgentEvent| {
            let sibling_ran = sibling_ran.clone();
            async move {
                sibling_ran.store(true, Ordering::SeqCst);
                Ok::<(), PoolError>(())
            }
        });
    }

    a.agent.start().await.unwrap();
    a.transport.receive_offer(user(500), Vec::new(), vec![asset(TF2, 1)]);

    assert!(wait_until(|| a.agent.errors().len() == 2, WAIT).await);
    assert!(wait_until(|| sibling_ran.load(Ordering::SeqCst), WAIT).await);

    let errors = a.agent.errors();
    assert!(errors
        .iter()
        .all(|e| e.event == Some(EventKind::TradeReceived)));
    assert!(errors
        .iter()
        .any(|e| matches!(*e.error, PoolError::HandlerPanicked { .. })));
    assert!(a.agent.is_ready());

    a.agent.stop().await;
}
