mod common;

use common::*;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use tradepool::{
    Agent, AgentEvent, AgentSettings, AgentState, AgentTransport, ConstraintIndex, Credentials,
    GameId, Pool, PoolError, PoolEventContext, SessionError, SimulatedTransport,
};

/// Four agents start together, share their items and offers, and stop together.
#[tokio::test]
async fn pool_runs_agents_end_to_end() {
    let constraints = ConstraintIndex::new();
    let pool = quiet_pool();
    let agents: Vec<TestAgent> = (1..=4).map(|n| test_agent(&constraints, n)).collect();
    for a in &agents {
        pool.add(&a.agent).unwrap();
    }
    assert_eq!(pool.len(), 4);

    let report = pool.startup().await;
    assert!(report.all_ready(), "failed: {:?}", report.failed);
    assert_eq!(report.ready.len(), 4);
    assert!(agents.iter().all(|a| a.agent.is_ready()));

    for a in &agents {
        a.agent.fetch_inventory(&tf2()).await.unwrap();
    }
    assert!(wait_until(|| pool.items().len() == 20, WAIT).await);

    let first = &agents[0];
    let item = pool.items().items_of(first.id())[0].clone();
    let offer = pool
        .create_offer(partner(900), Some("tok3n".into()), "hello", &[item], Vec::new())
        .unwrap();
    assert_eq!(offer.owner_id(), first.id());

    let id = offer.send().await.unwrap();
    assert_eq!(first.agent.offers().len(), 1);
    assert!(wait_until(|| pool.offers().len() == 1, WAIT).await);
    assert!(pool.get_offer(id).is_some());

    pool.shutdown().await;
    for a in &agents {
        assert_eq!(a.agent.state(), AgentState::Stopped);
        assert!(a.transport.is_closed());
    }
}

#[tokio::test]
async fn startup_reports_failures_without_affecting_others() {
    let constraints = ConstraintIndex::new();
    let pool = quiet_pool();

    let good = test_agent(&constraints, 1);
    let bad_login = build_agent(
        &constraints,
        2,
        SimulatedTransport::new(user(2))
            .with_login_failure(SessionError::InvalidCredentials("wrong password".into())),
        AgentSettings::new(),
    );
    let bad_connect = build_agent(
        &constraints,
        3,
        SimulatedTransport::new(user(3))
            .with_connect_failure(SessionError::Connection("socket reset".into())),
        AgentSettings::new(),
    );
    for a in [&good, &bad_login, &bad_connect] {
        pool.add(&a.agent).unwrap();
    }

    let report = pool.startup().await;
    assert_eq!(report.ready, vec![good.id()]);
    assert_eq!(report.failed.len(), 2);
    assert!(!report.all_ready());

    assert_eq!(good.agent.state(), AgentState::Active);
    assert_eq!(bad_login.agent.state(), AgentState::InvalidCredentials);
    assert_eq!(bad_connect.agent.state(), AgentState::UnknownError);
    assert!(matches!(
        *bad_login.agent.errors()[0].error,
        PoolError::InvalidCredentials(_)
    ));
    assert_eq!(pool.errors().len(), 2);

    pool.shutdown().await;
}

#[tokio::test]
async fn add_rejects_bound_and_anonymous_agents() {
    let constraints = ConstraintIndex::new();
    let pool = quiet_pool();
    let a = test_agent(&constraints, 1);

    assert_ok!(pool.add(&a.agent));
    assert!(matches!(
        pool.add(&a.agent),
        Err(PoolError::AlreadyBound(id)) if id == a.id()
    ));

    let other = quiet_pool();
    assert!(matches!(other.add(&a.agent), Err(PoolError::AlreadyBound(_))));

    let anonymous = Agent::new(
        Credentials::new("anonymous", "pw"),
        std::sync::Arc::new(SimulatedTransport::new(user(5))),
        &constraints,
    )
    .unwrap();
    assert!(matches!(
        pool.add(&anonymous),
        Err(PoolError::MissingIdentity(name)) if name == "anonymous"
    ));
}

#[tokio::test]
async fn non_strict_add_moves_agent_between_pools() {
    let constraints = ConstraintIndex::new();
    let first = quiet_pool();
    let second = quiet_pool();
    let a = test_agent(&constraints, 1);

    assert_ok!(first.add(&a.agent));
    assert_ok!(second.add_with(&a.agent, false));
    assert_err!(first.remove(&a.agent));

    assert!(!first.contains(a.id()));
    assert!(second.contains(a.id()));
    assert!(a.agent.pool().unwrap().ptr_eq(&second));
}

#[tokio::test]
async fn remove_unbinds_and_purges_agent_data() {
    let constraints = ConstraintIndex::new();
    let pool = quiet_pool();
    let a = test_agent(&constraints, 1);
    pool.add(&a.agent).unwrap();
    a.agent.start().await.unwrap();

    a.agent.fetch_inventory(&tf2()).await.unwrap();
    assert!(wait_until(|| pool.items().len() == 5, WAIT).await);

    let offer = a
        .agent
        .create_offer(partner(900), None, "", vec![asset(TF2, 1)], Vec::new())
        .unwrap();
    offer.send().await.unwrap();
    assert!(wait_until(|| pool.offers().len() == 1, WAIT).await);

    pool.remove(&a.agent).unwrap();
    assert!(a.agent.pool().is_none());
    assert!(!pool.contains(a.id()));
    assert!(pool.items().is_empty());
    assert!(pool.offers().is_empty());

    // the agent keeps its own caches
    assert_eq!(a.agent.inventory().len(), 5);
    assert_eq!(a.agent.offers().len(), 1);

    assert!(matches!(
        pool.remove(&a.agent),
        Err(PoolError::AgentNotFound(_))
    ));
    assert!(matches!(pool.pop(a.id()), Err(PoolError::AgentNotFound(_))));

    a.agent.stop().await;
}

#[tokio::test]
async fn unbound_agent_no_longer_feeds_the_pool() {
    let constraints = ConstraintIndex::new();
    let pool = quiet_pool();
    let a = test_agent(&constraints, 1);
    pool.add(&a.agent).unwrap();
    a.agent.start().await.unwrap();

    let popped = pool.pop(a.id()).unwrap();
    assert!(popped.ptr_eq(&a.agent));

    a.agent.fetch_inventory(&tf2()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(pool.items().is_empty());

    a.agent.stop().await;
}

#[tokio::test]
async fn pool_defaults_apply_until_agent_overrides() {
    let constraints = ConstraintIndex::new();
    let pool = Pool::new(
        tradepool::PoolSettings::default()
            .with_restart_policy(None)
            .with_offer_cancel_delay(Some(Duration::from_secs(30)))
            .with_whitelist([user(77)]),
    );
    let plain = test_agent(&constraints, 1);
    let custom = build_agent(
        &constraints,
        2,
        SimulatedTransport::new(user(2)),
        AgentSettings::new()
            .offer_cancel_delay(Duration::from_secs(5))
            .whitelist([user(88)])
            .registration_domain("bots.example.com"),
    );
    pool.add(&plain.agent).unwrap();
    pool.add(&custom.agent).unwrap();

    assert_eq!(plain.agent.offer_cancel_delay(), Some(Duration::from_secs(30)));
    assert!(plain.agent.is_whitelisted(user(77)));
    assert_eq!(plain.agent.registration_domain(), "localhost");

    assert_eq!(custom.agent.offer_cancel_delay(), Some(Duration::from_secs(5)));
    assert!(!custom.agent.is_whitelisted(user(77)));
    assert!(custom.agent.is_whitelisted(user(88)));
    assert_eq!(custom.agent.registration_domain(), "bots.example.com");

    pool.remove(&plain.agent).unwrap();
    assert_eq!(plain.agent.offer_cancel_delay(), None);
    assert!(!plain.agent.is_whitelisted(user(77)));
}

#[tokio::test]
async fn usernames_are_unique_while_agents_live() {
    let constraints = ConstraintIndex::new();
    let first = test_agent(&constraints, 1);

    let duplicate = Agent::new(
        Credentials::new("bot-1", "other"),
        std::sync::Arc::new(SimulatedTransport::new(user(2))),
        &constraints,
    );
    assert!(matches!(
        duplicate,
        Err(PoolError::DuplicateConstraint { .. })
    ));

    // a separate index does not know about the first agent
    let elsewhere = ConstraintIndex::new();
    assert!(Agent::new(
        Credentials::new("bot-1", "other"),
        std::sync::Arc::new(SimulatedTransport::new(user(2))),
        &elsewhere,
    )
    .is_ok());

    drop(first);
    assert!(Agent::new(
        Credentials::new("bot-1", "other"),
        std::sync::Arc::new(SimulatedTransport::new(user(2))),
        &constraints,
    )
    .is_ok());
}

#[tokio::test]
async fn pool_handlers_see_events_of_bound_agents() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tradepool::EventKind;

    let constraints = ConstraintIndex::new();
    let pool = quiet_pool();
    let a = test_agent(&constraints, 1);
    pool.add(&a.agent).unwrap();

    let updates = Arc::new(AtomicUsize::new(0));
    {
        let updates = updates.clone();
        pool.on(EventKind::InventoryUpdated, move |ctx: PoolEventContext, _event: AgentEvent| {
            let updates = updates.clone();
            async move {
                assert!(ctx.is_current());
                updates.fetch_add(1, Ordering::SeqCst);
                Ok::<(), PoolError>(())
            }
        });
    }

    a.agent.start().await.unwrap();
    a.transport.set_inventory_size(GameId(TF2), 2);
    a.agent.fetch_inventory(&tf2()).await.unwrap();
    a.agent.fetch_inventory(&tf2()).await.unwrap();

    assert!(wait_until(|| updates.load(Ordering::SeqCst) == 2, WAIT).await);
    pool.shutdown().await;
}

#[tokio::test]
async fn offer_resolved_before_the_pool_sees_it_is_not_tracked() {
    let constraints = ConstraintIndex::new();
    let pool = quiet_pool();
    let a = test_agent(&constraints, 1);
    pool.add(&a.agent).unwrap();
    a.agent.start().await.unwrap();

    let offer = a
        .agent
        .create_offer(partner(900), None, "", vec![asset(TF2, 1)], Vec::new())
        .unwrap();
    let id = offer.send().await.unwrap();
    // the pool's OfferSent handler is still queued
    offer.cancel().await.unwrap();

    assert!(wait_until(|| a.agent.offers().is_empty(), WAIT).await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!pool.offers().contains(id));
    assert!(pool.offers().is_empty());

    pool.shutdown().await;
}
