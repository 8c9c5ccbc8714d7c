//! Built-in agent handlers

use tracing::{debug, error, info};

use super::Agent;
use crate::dispatch::{AgentEvent, EventKind, HandlerTable};
use crate::error::Result;
use crate::types::{Game, TradeUrl};

pub(super) fn install(table: &HandlerTable<Agent>) {
    table.on(EventKind::Ready, on_ready);
    table.on(EventKind::Closed, on_closed);
    table.on(EventKind::TradeReceived, on_trade_receive);
    for kind in [
        EventKind::TradeAccepted,
        EventKind::TradeDeclined,
        EventKind::TradeCancelled,
        EventKind::TradeExpired,
        EventKind::TradeCountered,
    ] {
        table.on(kind, on_offer_resolved);
    }
    table.on(EventKind::Error, on_error);
}

/// Fetch the trade token and prefetch games once the session is active
///
/// The event pump has already learned the id and switched the state.
async fn on_ready(agent: Agent, _event: AgentEvent) -> Result<()> {
    if !agent.is_ready() || agent.is_closed() {
        debug!("Agent {} stopped before its ready work ran", agent.username());
        return Ok(());
    }
    info!("Agent {} is ready", agent);

    if !agent.has_trade_token() {
        let raw = agent.transport().trade_url(false).await?;
        let url = TradeUrl::parse(&raw)?;
        agent.set_trade_token(url.token);
    }

    for game in agent.prefetch_games() {
        agent.fetch_inventory(&game).await?;
    }
    Ok(())
}

async fn on_closed(agent: Agent, _event: AgentEvent) -> Result<()> {
    debug!("Session of agent {} reported closed", agent.username());
    Ok(())
}

/// Accept offers from whitelisted partners and refresh the touched games
async fn on_trade_receive(agent: Agent, event: AgentEvent) -> Result<()> {
    let AgentEvent::TradeReceived(trade) = event else {
        return Ok(());
    };
    if !agent.is_whitelisted(trade.partner) {
        return Ok(());
    }

    info!(
        "Agent {} accepting offer {} from whitelisted partner {}",
        agent.username(),
        trade.id,
        trade.partner
    );
    agent.accept_offer(trade.id).await?;

    for game in trade.games() {
        // keep the display name of games fetched before
        let game = agent
            .inventory()
            .game(game.id)
            .map(|snapshot| snapshot.game().clone())
            .filter(|known| known.context_id == game.context_id)
            .unwrap_or(game);
        refresh_game(&agent, &game).await?;
    }
    Ok(())
}

async fn refresh_game(agent: &Agent, game: &Game) -> Result<()> {
    let snapshot = agent.fetch_inventory(game).await?;
    debug!(
        "Agent {} refreshed {} after trade: {} items",
        agent.username(),
        game,
        snapshot.len()
    );
    Ok(())
}

/// Close our offers resolved by the service
async fn on_offer_resolved(agent: Agent, event: AgentEvent) -> Result<()> {
    let Some(trade) = event.trade() else {
        return Ok(());
    };
    if !trade.is_our_offer {
        return Ok(());
    }

    let Some(offer) = agent.offers().get(trade.id) else {
        error!(
            "Agent {} got {} for unknown offer {}",
            agent.username(),
            event.kind(),
            trade.id
        );
        return Ok(());
    };

    offer.update_from(trade);
    offer.disarm_timer();
    agent.offers().pop(trade.id)?;
    info!(
        "Offer {} of agent {} closed ({})",
        trade.id,
        agent.username(),
        offer.state()
    );

    agent.forward_to_pool(AgentEvent::OfferClosed(offer));
    Ok(())
}

async fn on_error(agent: Agent, event: AgentEvent) -> Result<()> {
    if let AgentEvent::Error { event, error } = event {
        error!(
            "Agent {} ignoring failure in {}: {}",
            agent.username(),
            event.handler_name(),
            error
        );
        agent.record_shared_error(Some(event), error);
    }
    Ok(())
}
