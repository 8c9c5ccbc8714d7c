//! Built-in pool handlers keeping the pool-wide caches in sync

use std::sync::Arc;
use tracing::{debug, error};

use super::PoolEventContext;
use crate::dispatch::{AgentEvent, EventKind, HandlerTable};
use crate::error::Result;

pub(super) fn install(table: &HandlerTable<PoolEventContext>) {
    table.on(EventKind::InventoryUpdated, on_inventory_update);
    table.on(EventKind::OfferSent, on_offer_send);
    table.on(EventKind::OfferClosed, on_offer_close);
    table.on(EventKind::Error, on_error);
}

async fn on_inventory_update(ctx: PoolEventContext, event: AgentEvent) -> Result<()> {
    let AgentEvent::InventoryUpdated(snapshot) = event else {
        return Ok(());
    };
    if !ctx.is_current() {
        debug!("Ignoring inventory update from unbound agent {}", ctx.agent);
        return Ok(());
    }

    // a newer fetch may already have replaced this snapshot
    let latest = ctx.agent.inventory().game(snapshot.game().id);
    if !latest.map(|l| Arc::ptr_eq(&l, &snapshot)).unwrap_or(false) {
        debug!(
            "Skipping stale inventory of {} for {}",
            ctx.agent,
            snapshot.game()
        );
        return Ok(());
    }

    let items = ctx.pool.items();
    items.replace(&snapshot);
    if !ctx.is_current() {
        items.purge_agent(snapshot.owner());
    }
    Ok(())
}

async fn on_offer_send(ctx: PoolEventContext, event: AgentEvent) -> Result<()> {
    let AgentEvent::OfferSent(offer) = event else {
        return Ok(());
    };
    if !ctx.is_current() || offer.is_resolved() {
        return Ok(());
    }

    let offers = ctx.pool.offers();
    offers.add(&offer)?;
    if !ctx.is_current() {
        offers.purge_owner(offer.owner_id());
    } else if offer.is_resolved() {
        // closed while being added; its close event may already have run
        if let Some(id) = offer.id() {
            offers.pop(id)?;
        }
    }
    Ok(())
}

async fn on_offer_close(ctx: PoolEventContext, event: AgentEvent) -> Result<()> {
    let AgentEvent::OfferClosed(offer) = event else {
        return Ok(());
    };
    let Some(id) = offer.id() else {
        return Ok(());
    };

    let offers = ctx.pool.offers();
    if offers.pop(id)?.is_some() {
        debug!("Pool forgot closed offer {} of {}", id, ctx.agent);
    }
    let dropped = offers.prune();
    if dropped > 0 {
        debug!("Pool pruned {} dropped offers", dropped);
    }
    Ok(())
}

async fn on_error(ctx: PoolEventContext, event: AgentEvent) -> Result<()> {
    if let AgentEvent::Error { event, error } = event {
        error!(
            "Pool ignoring failure in {} for agent {}: {}",
            event.handler_name(),
            ctx.agent,
            error
        );
        ctx.pool.record_error(Some(event), error);
    }
    Ok(())
}
