//! Forwarding `parent.<prop>(...)` from a frame's script to the script
//! context of the embedding document.

use super::dispatch::CallContext;
use super::error::{BridgeError, BridgeResult};
use super::protocol::Reply;

/// Build the expression evaluated in the parent: the property name applied
/// to the already-encoded arguments.
pub fn synthesize_call(prop: &str, args: &[String]) -> String {
    format!("{prop}({})", args.join(","))
}

/// Evaluate `prop(args...)` in the backend of the calling document's parent
/// and relay the completion value.
///
/// A document without a parent, or whose parent has no running backend,
/// gets an empty reply (`undefined` on the script side).
pub async fn delegate_to_parent(ctx: &CallContext, prop: &str, args: &[String]) -> BridgeResult<Reply> {
    let own = ctx.document.handle();
    let Some(parent) = ctx.document.parent_document() else {
        tracing::debug!(target: "bridge", document = %own, %prop, "parent call from top-level document");
        return Ok(Reply::ack());
    };

    if parent == own || ctx.chain.contains(&parent) {
        return Err(BridgeError::DelegationCycle(parent));
    }
    let limit = ctx.manager.config().max_delegation_depth;
    if ctx.chain.len() >= limit {
        return Err(BridgeError::DelegationDepthExceeded(limit));
    }

    let Some(instance) = ctx.manager.instance(parent) else {
        tracing::debug!(target: "bridge", document = %own, %parent, %prop, "parent has no backend");
        return Ok(Reply::ack());
    };

    let script = synthesize_call(prop, args);
    let mut chain = ctx.chain.clone();
    chain.push(own);
    tracing::debug!(target: "bridge", from = %own, to = %parent, depth = chain.len(), %script, "delegating to parent");

    let value = ctx
        .manager
        .evaluate_with_chain(instance.document(), Some(instance.kind()), &script, chain)
        .await?;
    Ok(Reply {
        value,
        ..Reply::ack()
    })
}
