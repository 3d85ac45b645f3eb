// =============================================================================
// Client order id minting
// =============================================================================

use uuid::Uuid;

/// Deterministic-format idempotency key attached to every order submission:
/// `<bot-id>-<10 hex chars>[-<purpose>]`.
pub fn generate_client_order_id(bot_id: &str, purpose: Option<&str>) -> String {
    let entropy = Uuid::new_v4().simple().to_string();
    let base = format!("{bot_id}-{}", &entropy[..10]);
    match purpose {
        Some(p) if !p.is_empty() => format!("{base}-{p}"),
        _ => base,
    }
}
