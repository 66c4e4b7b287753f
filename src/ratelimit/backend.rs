//! Decision backend trait used by the policy server.

use super::action::Action;

/// Anything that can turn a sender and recipient count into a decision.
///
/// The policy server is generic over this trait so connection handling can
/// be exercised without a full rate limiter behind it.
pub trait PolicyBackend: Send + Sync {
    /// Decide whether `sender` may send to `recipients` more recipients.
    fn decide(&self, sender: &str, recipients: u64) -> Action;
}
