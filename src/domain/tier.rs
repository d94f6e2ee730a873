use serde::{Deserialize, Serialize};

/// A member's priority class. The order, from highest priority (0) to
/// lowest (2), is: `Admin < Vip < Regular`. Ordering is derived so that
/// `tier_a < tier_b` means `tier_a` outranks `tier_b`, matching the
/// allocator's "sort by tier ascending" rule (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserTier {
    Admin,
    Vip,
    Regular,
}

impl UserTier {
    /// `true` for any tier that participates in late-arrival bumping
    /// (§4.6 "Late VIP handling"); `regular` never bumps an already
    /// confirmed request.
    pub fn is_privileged(&self) -> bool {
        matches!(self, UserTier::Admin | UserTier::Vip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_outranks_vip_outranks_regular() {
        assert!(UserTier::Admin < UserTier::Vip);
        assert!(UserTier::Vip < UserTier::Regular);
    }

    #[test]
    fn only_admin_and_vip_are_privileged() {
        assert!(UserTier::Admin.is_privileged());
        assert!(UserTier::Vip.is_privileged());
        assert!(!UserTier::Regular.is_privileged());
    }
}
