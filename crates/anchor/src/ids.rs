//! Opaque identifiers with stable prefixes.
//!
//! All ids are opaque strings; the prefix tells the boundary layer what the
//! id names so either an id or a human-readable name can be accepted and
//! resolved.

use uuid::Uuid;

pub const DATABASE_PREFIX: &str = "db_";
pub const INTEGRATION_PREFIX: &str = "integration_";
pub const JOB_PREFIX: &str = "job_";

/// Mint a fresh prefixed identifier.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}{}", Uuid::new_v4().simple())
}

/// True when the string carries one of the known prefixes, i.e. it is an id
/// rather than a human-readable name to be resolved through a scoped lookup.
pub fn is_id(candidate: &str) -> bool {
    [DATABASE_PREFIX, INTEGRATION_PREFIX, JOB_PREFIX]
        .iter()
        .any(|prefix| candidate.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_carry_prefix_and_are_unique() {
        let a = new_id(JOB_PREFIX);
        let b = new_id(JOB_PREFIX);
        assert!(a.starts_with("job_"));
        assert_ne!(a, b);
    }

    #[test]
    fn names_are_not_ids() {
        assert!(is_id("db_0af3"));
        assert!(!is_id("orders-production"));
    }
}
