use sha2::{Digest, Sha256};

/// Derive a deterministic idempotency key.
///
/// Format: SHA256(scope|k1=v1|k2=v2|...) as lowercase hex. Field order is
/// significant, so callers must pass fields in a fixed order.
pub fn generate_key(scope: &str, fields: &[(&str, String)]) -> String {
    let mut payload = String::from(scope);
    for (name, value) in fields {
        payload.push('|');
        payload.push_str(name);
        payload.push('=');
        payload.push_str(value);
    }

    hex::encode(Sha256::digest(payload.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_inputs_produce_same_key() {
        let a = generate_key("credit_grant", &[("grant_id", "g1".to_string())]);
        let b = generate_key("credit_grant", &[("grant_id", "g1".to_string())]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn scope_and_fields_change_key() {
        let base = generate_key("credit_grant", &[("grant_id", "g1".to_string())]);
        let other_scope = generate_key("wallet", &[("grant_id", "g1".to_string())]);
        let other_value = generate_key("credit_grant", &[("grant_id", "g2".to_string())]);
        assert_ne!(base, other_scope);
        assert_ne!(base, other_value);
    }

    #[test]
    fn values_containing_separators_collide() {
        let a = generate_key("s", &[("a", "1|b=2".to_string())]);
        let b = generate_key(
            "s",
            &[("a", "1".to_string()), ("b", "2".to_string())],
        );
        assert_eq!(a, b);
    }
}
