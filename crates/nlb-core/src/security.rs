use crate::domain::UserId;

/// Capability check for operator-only commands (broadcast start/cancel,
/// credit adjustments, protection-list management).
pub fn is_administrator(user_id: Option<UserId>, admin_ids: &[i64]) -> bool {
    let Some(user_id) = user_id else {
        return false;
    };
    if admin_ids.is_empty() {
        return false;
    }
    admin_ids.contains(&user_id.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_listed_ids_pass() {
        let admins = vec![7, 42];
        assert!(is_administrator(Some(UserId(42)), &admins));
        assert!(!is_administrator(Some(UserId(1)), &admins));
        assert!(!is_administrator(None, &admins));
        assert!(!is_administrator(Some(UserId(42)), &[]));
    }
}
