//! Simulated customer accounts.

use cryptoledger_ledger::User;

/// Factory for simulated users.
pub struct AccountFactory;

impl AccountFactory {
    /// Create `count` users plus one administrator.
    pub fn create_users(count: usize) -> Vec<User> {
        let names = [
            "Alice", "Bob", "Carol", "Dave", "Erin", "Frank", "Grace", "Heidi", "Ivan", "Judy",
        ];

        let mut users: Vec<User> = (0..count)
            .map(|i| {
                let id = format!("user-{}", i + 1);
                match names.get(i) {
                    Some(name) => User::new(id, *name),
                    None => User::new(id, format!("Customer {}", i + 1)),
                }
            })
            .collect();
        users.push(User::admin("admin", "Desk Admin"));
        users
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_users() {
        let users = AccountFactory::create_users(12);
        assert_eq!(users.len(), 13);
        assert_eq!(users[0].name, "Alice");
        assert_eq!(users[11].id.as_str(), "user-12");
        assert!(users[12].is_admin());
        assert_eq!(users.iter().filter(|u| u.is_admin()).count(), 1);
    }
}
