//! In-memory demo user store backing the `/api/users` endpoints.
//!
//! The user list and the `next_id` counter live under the SAME mutex: id
//! allocation and insertion are one atomic step, so concurrent creates can
//! neither duplicate nor skip ids.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub name: String,
    pub email: String,
}

struct UserData {
    users: Vec<User>,
    next_id: u64,
}

/// Thread-safe user collection, seeded with sample data.
pub struct UserStore {
    data: Mutex<UserData>,
}

impl UserStore {
    #[must_use]
    pub fn new() -> Self {
        let users = vec![
            User {
                id: 1,
                name: "John Doe".to_string(),
                email: "john.doe@example.com".to_string(),
            },
            User {
                id: 2,
                name: "Jane Smith".to_string(),
                email: "jane.smith@example.com".to_string(),
            },
            User {
                id: 3,
                name: "Alice Johnson".to_string(),
                email: "alice.johnson@example.com".to_string(),
            },
        ];
        Self {
            data: Mutex::new(UserData { users, next_id: 4 }),
        }
    }

    #[must_use]
    pub fn list(&self) -> Vec<User> {
        self.data.lock().users.clone()
    }

    #[must_use]
    pub fn find(&self, id: u64) -> Option<User> {
        self.data.lock().users.iter().find(|u| u.id == id).cloned()
    }

    /// Allocate an id and insert in one step.
    pub fn create(&self, name: &str, email: &str) -> User {
        let mut data = self.data.lock();
        let user = User {
            id: data.next_id,
            name: name.to_string(),
            email: email.to_string(),
        };
        data.next_id += 1;
        data.users.push(user.clone());
        user
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.data.lock().users.len()
    }
}

impl Default for UserStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn seeds_three_sample_users() {
        let store = UserStore::new();
        let users = store.list();
        assert_eq!(users.len(), 3);
        assert_eq!(users[0].name, "John Doe");
        assert_eq!(users[2].email, "alice.johnson@example.com");
    }

    #[test]
    fn find_by_id() {
        let store = UserStore::new();
        assert_eq!(store.find(2).map(|u| u.name), Some("Jane Smith".into()));
        assert!(store.find(99).is_none());
    }

    #[test]
    fn create_continues_id_sequence() {
        let store = UserStore::new();
        let user = store.create("Bob", "bob@example.com");
        assert_eq!(user.id, 4);
        assert_eq!(store.create("Carol", "carol@example.com").id, 5);
        assert_eq!(store.count(), 5);
    }

    #[test]
    fn concurrent_creates_never_duplicate_ids() {
        let store = Arc::new(UserStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    (0..25)
                        .map(|j| store.create(&format!("u{i}-{j}"), "u@example.com").id)
                        .collect::<Vec<u64>>()
                })
            })
            .collect();

        let mut ids = HashSet::new();
        for handle in handles {
            for id in handle.join().expect("creator thread") {
                assert!(ids.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(ids.len(), 200);
        assert_eq!(store.count(), 203);
    }

    #[test]
    fn user_serializes_to_json() {
        let user = User {
            id: 7,
            name: "Test".into(),
            email: "t@example.com".into(),
        };
        let doc = serde_json::to_value(&user).expect("serialize");
        assert_eq!(doc["id"], 7);
        assert_eq!(doc["email"], "t@example.com");
    }
}
