use std::collections::HashMap;
use std::sync::Mutex;

use shared::domain::{Contact, ContactKind, Gender};
use tracing::{debug, warn};

/// Thread-safe mirror of the remote contact graph, keyed by identity.
///
/// Every operation is a short in-memory critical section; the lock is never
/// held across I/O or an await point.
#[derive(Default)]
pub struct ContactCache {
    contacts: Mutex<HashMap<String, Contact>>,
}

impl ContactCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record with the contact's identity. Last write
    /// wins; fields are never merged. A record with an empty identity is
    /// logged and dropped.
    pub fn upsert(&self, contact: Contact) {
        if contact.user_name.is_empty() {
            warn!(nick_name = %contact.nick_name, "dropping contact without identity");
            return;
        }
        let mut contacts = self.contacts.lock().expect("contact cache poisoned");
        if let Some(old) = contacts.get(&contact.user_name) {
            debug!(
                user_name = %contact.user_name,
                old_nick = %old.nick_name,
                new_nick = %contact.nick_name,
                "replacing cached contact"
            );
        }
        contacts.insert(contact.user_name.clone(), contact);
    }

    pub fn remove(&self, user_name: &str) {
        let mut contacts = self.contacts.lock().expect("contact cache poisoned");
        contacts.remove(user_name);
    }

    pub fn lookup(&self, user_name: &str) -> Option<Contact> {
        let contacts = self.contacts.lock().expect("contact cache poisoned");
        contacts.get(user_name).cloned()
    }

    pub fn contains(&self, user_name: &str) -> bool {
        let contacts = self.contacts.lock().expect("contact cache poisoned");
        contacts.contains_key(user_name)
    }

    /// `true` when the identity is cached as a direct friend (including one
    /// that is also a group member).
    pub fn is_friend(&self, user_name: &str) -> bool {
        let contacts = self.contacts.lock().expect("contact cache poisoned");
        matches!(
            contacts.get(user_name).map(|c| c.kind),
            Some(ContactKind::Friend) | Some(ContactKind::FriendAndMember)
        )
    }

    /// Exact-nickname search with optional filters; `None` filter values
    /// match anything. An empty result set is `None`, not an error.
    pub fn search(
        &self,
        nick_name: &str,
        city: Option<&str>,
        gender: Option<Gender>,
        kind: Option<ContactKind>,
    ) -> Option<Vec<Contact>> {
        let contacts = self.contacts.lock().expect("contact cache poisoned");
        let found: Vec<Contact> = contacts
            .values()
            .filter(|c| c.nick_name == nick_name)
            .filter(|c| city.map_or(true, |city| city.is_empty() || c.city == city))
            .filter(|c| gender.map_or(true, |g| c.gender == g))
            .filter(|c| kind.map_or(true, |k| c.kind == k))
            .cloned()
            .collect();
        if found.is_empty() {
            None
        } else {
            Some(found)
        }
    }

    /// Full-sync commit: clears and repopulates under one lock acquisition,
    /// so a concurrent reader observes either the old or the new state.
    pub fn replace_all(&self, batch: Vec<Contact>) {
        let mut contacts = self.contacts.lock().expect("contact cache poisoned");
        contacts.clear();
        for contact in batch {
            if contact.user_name.is_empty() {
                warn!(nick_name = %contact.nick_name, "dropping contact without identity");
                continue;
            }
            contacts.insert(contact.user_name.clone(), contact);
        }
        debug!(count = contacts.len(), "contact cache rebuilt");
    }

    /// Ordered member roster of a cached group; `None` when the group is
    /// unknown.
    pub fn members_of(&self, group_user_name: &str) -> Option<Vec<Contact>> {
        let contacts = self.contacts.lock().expect("contact cache poisoned");
        contacts
            .get(group_user_name)
            .map(|group| group.members.clone())
    }

    pub fn all(&self) -> Vec<Contact> {
        let contacts = self.contacts.lock().expect("contact cache poisoned");
        contacts.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.contacts.lock().expect("contact cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(user_name: &str, nick: &str, kind: ContactKind) -> Contact {
        Contact {
            user_name: user_name.into(),
            nick_name: nick.into(),
            remark_name: String::new(),
            display_name: String::new(),
            alias: String::new(),
            avatar_url: String::new(),
            gender: Gender::Unknown,
            signature: String::new(),
            province: String::new(),
            city: String::new(),
            verify_flag: 0,
            contact_flag: 0,
            kind,
            members: Vec::new(),
        }
    }

    #[test]
    fn upsert_then_lookup_returns_latest_record() {
        let cache = ContactCache::new();
        cache.upsert(contact("friend1", "Alice", ContactKind::Friend));
        cache.upsert(contact("friend1", "Alice Renamed", ContactKind::Friend));

        assert_eq!(cache.len(), 1);
        let got = cache.lookup("friend1").expect("cached");
        assert_eq!(got.nick_name, "Alice Renamed");
    }

    #[test]
    fn empty_identity_is_dropped_silently() {
        let cache = ContactCache::new();
        cache.upsert(contact("", "ghost", ContactKind::Friend));
        assert!(cache.is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let cache = ContactCache::new();
        cache.upsert(contact("friend1", "Alice", ContactKind::Friend));
        cache.remove("friend1");
        cache.remove("friend1");
        assert!(cache.lookup("friend1").is_none());
    }

    #[test]
    fn search_applies_optional_filters() {
        let cache = ContactCache::new();
        let mut alice = contact("friend1", "Alice", ContactKind::Friend);
        alice.city = "Chaoyang".into();
        alice.gender = Gender::Female;
        cache.upsert(alice);
        let mut bob = contact("friend2", "Alice", ContactKind::Friend);
        bob.city = "Haidian".into();
        bob.gender = Gender::Male;
        cache.upsert(bob);

        let any = cache.search("Alice", None, None, None).expect("found");
        assert_eq!(any.len(), 2);

        let by_city = cache
            .search("Alice", Some("Chaoyang"), None, None)
            .expect("found");
        assert_eq!(by_city.len(), 1);
        assert_eq!(by_city[0].user_name, "friend1");

        let by_gender = cache
            .search("Alice", None, Some(Gender::Male), None)
            .expect("found");
        assert_eq!(by_gender[0].user_name, "friend2");

        assert!(cache
            .search("Alice", None, None, Some(ContactKind::Group))
            .is_none());
        assert!(cache.search("Nobody", None, None, None).is_none());
    }

    #[test]
    fn members_of_returns_roster_in_order() {
        let cache = ContactCache::new();
        let mut group = contact("@@room1", "room", ContactKind::Group);
        group.members = vec![
            contact("member1", "m1", ContactKind::Member),
            contact("member2", "m2", ContactKind::Member),
        ];
        cache.upsert(group);

        let members = cache.members_of("@@room1").expect("cached group");
        let names: Vec<&str> = members.iter().map(|m| m.user_name.as_str()).collect();
        assert_eq!(names, ["member1", "member2"]);
        assert!(cache.members_of("@@missing").is_none());
    }

    #[test]
    fn replace_all_swaps_the_whole_view() {
        let cache = ContactCache::new();
        cache.upsert(contact("old1", "Old", ContactKind::Friend));

        cache.replace_all(vec![
            contact("new1", "New", ContactKind::Friend),
            contact("new2", "New", ContactKind::Friend),
        ]);

        assert!(cache.lookup("old1").is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn replace_all_is_atomic_under_a_concurrent_reader() {
        use std::sync::Arc;
        use std::thread;

        let cache = Arc::new(ContactCache::new());
        let first: Vec<Contact> = (0..100)
            .map(|i| contact(&format!("a{i}"), "A", ContactKind::Friend))
            .collect();
        let second: Vec<Contact> = (0..100)
            .map(|i| contact(&format!("b{i}"), "B", ContactKind::Friend))
            .collect();
        cache.replace_all(first.clone());

        let reader = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for _ in 0..500 {
                    let snapshot = cache.all();
                    assert_eq!(snapshot.len(), 100);
                    let all_a = snapshot.iter().all(|c| c.user_name.starts_with('a'));
                    let all_b = snapshot.iter().all(|c| c.user_name.starts_with('b'));
                    assert!(all_a || all_b, "observed a partially-applied batch");
                }
            })
        };

        for _ in 0..50 {
            cache.replace_all(second.clone());
            cache.replace_all(first.clone());
        }

        reader.join().expect("reader");
    }
}
