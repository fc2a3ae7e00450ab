/// Insertion-ordered set that forgets its oldest members once it holds more
/// than `capacity` of them.
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

#[derive(Debug)]
pub(crate) struct RecentSet<K> {
    /// Member -> generation it was inserted at
    members: HashMap<K, u64>,
    order: VecDeque<(K, u64)>,
    capacity: usize,
    generation: u64,
}

impl<K: Eq + Hash + Clone> RecentSet<K> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            members: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            generation: 0,
        }
    }

    pub(crate) fn contains(&self, key: &K) -> bool {
        self.members.contains_key(key)
    }

    /// Insert `key`. Returns false when it was already a member, and the
    /// number of members forgotten to stay within capacity.
    pub(crate) fn insert(&mut self, key: K) -> (bool, usize) {
        if self.members.contains_key(&key) {
            return (false, 0);
        }
        self.generation += 1;
        self.members.insert(key.clone(), self.generation);
        self.order.push_back((key, self.generation));

        let mut forgotten = 0;
        while self.members.len() > self.capacity {
            let Some((oldest, generation)) = self.order.pop_front() else {
                break;
            };
            // Stale entries left behind by remove() are skipped
            if self.members.get(&oldest) == Some(&generation) {
                self.members.remove(&oldest);
                forgotten += 1;
            }
        }

        if self.order.len() > self.capacity.saturating_mul(2) {
            let members = &self.members;
            self.order
                .retain(|(key, generation)| members.get(key) == Some(generation));
        }
        (true, forgotten)
    }

    pub(crate) fn remove(&mut self, key: &K) -> bool {
        self.members.remove(key).is_some()
    }

    pub(crate) fn retain(&mut self, mut keep: impl FnMut(&K) -> bool) {
        self.members.retain(|key, _| keep(key));
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }
}
