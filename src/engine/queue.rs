use std::collections::HashMap;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Key already present: {0}")]
    DuplicateKey(String),
    #[error("Key not found: {0}")]
    MissingKey(String),
    #[error("Queue is empty")]
    Empty,
}

#[derive(Clone, Debug)]
struct Node<P, V> {
    key: String,
    priority: P,
    value: V,
}

/// A binary max-heap with unique string keys.
///
/// The key index allows changing the priority of, or removing, any entry in `O(log n)`.
#[derive(Clone, Debug)]
pub struct PriorityQueue<P, V> {
    items: Vec<Node<P, V>>,
    /// slot in `items` of every key
    index: HashMap<String, usize>,
}

impl<P, V> Default for PriorityQueue<P, V> {
    fn default() -> Self {
        Self {
            items: Default::default(),
            index: Default::default(),
        }
    }
}

impl<P: Ord, V> PriorityQueue<P, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn priority(&self, key: &str) -> Option<&P> {
        self.index.get(key).map(|i| &self.items[*i].priority)
    }

    /// Peek at the value with the highest priority.
    pub fn peek(&self) -> Option<&V> {
        self.items.first().map(|n| &n.value)
    }

    /// Iterate over all entries, in heap order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &P, &V)> {
        self.items
            .iter()
            .map(|n| (n.key.as_str(), &n.priority, &n.value))
    }

    pub fn add(&mut self, key: impl Into<String>, priority: P, value: V) -> Result<(), QueueError> {
        let key = key.into();
        if self.index.contains_key(&key) {
            return Err(QueueError::DuplicateKey(key));
        }

        let slot = self.items.len();
        self.index.insert(key.clone(), slot);
        self.items.push(Node {
            key,
            priority,
            value,
        });
        self.sift_up(slot);

        Ok(())
    }

    /// Remove the value with the highest priority.
    pub fn pop(&mut self) -> Result<V, QueueError> {
        if self.items.is_empty() {
            return Err(QueueError::Empty);
        }
        Ok(self.remove_at(0).value)
    }

    /// Change the priority of an entry. The new priority may be higher or lower.
    pub fn set(&mut self, key: &str, priority: P) -> Result<(), QueueError> {
        let slot = *self
            .index
            .get(key)
            .ok_or_else(|| QueueError::MissingKey(key.to_string()))?;

        self.items[slot].priority = priority;
        let slot = self.sift_up(slot);
        self.sift_down(slot);

        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Result<V, QueueError> {
        let slot = *self
            .index
            .get(key)
            .ok_or_else(|| QueueError::MissingKey(key.to_string()))?;
        Ok(self.remove_at(slot).value)
    }

    fn remove_at(&mut self, slot: usize) -> Node<P, V> {
        // the last node takes the vacated slot
        let node = self.items.swap_remove(slot);
        self.index.remove(&node.key);

        if let Some(moved) = self.items.get(slot) {
            if let Some(entry) = self.index.get_mut(&moved.key) {
                *entry = slot;
            }
            let slot = self.sift_up(slot);
            self.sift_down(slot);
        }

        node
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.items.swap(a, b);
        for slot in [a, b] {
            if let Some(entry) = self.index.get_mut(&self.items[slot].key) {
                *entry = slot;
            }
        }
    }

    /// Returns the final slot of the node.
    fn sift_up(&mut self, mut slot: usize) -> usize {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if self.items[slot].priority <= self.items[parent].priority {
                break;
            }
            self.swap(slot, parent);
            slot = parent;
        }
        slot
    }

    fn sift_down(&mut self, mut slot: usize) {
        loop {
            let left = slot * 2 + 1;
            let right = left + 1;
            let mut largest = slot;

            if left < self.items.len() && self.items[left].priority > self.items[largest].priority
            {
                largest = left;
            }
            if right < self.items.len() && self.items[right].priority > self.items[largest].priority
            {
                largest = right;
            }
            if largest == slot {
                break;
            }

            self.swap(slot, largest);
            slot = largest;
        }
    }

    /// Report every violation of the heap property or of the key index.
    #[cfg(test)]
    pub fn check_validity(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for (slot, node) in self.items.iter().enumerate() {
            for child in [slot * 2 + 1, slot * 2 + 2] {
                if let Some(child_node) = self.items.get(child) {
                    if child_node.priority > node.priority {
                        errors.push(format!("child {child} outranks parent {slot}"));
                    }
                }
            }
        }

        for (key, slot) in &self.index {
            match self.items.get(*slot) {
                Some(node) if &node.key == key => {}
                _ => errors.push(format!("index of {key} points to wrong slot {slot}")),
            }
        }

        if self.index.len() != self.items.len() {
            errors.push(format!(
                "index has {} entries, heap has {}",
                self.index.len(),
                self.items.len()
            ));
        }

        errors
    }
}
