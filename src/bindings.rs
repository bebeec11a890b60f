use tracing::trace;

/// Key bindings owned by one component.
///
/// A component registers a handler per trigger when it renders and drops them with
/// `dispose` before rendering again, so a trigger never has two handlers.
#[derive(Debug)]
pub struct Bindings<K, A> {
    entries: Vec<(K, A)>,
}

impl<K: PartialEq + std::fmt::Debug, A: Clone> Bindings<K, A> {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Bind `action` to `trigger`, replacing a previous binding of the same trigger.
    pub fn bind(&mut self, trigger: K, action: A) {
        self.entries.retain(|(k, _)| k != &trigger);
        self.entries.push((trigger, action));
    }

    pub fn dispatch(&self, trigger: &K) -> Option<A> {
        self.entries
            .iter()
            .find(|(k, _)| k == trigger)
            .map(|(_, a)| a.clone())
    }

    pub fn dispose(&mut self) {
        trace!("Disposing all {} bindings", self.entries.len());
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<K: PartialEq + std::fmt::Debug, A: Clone> Default for Bindings<K, A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebinding_replaces_instead_of_duplicating() {
        let mut b: Bindings<(usize, char), usize> = Bindings::new();
        b.bind((0, 'u'), 10);
        b.bind((0, 'u'), 11);
        assert_eq!(b.len(), 1);
        assert_eq!(b.dispatch(&(0, 'u')), Some(11));
    }

    #[test]
    fn dispose_drops_everything() {
        let mut b: Bindings<usize, &str> = Bindings::new();
        b.bind(1, "one");
        b.bind(2, "two");
        b.dispose();
        assert_eq!(b.len(), 0);
        assert_eq!(b.dispatch(&1), None);
        b.bind(3, "three");
        assert_eq!(b.dispatch(&3), Some("three"));
    }
}
