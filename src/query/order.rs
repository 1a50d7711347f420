//! ORDER BY capture.
//!
//! A recording facade: it implements just enough of a query surface to
//! accept chained `order_by`/`then_by` calls and remembers the
//! `(property, direction)` pairs. It exists only for the duration of a
//! translation and is never persisted.

/// Records an ORDER BY chain.
#[derive(Debug, Clone, Default)]
pub struct OrderRecorder {
    pairs: Vec<(String, bool)>,
}

impl OrderRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Primary ascending sort.
    #[must_use]
    pub fn order_by(mut self, property: &str) -> Self {
        self.pairs.push((property.to_string(), true));
        self
    }

    /// Primary descending sort.
    #[must_use]
    pub fn order_by_descending(mut self, property: &str) -> Self {
        self.pairs.push((property.to_string(), false));
        self
    }

    /// Secondary ascending sort.
    #[must_use]
    pub fn then_by(self, property: &str) -> Self {
        self.order_by(property)
    }

    /// Secondary descending sort.
    #[must_use]
    pub fn then_by_descending(self, property: &str) -> Self {
        self.order_by_descending(property)
    }

    /// The recorded `(property, ascending)` pairs, in call order.
    #[must_use]
    pub fn pairs(&self) -> &[(String, bool)] {
        &self.pairs
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}
