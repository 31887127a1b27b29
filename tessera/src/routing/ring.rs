use super::Token;

/// The token ring: a sorted view of (token, owner) pairs that can be
/// walked from any token, wrapping past the highest one.
///
/// The owner of a token is the first entry whose token is greater than
/// or equal to it; walking continues in increasing-token order, so the
/// walk enumerates candidate replicas in the ring's preference order.
#[derive(Debug, Clone)]
pub struct TokenRing<OwnerT> {
    entries: Vec<(Token, OwnerT)>,
}

impl<OwnerT> TokenRing<OwnerT> {
    pub(crate) const fn empty() -> TokenRing<OwnerT> {
        Self {
            entries: Vec::new(),
        }
    }

    pub(crate) fn new(assignments: impl Iterator<Item = (Token, OwnerT)>) -> TokenRing<OwnerT> {
        let mut entries: Vec<(Token, OwnerT)> = assignments.collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        TokenRing { entries }
    }

    /// All (token, owner) pairs, lowest token first.
    pub fn iter(&self) -> impl Iterator<Item = &(Token, OwnerT)> {
        self.entries.iter()
    }

    /// Walks every owner exactly once, beginning at the entry owning
    /// `token` and wrapping around the ring's end.
    pub fn walk_from(&self, token: &Token) -> impl Iterator<Item = &OwnerT> {
        let start = self.entries.partition_point(|(t, _)| t < token);
        let total = self.entries.len();

        (0..total).map(move |step| {
            let slot = (start + step) % total;
            &self.entries[slot].1
        })
    }

    /// The owner a token hashes onto, i.e. its primary replica.
    pub fn primary_owner(&self, token: &Token) -> Option<&OwnerT> {
        self.walk_from(token).next()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
