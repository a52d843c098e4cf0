/// Query Queue Module
///
/// An insertion-ordered sequence of queries with a single cursor and
/// forward-only, single-step traversal: a minimal iterator for feeding a
/// batch of pre-built queries through sequential execution without exposing
/// the backing sequence. There is no peek and no reset; each element is
/// handed out once.
use super::query::Query;

#[derive(Debug, Default)]
pub struct QueryQueue<'conn> {
    queries: Vec<Query<'conn>>,
    cursor: usize,
}

impl<'conn> QueryQueue<'conn> {
    pub fn new() -> Self {
        QueryQueue {
            queries: Vec::new(),
            cursor: 0,
        }
    }

    /// Appends a query to the end of the sequence.
    pub fn push(&mut self, query: Query<'conn>) {
        self.queries.push(query);
    }

    /// Advances the cursor and returns the query it now points at. Returns
    /// `None` without moving the cursor once the end has been reached.
    pub fn pop(&mut self) -> Option<&mut Query<'conn>> {
        if self.cursor >= self.queries.len() {
            return None;
        }
        let query = &mut self.queries[self.cursor];
        self.cursor += 1;
        Some(query)
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

impl<'conn> From<Vec<Query<'conn>>> for QueryQueue<'conn> {
    fn from(queries: Vec<Query<'conn>>) -> Self {
        QueryQueue { queries, cursor: 0 }
    }
}
