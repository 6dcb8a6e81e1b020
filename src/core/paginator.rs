//! Page-indexed view over an ordered query

use crate::core::cursor::Cursor;
use crate::core::error::{DatabaseError, Result};
use crate::core::mapper::Record;
use crate::core::query_builder::Selector;

/// Pages of an ordered [`Selector`], numbered from 1
#[derive(Debug, Clone)]
pub struct Paginator {
    base: Selector,
    page_size: u64,
    page: u64,
}

impl Paginator {
    pub(crate) fn new(base: Selector, page_size: u64) -> Result<Self> {
        if !base.is_ordered() {
            return Err(DatabaseError::invalid_query(
                "pagination requires an ORDER BY; call order_by before paginate",
            ));
        }
        if page_size == 0 {
            return Err(DatabaseError::invalid_query("page size must be positive"));
        }
        Ok(Self {
            base,
            page_size,
            page: 1,
        })
    }

    /// Paginator positioned on page `n`; pages below 1 mean page 1
    #[must_use]
    pub fn page(&self, n: u64) -> Paginator {
        Paginator {
            page: n.max(1),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn next_page(&self) -> Paginator {
        self.page(self.page.saturating_add(1))
    }

    #[must_use]
    pub fn prev_page(&self) -> Paginator {
        self.page(self.page.saturating_sub(1))
    }

    pub fn current_page(&self) -> u64 {
        self.page
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Query for the current page: `LIMIT size OFFSET (page - 1) * size`
    pub fn selector(&self) -> Selector {
        self.base
            .limit(self.page_size)
            .offset((self.page - 1).saturating_mul(self.page_size))
    }

    /// Records on the current page; empty past the last page
    pub async fn all<T: Record>(&self) -> Result<Vec<T>> {
        self.selector().all().await
    }

    pub async fn cursor(&self) -> Result<Cursor> {
        self.selector().cursor().await
    }

    /// Rows matched by the unpaginated query
    pub async fn total_entries(&self) -> Result<u64> {
        self.base.count().await
    }

    /// Number of pages; 0 when there are no entries
    pub async fn total_pages(&self) -> Result<u64> {
        let total = self.total_entries().await?;
        Ok(total.div_ceil(self.page_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn books() -> Paginator {
        Selector::new()
            .from("books")
            .order_by("id")
            .paginate(10)
            .unwrap()
    }

    #[test]
    fn test_page_offsets() {
        let p = books();
        assert_eq!(
            p.selector().to_string(),
            "SELECT * FROM books ORDER BY id LIMIT 10 OFFSET 0"
        );
        assert_eq!(
            p.page(3).selector().to_string(),
            "SELECT * FROM books ORDER BY id LIMIT 10 OFFSET 20"
        );
    }

    #[test]
    fn test_page_navigation() {
        let p = books();
        assert_eq!(p.page(0).current_page(), 1);
        assert_eq!(p.prev_page().current_page(), 1);
        let third = p.next_page().next_page();
        assert_eq!(third.current_page(), 3);
        assert_eq!(p.current_page(), 1);
        assert_eq!(third.page_size(), 10);
    }

    #[test]
    fn test_zero_page_size_rejected() {
        let q = Selector::new().from("books").order_by("id");
        assert!(q.paginate(0).is_err());
    }
}
