use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use chrono::Datelike;
use rayon::prelude::*;

use crate::records::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YearSelection {
    All,
    Year(i32),
}

/// Transient filter selection of the records view.
///
/// `month == None` is the empty month selection: nothing passes the filter.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterState {
    pub year: YearSelection,
    pub month: Option<u32>,
    pub status: Option<String>,
    pub columns: BTreeMap<usize, String>,
}

impl FilterState {
    pub fn new(year: i32, month: u32) -> Self {
        Self {
            year: YearSelection::Year(year),
            month: Some(month),
            status: None,
            columns: BTreeMap::new(),
        }
    }

    /// Single-select toggle: selecting the active label clears it.
    pub fn toggle_status(&mut self, label: &str) {
        if self.status.as_deref() == Some(label) {
            self.status = None;
        } else {
            self.status = Some(label.to_string());
        }
    }

    /// Store the filter text of a column. Empty text removes the filter.
    pub fn set_column_filter(&mut self, column: usize, text: &str) {
        if text.is_empty() {
            self.columns.remove(&column);
        } else {
            self.columns.insert(column, text.to_string());
        }
    }

    pub fn column_filter(&self, column: usize) -> Option<&str> {
        self.columns.get(&column).map(String::as_str)
    }

    fn matches_date(&self, record: &Record) -> bool {
        let (Some(date), Some(month)) = (record.surgery_date, self.month) else {
            return false;
        };
        let year_ok = match self.year {
            YearSelection::All => true,
            YearSelection::Year(y) => date.year() == y,
        };
        year_ok && date.month() == month
    }

    fn matches_columns(&self, record: &Record) -> bool {
        self.columns.iter().all(|(&column, text)| {
            record
                .column_text(column)
                .to_lowercase()
                .contains(&text.to_lowercase())
        })
    }

    fn matches(&self, record: &Record) -> bool {
        self.matches_date(record)
            && self
                .status
                .as_ref()
                .is_none_or(|status| &record.status == status)
            && self.matches_columns(record)
    }
}

/// Filter dimensions derived from the loaded records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Facets {
    pub years: BTreeSet<i32>,
    pub months: BTreeMap<i32, BTreeSet<u32>>,
}

impl Facets {
    /// Months selectable under the given year selection.
    pub fn months_for(&self, year: YearSelection) -> BTreeSet<u32> {
        match year {
            YearSelection::All => self.months.values().flatten().copied().collect(),
            YearSelection::Year(y) => self.months.get(&y).cloned().unwrap_or_default(),
        }
    }
}

/// Years and months present in valid surgery dates. `current_year` is always a year facet.
pub fn derive_facets(records: &[Record], current_year: i32) -> Facets {
    let mut facets = Facets::default();
    facets.years.insert(current_year);
    for date in records.iter().filter_map(|r| r.surgery_date) {
        facets.years.insert(date.year());
        facets
            .months
            .entry(date.year())
            .or_default()
            .insert(date.month());
    }
    facets
}

/// Distinct non-empty status labels in the year/month filtered subset.
pub fn status_facets(records: &[Record], state: &FilterState) -> Vec<String> {
    let labels: BTreeSet<&str> = records
        .iter()
        .filter(|r| state.matches_date(r) && !r.status.is_empty())
        .map(|r| r.status.as_str())
        .collect();
    labels.into_iter().map(str::to_string).collect()
}

/// Indices of the records passing every active predicate, in input order.
pub fn apply_filter(records: &[Record], state: &FilterState) -> Vec<usize> {
    if state.month.is_none() {
        return Vec::new();
    }
    records
        .par_iter()
        .enumerate()
        .filter(|(_, r)| state.matches(r))
        .map(|(idx, _)| idx)
        .collect()
}

/// Stable sort by surgery date, then case-insensitive patient name.
pub fn sort_rows(records: &[Record], rows: &mut [usize]) {
    rows.sort_by_cached_key(|&idx| {
        let r = &records[idx];
        (r.surgery_date, r.patient_name.to_lowercase())
    });
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pagination {
    pub page: usize,
    pub page_size: usize,
}

impl Pagination {
    pub fn new(page_size: usize) -> Self {
        Self {
            page: 1,
            page_size: page_size.max(1),
        }
    }

    /// Number of pages for `count` rows. Zero rows give zero pages.
    pub fn page_count(&self, count: usize) -> usize {
        count.div_ceil(self.page_size)
    }

    /// Pull the current page back into `[1, max(1, page_count)]`.
    pub fn clamp(&mut self, count: usize) {
        self.page = self.page.clamp(1, self.page_count(count).max(1));
    }

    pub fn has_next(&self, count: usize) -> bool {
        self.page < self.page_count(count)
    }

    pub fn has_prev(&self) -> bool {
        self.page > 1
    }

    pub fn next(&mut self, count: usize) {
        if self.has_next(count) {
            self.page += 1;
        }
    }

    pub fn prev(&mut self) {
        if self.has_prev() {
            self.page -= 1;
        }
    }

    /// Row range of the current page within `count` rows.
    pub fn range(&self, count: usize) -> Range<usize> {
        let begin = std::cmp::min((self.page - 1) * self.page_size, count);
        let end = std::cmp::min(self.page * self.page_size, count);
        begin..end
    }
}

/// Filter, sort and cut one page. Returns the full sorted row list and the page range.
pub fn sort_and_paginate(
    records: &[Record],
    state: &FilterState,
    pagination: &mut Pagination,
) -> (Vec<usize>, Range<usize>) {
    let mut rows = apply_filter(records, state);
    sort_rows(records, &mut rows);
    pagination.clamp(rows.len());
    let range = pagination.range(rows.len());
    (rows, range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::tests::record;
    use proptest::prelude::*;

    fn august() -> FilterState {
        FilterState {
            year: YearSelection::All,
            month: Some(8),
            status: None,
            columns: BTreeMap::new(),
        }
    }

    #[test]
    fn all_years_month_eight_returns_both_by_date() {
        let records = vec![
            record("Second", Some("2025-08-20"), "B"),
            record("First", Some("2025-08-15"), "A"),
        ];
        let mut rows = apply_filter(&records, &august());
        sort_rows(&records, &mut rows);
        assert_eq!(rows, vec![1, 0]);
    }

    #[test]
    fn empty_month_shows_nothing() {
        let records = vec![record("A", Some("2025-08-15"), "A")];
        let mut state = august();
        state.month = None;
        assert!(apply_filter(&records, &state).is_empty());
    }

    #[test]
    fn records_without_date_never_pass() {
        let records = vec![record("A", None, "A"), record("B", Some("2025-08-01"), "A")];
        assert_eq!(apply_filter(&records, &august()), vec![1]);
    }

    #[test]
    fn year_and_status_are_exact() {
        let records = vec![
            record("A", Some("2024-08-15"), "Done"),
            record("B", Some("2025-08-15"), "Done"),
            record("C", Some("2025-08-15"), "Pending"),
        ];
        let mut state = august();
        state.year = YearSelection::Year(2025);
        assert_eq!(apply_filter(&records, &state), vec![1, 2]);
        state.status = Some("Done".into());
        assert_eq!(apply_filter(&records, &state), vec![1]);
    }

    #[test]
    fn column_filter_is_case_insensitive_substring() {
        let records = vec![
            record("Juan Pérez", Some("2025-08-15"), "A"),
            record("María Gómez", Some("2025-08-16"), "A"),
        ];
        let mut state = august();
        state.set_column_filter(2, "pérez");
        assert_eq!(apply_filter(&records, &state), vec![0]);
        state.set_column_filter(2, "");
        assert_eq!(apply_filter(&records, &state), vec![0, 1]);
    }

    #[test]
    fn facets_keep_current_year_and_skip_missing_dates() {
        let records = vec![record("A", Some("2021-03-01"), ""), record("B", None, "")];
        let facets = derive_facets(&records, 2026);
        assert_eq!(facets.years.iter().copied().collect::<Vec<_>>(), vec![2021, 2026]);
        assert_eq!(facets.months_for(YearSelection::Year(2021)).len(), 1);
        assert!(facets.months_for(YearSelection::Year(2026)).is_empty());
    }

    #[test]
    fn status_facets_ignore_status_selection() {
        let records = vec![
            record("A", Some("2025-08-15"), "A"),
            record("B", Some("2025-08-20"), "B"),
            record("C", Some("2025-09-20"), "C"),
        ];
        let mut state = august();
        state.status = Some("A".into());
        assert_eq!(status_facets(&records, &state), vec!["A", "B"]);
    }

    #[test]
    fn empty_result_is_page_one_of_zero() {
        let mut p = Pagination::new(10);
        p.clamp(0);
        assert_eq!(p.page, 1);
        assert_eq!(p.page_count(0), 0);
        assert!(!p.has_next(0));
        assert!(!p.has_prev());
        assert_eq!(p.range(0), 0..0);
    }

    #[test]
    fn next_at_last_page_is_noop() {
        let mut p = Pagination::new(10);
        p.next(25);
        p.next(25);
        assert_eq!(p.page, 3);
        p.next(25);
        assert_eq!(p.page, 3);
        assert_eq!(p.range(25), 20..25);
    }

    fn arb_record() -> impl Strategy<Value = Record> {
        (
            "[a-cA-C]{1,3}",
            proptest::option::of((2020i32..2027, 1u32..13, 1u32..29)),
            "[AB]?",
        )
            .prop_map(|(name, date, status)| {
                let date = date.map(|(y, m, d)| format!("{y:04}-{m:02}-{d:02}"));
                record(&name, date.as_deref(), &status)
            })
    }

    proptest! {
        #[test]
        fn facets_always_contain_current_year(
            records in proptest::collection::vec(arb_record(), 0..20),
            year in 1990i32..2100,
        ) {
            prop_assert!(derive_facets(&records, year).years.contains(&year));
        }

        #[test]
        fn sort_is_stable_and_ordered(records in proptest::collection::vec(arb_record(), 0..30)) {
            let mut rows: Vec<usize> = (0..records.len()).collect();
            sort_rows(&records, &mut rows);
            for pair in rows.windows(2) {
                let (a, b) = (&records[pair[0]], &records[pair[1]]);
                let ka = (a.surgery_date, a.patient_name.to_lowercase());
                let kb = (b.surgery_date, b.patient_name.to_lowercase());
                prop_assert!(ka <= kb);
                if ka == kb {
                    prop_assert!(pair[0] < pair[1]);
                }
            }
        }

        #[test]
        fn page_stays_in_bounds(
            n in 0usize..200,
            size in 1usize..25,
            moves in proptest::collection::vec(any::<bool>(), 0..40),
        ) {
            let mut p = Pagination::new(size);
            for forward in moves {
                if forward { p.next(n) } else { p.prev() }
                p.clamp(n);
                prop_assert!(p.page >= 1);
                prop_assert!(p.page <= std::cmp::max(1, n.div_ceil(size)));
            }
        }

        #[test]
        fn empty_month_filters_everything(records in proptest::collection::vec(arb_record(), 0..20)) {
            let mut state = august();
            state.month = None;
            prop_assert!(apply_filter(&records, &state).is_empty());
        }

        #[test]
        fn status_toggle_twice_is_identity(label in "[a-z]{1,5}", start in proptest::option::of("[a-z]{1,5}")) {
            let mut state = august();
            state.status = start.clone();
            if start.as_deref() != Some(label.as_str()) {
                state.toggle_status(&label);
                state.toggle_status(&label);
                prop_assert_eq!(state.status, None);
            }
        }
    }
}
