use std::ops::Range;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::time::{Duration, Instant};

use chrono::{Datelike, NaiveDate};
use ratatui::crossterm::event::KeyEvent;
use tracing::{debug, error, info, trace};

use crate::bindings::Bindings;
use crate::domain::{AppConfig, FdError, Message, RECORD_COLUMNS};
use crate::filter::{
    Facets, FilterState, Pagination, YearSelection, derive_facets, sort_and_paginate,
    status_facets,
};
use crate::inputter::{InputResult, Inputter};
use crate::records::{Record, RecordStore, load_records};
use crate::session::{Capabilities, Permission};

/// Lifecycle of the records view while its module is mounted.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineState {
    Unloaded,
    Loading,
    Loaded,
    Unmounted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowAction {
    Upload,
    OpenFolder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnHandle {
    Filter,
    Resize,
}

/// Side effects the engine asks its host to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineAction {
    Upload { folder: String, admission_code: String },
    OpenFolder { folder: String, admission_code: String },
    Copy(String),
    Reload,
    Notify(String),
}

/// A record query running on the worker pool.
struct PendingFetch {
    rx: Receiver<Result<Vec<Record>, FdError>>,
    soft: bool,
}

/// Floating filter input of one column.
struct ColumnPopover {
    column: usize,
    input: Inputter,
    last: InputResult,
    pending_since: Option<Instant>,
}

/// Column widths in terminal cells, bounded, with a growing minimum table width.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnLayout {
    pub widths: Vec<u16>,
    initial_total: u16,
    pub min_table_width: u16,
    min: u16,
    max: u16,
}

impl ColumnLayout {
    pub fn new(widths: Vec<u16>, min: u16, max: u16) -> Self {
        let widths: Vec<u16> = widths.into_iter().map(|w| w.clamp(min, max)).collect();
        let initial_total = widths.iter().sum();
        Self {
            widths,
            initial_total,
            min_table_width: initial_total,
            min,
            max,
        }
    }

    /// Change one column's width, holding all others fixed.
    pub fn resize(&mut self, column: usize, delta: i32) {
        let Some(width) = self.widths.get_mut(column) else {
            return;
        };
        let new = (*width as i32 + delta).clamp(self.min as i32, self.max as i32) as u16;
        *width = new;
        let total: u16 = self.widths.iter().sum();
        self.min_table_width = if total > self.initial_total {
            total
        } else {
            self.initial_total
        };
        trace!("Column {column} width {new}, table min width {}", self.min_table_width);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeaderCell {
    pub name: String,
    pub width: u16,
    pub filter_active: bool,
    pub popover_open: bool,
}

/// Everything the UI needs to draw the records module.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordsView {
    pub header: Vec<HeaderCell>,
    pub rows: Vec<Vec<String>>,
    pub selected_row: usize,
    pub selected_column: usize,
    pub year_label: String,
    pub month_label: String,
    pub statuses: Vec<(String, bool)>,
    pub page: usize,
    pub page_count: usize,
    pub has_prev: bool,
    pub has_next: bool,
    pub filtered_count: usize,
    pub total_count: usize,
    pub popover: Option<(usize, InputResult)>,
    pub min_table_width: u16,
}

pub fn month_name(month: Option<u32>) -> String {
    const NAMES: [&str; 12] = [
        "January", "February", "March", "April", "May", "June", "July", "August", "September",
        "October", "November", "December",
    ];
    month
        .and_then(|m| (m as usize).checked_sub(1))
        .and_then(|i| NAMES.get(i))
        .map(|s| s.to_string())
        .unwrap_or_else(|| "(no month)".to_string())
}

/// Holds the loaded records and all transient view state of the records module.
pub struct RecordEngine {
    state: EngineState,
    owner_id: String,
    capabilities: Capabilities,
    today: NaiveDate,
    records: Vec<Record>,
    facets: Facets,
    filter: FilterState,
    pagination: Pagination,
    rows: Vec<usize>,
    page_range: Range<usize>,
    statuses: Vec<String>,
    curser_row: usize,
    curser_column: usize,
    popover: Option<ColumnPopover>,
    layout: ColumnLayout,
    row_bindings: Bindings<(usize, RowAction), usize>,
    column_bindings: Bindings<(usize, ColumnHandle), usize>,
    debounce: Duration,
    pending: Option<PendingFetch>,
    view: RecordsView,
}

impl RecordEngine {
    pub fn new(cfg: &AppConfig, owner_id: &str, capabilities: Capabilities, today: NaiveDate) -> Self {
        let layout = ColumnLayout::new(
            vec![10, 12, 28, 14, 16],
            cfg.min_column_width,
            cfg.max_column_width,
        );
        Self {
            state: EngineState::Unloaded,
            owner_id: owner_id.to_string(),
            capabilities,
            today,
            records: Vec::new(),
            facets: Facets::default(),
            filter: FilterState::new(today.year(), today.month()),
            pagination: Pagination::new(cfg.page_size),
            rows: Vec::new(),
            page_range: 0..0,
            statuses: Vec::new(),
            curser_row: 0,
            curser_column: 2,
            popover: None,
            layout,
            row_bindings: Bindings::new(),
            column_bindings: Bindings::new(),
            debounce: cfg.filter_debounce,
            pending: None,
            view: RecordsView::default(),
        }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn view(&self) -> &RecordsView {
        &self.view
    }

    pub fn layout(&self) -> &ColumnLayout {
        &self.layout
    }

    pub fn row_binding_count(&self) -> usize {
        self.row_bindings.len()
    }

    /// Raw keys go to the popover while one is open.
    pub fn wants_raw_keys(&self) -> bool {
        self.popover.is_some()
    }

    pub fn is_loading(&self) -> bool {
        self.state == EngineState::Loading
    }

    /// Full load: reset the filter to the current month and fetch records.
    pub fn mount(&mut self, store: Arc<dyn RecordStore>) {
        self.filter = FilterState::new(self.today.year(), self.today.month());
        self.pagination.page = 1;
        self.fetch(store, false);
    }

    /// Soft refresh: refetch keeping year, month and column filters.
    pub fn reload(&mut self, store: Arc<dyn RecordStore>) {
        self.fetch(store, true);
    }

    fn fetch(&mut self, store: Arc<dyn RecordStore>, soft: bool) {
        let (tx, rx) = mpsc::channel();
        let owner_id = self.owner_id.clone();
        rayon::spawn(move || {
            // The engine may be gone by now.
            let _ = tx.send(load_records(store.as_ref(), &owner_id));
        });
        // A newer fetch replaces the older one, whose result is then dropped.
        self.pending = Some(PendingFetch { rx, soft });
        self.state = EngineState::Loading;
    }

    /// Apply a finished fetch. Returns the number of loaded records, or the
    /// error, once the running fetch completes.
    pub fn poll_fetch(&mut self) -> Option<Result<usize, FdError>> {
        let pending = self.pending.as_ref()?;
        let result = match pending.rx.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Disconnected) => {
                Err(FdError::Data("record query ended without a result".to_string()))
            }
        };
        let soft = pending.soft;
        self.pending = None;
        // A failed fetch leaves the previous records in place.
        self.state = EngineState::Loaded;
        match result {
            Ok(records) => {
                self.records = records;
                self.facets = derive_facets(&self.records, self.today.year());
                if soft
                    && let Some(status) = &self.filter.status
                    && !status_facets(&self.records, &self.filter).contains(status)
                {
                    debug!("Dropping status filter {status:?} after reload");
                    self.filter.status = None;
                }
                self.refresh();
                Some(Ok(self.records.len()))
            }
            Err(e) => {
                error!("Loading records failed: {e}");
                self.refresh();
                Some(Err(e))
            }
        }
    }

    /// Release bindings and drop all state. The engine is unusable afterwards.
    pub fn dispose(&mut self) {
        info!("Unmounting records view");
        self.row_bindings.dispose();
        self.column_bindings.dispose();
        self.popover = None;
        self.pending = None;
        self.records.clear();
        self.rows.clear();
        self.view = RecordsView::default();
        self.state = EngineState::Unmounted;
    }

    /// Recompute facets, filtered rows and the visible page, then render.
    fn refresh(&mut self) {
        self.statuses = status_facets(&self.records, &self.filter);
        let (rows, range) = sort_and_paginate(&self.records, &self.filter, &mut self.pagination);
        self.rows = rows;
        self.page_range = range;
        let visible = self.page_range.len();
        self.curser_row = if visible == 0 {
            0
        } else {
            std::cmp::min(self.curser_row, visible - 1)
        };
        self.render_rows();
    }

    fn refilter(&mut self) {
        self.pagination.page = 1;
        self.curser_row = 0;
        self.refresh();
    }

    /// Rebuild the view of the current page and its bindings.
    fn render_rows(&mut self) {
        self.row_bindings.dispose();
        self.column_bindings.dispose();

        let page_rows = &self.rows[self.page_range.clone()];
        for (row, &ridx) in page_rows.iter().enumerate() {
            if self.capabilities.allows(Permission::UploadFiles) {
                self.row_bindings.bind((row, RowAction::Upload), ridx);
            }
            if self.capabilities.allows(Permission::ViewFiles) {
                self.row_bindings.bind((row, RowAction::OpenFolder), ridx);
            }
        }
        for column in 0..RECORD_COLUMNS.len() {
            self.column_bindings.bind((column, ColumnHandle::Filter), column);
            self.column_bindings.bind((column, ColumnHandle::Resize), column);
        }

        let rows = page_rows
            .iter()
            .map(|&ridx| {
                (0..RECORD_COLUMNS.len())
                    .map(|c| self.records[ridx].column_text(c))
                    .collect()
            })
            .collect();

        let header = RECORD_COLUMNS
            .iter()
            .enumerate()
            .map(|(idx, name)| HeaderCell {
                name: name.to_string(),
                width: self.layout.widths[idx],
                filter_active: self.filter.column_filter(idx).is_some(),
                popover_open: self.popover.as_ref().is_some_and(|p| p.column == idx),
            })
            .collect();

        let count = self.rows.len();
        self.view = RecordsView {
            header,
            rows,
            selected_row: self.curser_row,
            selected_column: self.curser_column,
            year_label: match self.filter.year {
                YearSelection::All => "All years".to_string(),
                YearSelection::Year(y) => y.to_string(),
            },
            month_label: month_name(self.filter.month),
            statuses: self
                .statuses
                .iter()
                .map(|s| (s.clone(), self.filter.status.as_ref() == Some(s)))
                .collect(),
            page: self.pagination.page,
            page_count: self.pagination.page_count(count),
            has_prev: self.pagination.has_prev(),
            has_next: self.pagination.has_next(count),
            filtered_count: count,
            total_count: self.records.len(),
            popover: self.popover.as_ref().map(|p| (p.column, p.last.clone())),
            min_table_width: self.layout.min_table_width,
        };
    }

    /// Handle a message while mounted. Returns a host action if one is needed.
    pub fn update(&mut self, msg: &Message, now: Instant) -> Option<EngineAction> {
        if self.state == EngineState::Unmounted {
            return None;
        }
        match msg {
            Message::Tick(now) => self.tick(*now),
            Message::RawKey(key) => self.popover_key(*key, now),
            Message::MoveUp => {
                self.curser_row = self.curser_row.saturating_sub(1);
                self.render_rows();
            }
            Message::MoveDown => {
                if self.curser_row + 1 < self.page_range.len() {
                    self.curser_row += 1;
                }
                self.render_rows();
            }
            Message::MoveLeft => {
                self.curser_column = self.curser_column.saturating_sub(1);
                self.render_rows();
            }
            Message::MoveRight => {
                self.curser_column = std::cmp::min(self.curser_column + 1, RECORD_COLUMNS.len() - 1);
                self.render_rows();
            }
            Message::NextPage => self.next_page(),
            Message::PrevPage => self.prev_page(),
            Message::NextYear => self.step_year(1),
            Message::PrevYear => self.step_year(-1),
            Message::NextMonth => self.step_month(1),
            Message::PrevMonth => self.step_month(-1),
            Message::ToggleStatus(n) => self.toggle_status(*n),
            Message::CycleStatus => self.cycle_status(),
            Message::FilterColumn => self.open_popover(self.curser_column),
            Message::ClearColumnFilter => {
                self.filter.set_column_filter(self.curser_column, "");
                self.refilter();
            }
            Message::WidenColumn => self.resize_column(self.curser_column, 1),
            Message::NarrowColumn => self.resize_column(self.curser_column, -1),
            Message::Upload => return self.row_action(RowAction::Upload),
            Message::OpenFolder => return self.row_action(RowAction::OpenFolder),
            Message::CopyCell => {
                return self
                    .selected_record()
                    .map(|r| EngineAction::Copy(r.admission_code.clone()));
            }
            Message::Reload => return Some(EngineAction::Reload),
            _ => (),
        }
        None
    }

    fn selected_record(&self) -> Option<&Record> {
        self.rows
            .get(self.page_range.start + self.curser_row)
            .filter(|_| self.curser_row < self.page_range.len())
            .map(|&ridx| &self.records[ridx])
    }

    fn row_action(&self, action: RowAction) -> Option<EngineAction> {
        let Some(ridx) = self.row_bindings.dispatch(&(self.curser_row, action)) else {
            if self.page_range.is_empty() {
                return None;
            }
            return Some(EngineAction::Notify(
                "You do not have permission for this action.".to_string(),
            ));
        };
        let record = &self.records[ridx];
        let folder = record.folder();
        let admission_code = record.admission_code.clone();
        Some(match action {
            RowAction::Upload => EngineAction::Upload { folder, admission_code },
            RowAction::OpenFolder => EngineAction::OpenFolder { folder, admission_code },
        })
    }

    pub fn next_page(&mut self) {
        self.pagination.next(self.rows.len());
        self.curser_row = 0;
        self.refresh();
    }

    pub fn prev_page(&mut self) {
        self.pagination.prev();
        self.curser_row = 0;
        self.refresh();
    }

    fn step_year(&mut self, step: i32) {
        let mut options = vec![YearSelection::All];
        options.extend(self.facets.years.iter().map(|&y| YearSelection::Year(y)));
        let idx = options.iter().position(|&y| y == self.filter.year).unwrap_or(0) as i32;
        let next = (idx + step).rem_euclid(options.len() as i32) as usize;
        self.select_year(options[next]);
    }

    pub fn select_year(&mut self, year: YearSelection) {
        self.filter.year = year;
        if let Some(month) = self.filter.month
            && !self.facets.months_for(year).contains(&month)
        {
            self.filter.month = None;
        }
        self.refilter();
    }

    fn step_month(&mut self, step: i32) {
        let mut options: Vec<Option<u32>> = vec![None];
        options.extend(self.facets.months_for(self.filter.year).into_iter().map(Some));
        if !options.contains(&self.filter.month) {
            options.push(self.filter.month);
            options.sort();
        }
        let idx = options.iter().position(|&m| m == self.filter.month).unwrap_or(0) as i32;
        let next = (idx + step).rem_euclid(options.len() as i32) as usize;
        self.select_month(options[next]);
    }

    pub fn select_month(&mut self, month: Option<u32>) {
        self.filter.month = month;
        self.refilter();
    }

    /// Toggle the `n`th (1-based) status button.
    pub fn toggle_status(&mut self, n: usize) {
        let Some(label) = n.checked_sub(1).and_then(|i| self.statuses.get(i)).cloned() else {
            return;
        };
        self.filter.toggle_status(&label);
        self.refilter();
    }

    /// Step the status filter through no status and each offered label.
    pub fn cycle_status(&mut self) {
        let next = match &self.filter.status {
            None => self.statuses.first().cloned(),
            Some(current) => self
                .statuses
                .iter()
                .position(|s| s == current)
                .and_then(|idx| self.statuses.get(idx + 1))
                .cloned(),
        };
        self.filter.status = next;
        self.refilter();
    }

    pub fn resize_column(&mut self, column: usize, delta: i32) {
        if self.column_bindings.dispatch(&(column, ColumnHandle::Resize)).is_some() {
            self.layout.resize(column, delta);
            self.render_rows();
        }
    }

    /// Open the filter input of `column`, closing any other open one first.
    pub fn open_popover(&mut self, column: usize) {
        if self.column_bindings.dispatch(&(column, ColumnHandle::Filter)).is_none() {
            return;
        }
        self.close_popover();
        let mut input = Inputter::default();
        input.set(self.filter.column_filter(column).unwrap_or_default());
        let last = input.get();
        self.popover = Some(ColumnPopover {
            column,
            input,
            last,
            pending_since: None,
        });
        self.render_rows();
    }

    /// Close without committing the pending text.
    pub fn close_popover(&mut self) {
        if let Some(p) = self.popover.take() {
            trace!("Closing filter popover of column {}", p.column);
            self.render_rows();
        }
    }

    fn commit_popover(&mut self) {
        if let Some(p) = self.popover.as_mut() {
            p.pending_since = None;
            let (column, text) = (p.column, p.last.input.clone());
            if self.filter.column_filter(column).unwrap_or_default() != text {
                debug!("Column {column} filter {text:?}");
                self.filter.set_column_filter(column, &text);
                self.refilter();
            }
        }
    }

    fn popover_key(&mut self, key: KeyEvent, now: Instant) {
        let Some(p) = self.popover.as_mut() else {
            return;
        };
        p.last = p.input.read(key);
        if p.last.changed {
            p.pending_since = Some(now);
        }
        let result = p.last.clone();
        if result.canceled || result.left_focus {
            self.close_popover();
        } else if result.finished {
            self.commit_popover();
            self.close_popover();
        } else {
            self.render_rows();
        }
    }

    /// Commit debounced filter text.
    pub fn tick(&mut self, now: Instant) {
        let due = self
            .popover
            .as_ref()
            .and_then(|p| p.pending_since)
            .is_some_and(|since| now.duration_since(since) >= self.debounce);
        if due {
            self.commit_popover();
        }
    }
}
