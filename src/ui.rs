use std::ops::Range;

use ratatui::{
    Frame,
    layout::{Constraint, Layout, Position, Rect},
    style::{Color, Modifier, Style, Stylize},
    text::{Line, Span, Text},
    widgets::{Block, BorderType, Cell, Clear, List, ListItem, ListState, Paragraph, Row, Table, TableState, Wrap},
};

use crate::account::{PASSWORD_FIELDS, PasswordForm};
use crate::domain::AppConfig;
use crate::engine::{RecordEngine, RecordsView};
use crate::inputter::InputResult;
use crate::loader::{Markup, StyleSheet};
use crate::model::{
    ActiveModule, Content, FilesPopup, MenuItem, Model, Modus, PanelMessage, ProfileView,
    UploadPanel,
};
use crate::session::{IconCategory, SessionStatus};
use crate::storage::FileListing;

pub const HEADER_HEIGHT: u16 = 1;
pub const STATUSLINE_HEIGHT: u16 = 1;
pub const COLUMN_SPACING: u16 = 1;

/// Columns that fit into `available` cells, always including `selected`.
///
/// The table is laid out at `min_table_width` at least. When that does not fit, the
/// window starts as far left as possible while still reaching the selected column.
pub fn visible_columns(widths: &[u16], min_table_width: u16, available: u16, selected: usize) -> Range<usize> {
    if widths.is_empty() {
        return 0..0;
    }
    let span = |cols: &[u16]| -> u32 {
        cols.iter().map(|w| *w as u32).sum::<u32>() + COLUMN_SPACING as u32 * cols.len().saturating_sub(1) as u32
    };
    let spacing = COLUMN_SPACING as u32 * (widths.len() - 1) as u32;
    let table_width = std::cmp::max(min_table_width as u32 + spacing, span(widths));
    if table_width <= available as u32 {
        return 0..widths.len();
    }
    let selected = std::cmp::min(selected, widths.len() - 1);
    let mut start = 0;
    while start < selected && span(&widths[start..=selected]) > available as u32 {
        start += 1;
    }
    let mut end = selected + 1;
    while end < widths.len() && span(&widths[start..=end]) <= available as u32 {
        end += 1;
    }
    start..end
}

#[derive(Debug, Clone, Copy)]
struct Theme {
    base: Style,
    accent: Style,
    muted: Style,
    error: Style,
    success: Style,
    selected: Style,
}

impl Theme {
    fn new(dark: bool) -> Self {
        if dark {
            Self {
                base: Style::default().fg(Color::Gray).bg(Color::Black),
                accent: Style::default().fg(Color::Cyan),
                muted: Style::default().fg(Color::DarkGray),
                error: Style::default().fg(Color::LightRed),
                success: Style::default().fg(Color::LightGreen),
                selected: Style::default().bg(Color::DarkGray).fg(Color::White),
            }
        } else {
            Self {
                base: Style::default().fg(Color::Black).bg(Color::White),
                accent: Style::default().fg(Color::Blue),
                muted: Style::default().fg(Color::Gray),
                error: Style::default().fg(Color::Red),
                success: Style::default().fg(Color::Green),
                selected: Style::default().bg(Color::LightBlue).fg(Color::Black),
            }
        }
    }
}

pub struct TableUI {
    table_state: TableState,
}

impl TableUI {
    pub fn new(_cfg: &AppConfig) -> Self {
        Self {
            table_state: TableState::default(),
        }
    }

    pub fn draw(&mut self, model: &Model, frame: &mut Frame) {
        let theme = Theme::new(model.dark_mode());
        frame.render_widget(Block::default().style(theme.base), frame.area());

        let [header, content, statusline] = Layout::vertical([
            Constraint::Length(HEADER_HEIGHT),
            Constraint::Min(0),
            Constraint::Length(STATUSLINE_HEIGHT),
        ])
        .areas(frame.area());

        Self::draw_header(model, &theme, frame, header);
        self.draw_content(model, &theme, frame, content);
        Self::draw_statusline(model, &theme, frame, statusline);

        match model.modus() {
            Modus::MENU => Self::draw_menu(model, &theme, frame),
            Modus::LOGOUT => Self::draw_logout(&theme, frame),
            Modus::POPUP => Self::draw_popup(model.popup_message(), &theme, frame),
            Modus::FILES => {
                if let Some(files) = model.files_popup() {
                    Self::draw_files(files, &theme, frame);
                }
            }
            Modus::UPLOAD => {
                if let Some(panel) = model.upload_panel() {
                    Self::draw_upload(panel, &theme, frame);
                }
            }
            Modus::SHELL => {}
        }
    }

    fn draw_header(model: &Model, theme: &Theme, frame: &mut Frame, area: Rect) {
        let mut spans = vec![Span::styled(format!(" {} ", model.header_date()), theme.muted)];
        if let Some(profile) = model.profile() {
            let icon = match profile.icon {
                IconCategory::Male => "♂",
                IconCategory::Female => "♀",
                IconCategory::Other => "●",
            };
            spans.push(Span::raw("  "));
            spans.push(Span::styled(format!("{icon} {}", profile.display_name), theme.accent.add_modifier(Modifier::BOLD)));
            spans.push(Span::raw(" "));
            spans.push(Span::styled(format!("[{}]", profile.role_badge()), theme.muted));
            let status_style = match model.session_status() {
                SessionStatus::Connected => Style::default().fg(Color::White).bg(Color::Green),
                SessionStatus::LastAccess { .. } => Style::default().fg(Color::White).bg(Color::Gray),
            };
            spans.push(Span::raw(" "));
            spans.push(Span::styled(format!(" {} ", model.session_status()), status_style));
        }
        frame.render_widget(Paragraph::new(Line::from(spans)), area);
    }

    fn draw_statusline(model: &Model, theme: &Theme, frame: &mut Frame, area: Rect) {
        let message = model.status_message();
        let line = if message.is_empty() {
            Line::from(vec![
                " Menu ".into(),
                "<m>".fg(Color::Blue).bold(),
                " Help ".into(),
                "<?>".fg(Color::Blue).bold(),
                " Quit ".into(),
                "<q> ".fg(Color::Blue).bold(),
            ])
        } else {
            Line::from(Span::styled(format!(" {message}"), theme.muted))
        };
        frame.render_widget(Paragraph::new(line), area);
    }

    fn draw_content(&mut self, model: &Model, theme: &Theme, frame: &mut Frame, area: Rect) {
        match model.content() {
            Content::Empty => {
                let text = if model.is_loading() { "Loading ..." } else { "" };
                frame.render_widget(Paragraph::new(text).centered().style(theme.muted), area);
            }
            Content::Mounted { markup, style } => {
                let inner = Self::draw_markup(markup, style, theme, frame, area);
                frame.render_widget(Paragraph::new("Loading module ...").style(theme.muted), inner);
            }
            Content::Error(message) => {
                let block = Block::bordered()
                    .title(Line::from(" Error ").style(theme.error.add_modifier(Modifier::BOLD)))
                    .border_style(theme.error);
                frame.render_widget(
                    Paragraph::new(message.as_str()).wrap(Wrap { trim: true }).block(block),
                    area,
                );
            }
            Content::Active { markup, style, module } => {
                let inner = Self::draw_markup(markup, style, theme, frame, area);
                match module {
                    ActiveModule::Records(engine) => self.draw_records(engine, style, theme, frame, inner),
                    ActiveModule::PersonalData(view) => Self::draw_profile(view, theme, frame, inner),
                    ActiveModule::ChangePassword(form) => Self::draw_password(form, style, theme, frame, inner),
                }
            }
        }
    }

    /// Draw the module frame and its static text, returning the area left for the module.
    fn draw_markup(markup: &Markup, style: &StyleSheet, theme: &Theme, frame: &mut Frame, area: Rect) -> Rect {
        let block = Block::bordered()
            .border_type(BorderType::Rounded)
            .title(Line::from(format!(" {} ", markup.title)).style(theme.accent.patch(style.get("title"))));
        let inner = block.inner(area);
        frame.render_widget(block, area);

        let body_height = std::cmp::min(markup.lines.len() as u16, inner.height / 3);
        let [body, rest] =
            Layout::vertical([Constraint::Length(body_height), Constraint::Min(0)]).areas(inner);
        let text = Text::from(markup.lines.iter().map(|l| Line::from(l.as_str())).collect::<Vec<_>>());
        frame.render_widget(Paragraph::new(text).style(theme.muted.patch(style.get("body"))), body);
        rest
    }

    fn draw_records(&mut self, engine: &RecordEngine, style: &StyleSheet, theme: &Theme, frame: &mut Frame, area: Rect) {
        let view = engine.view();
        let [facets, table_area, footer] = Layout::vertical([
            Constraint::Length(1),
            Constraint::Min(0),
            Constraint::Length(1),
        ])
        .areas(area);

        // Facet bar
        let mut spans = vec![
            Span::raw("Year "),
            Span::styled(format!("‹{}›", view.year_label), theme.accent),
            Span::raw("  Month "),
            Span::styled(format!("‹{}›", view.month_label), theme.accent),
            Span::raw("  Status "),
        ];
        if view.statuses.is_empty() {
            spans.push(Span::styled("none", theme.muted));
        }
        for (idx, (label, active)) in view.statuses.iter().enumerate() {
            let s = if *active {
                theme.selected.add_modifier(Modifier::BOLD).patch(style.get("status-active"))
            } else {
                theme.muted
            };
            spans.push(Span::styled(format!("[{} {}]", idx + 1, label), s));
            spans.push(Span::raw(" "));
        }
        frame.render_widget(Paragraph::new(Line::from(spans)), facets);

        // Table, scrolled sideways when narrower than its minimum width
        let widths: Vec<u16> = view.header.iter().map(|h| h.width).collect();
        let cols = visible_columns(&widths, view.min_table_width, table_area.width, view.selected_column);
        let header = Row::new(view.header.iter().enumerate().skip(cols.start).take(cols.len()).map(|(idx, h)| {
            let marker = if h.popover_open {
                " ✎"
            } else if h.filter_active {
                " ▼"
            } else {
                ""
            };
            let mut s = theme.accent.add_modifier(Modifier::BOLD).patch(style.get("header"));
            if h.filter_active {
                s = s.patch(style.get("filter-active")).add_modifier(Modifier::UNDERLINED);
            }
            if idx == view.selected_column {
                s = s.add_modifier(Modifier::REVERSED);
            }
            Cell::from(format!("{}{}", h.name, marker)).style(s)
        }));
        let rows = view
            .rows
            .iter()
            .map(|r| Row::new(r.iter().skip(cols.start).take(cols.len()).map(|c| Cell::from(c.as_str()))));
        let constraints = widths[cols.clone()].iter().map(|w| Constraint::Length(*w));
        let table = Table::new(rows, constraints)
            .header(header)
            .column_spacing(COLUMN_SPACING)
            .row_highlight_style(theme.selected.patch(style.get("selected")));

        self.table_state.select(if view.rows.is_empty() { None } else { Some(view.selected_row) });
        frame.render_stateful_widget(table, table_area, &mut self.table_state);
        if view.rows.is_empty() {
            let empty = Rect { y: table_area.y + 1, height: 1, ..table_area };
            frame.render_widget(Paragraph::new("No records for this selection.").style(theme.muted), empty);
        }

        // Pagination
        let arrow = |enabled: bool, s: &'static str| {
            if enabled {
                Span::styled(s, theme.accent.add_modifier(Modifier::BOLD))
            } else {
                Span::styled(s, theme.muted)
            }
        };
        let mut footer_line = Line::from(vec![
            arrow(view.has_prev, "◀ "),
            Span::raw(format!("Page {} of {}", view.page, view.page_count)),
            arrow(view.has_next, " ▶"),
            Span::styled(
                format!("   {} of {} records", view.filtered_count, view.total_count),
                theme.muted,
            ),
        ]);
        if cols.len() < widths.len() {
            footer_line.push_span(Span::styled(
                format!("   columns {}-{} of {}", cols.start + 1, cols.end, widths.len()),
                theme.muted,
            ));
        }
        frame.render_widget(Paragraph::new(footer_line), footer);

        if let Some((column, input)) = &view.popover {
            Self::draw_popover(view, *column, cols.start, input, theme, frame, table_area);
        }
    }

    fn draw_popover(
        view: &RecordsView,
        column: usize,
        first_visible: usize,
        input: &InputResult,
        theme: &Theme,
        frame: &mut Frame,
        table_area: Rect,
    ) {
        let offset: u16 = view
            .header
            .iter()
            .take(column)
            .skip(first_visible)
            .map(|h| h.width + COLUMN_SPACING)
            .sum();
        let width = std::cmp::max(view.header[column].width, 20) + 2;
        let x = std::cmp::min(table_area.x + offset, table_area.right().saturating_sub(width));
        let area = Rect {
            x,
            y: table_area.y + 1,
            width: std::cmp::min(width, table_area.width),
            height: std::cmp::min(3, table_area.height),
        }
        .intersection(table_area);
        let block = Block::bordered()
            .title(format!(" Filter {} ", view.header[column].name))
            .border_style(theme.accent);
        frame.render_widget(Clear, area);
        frame.render_widget(Paragraph::new(input.input.as_str()).block(block).style(theme.base), area);
        frame.set_cursor_position(Position::new(area.x + 1 + input.curser_pos as u16, area.y + 1));
    }

    fn draw_profile(view: &ProfileView, theme: &Theme, frame: &mut Frame, area: Rect) {
        let p = &view.profile;
        let field = |name: &str, value: String| {
            Line::from(vec![Span::styled(format!("{name:<14}"), theme.muted), Span::raw(value)])
        };
        let permissions = p
            .capabilities
            .permissions
            .iter()
            .map(|perm| format!("{perm:?}"))
            .collect::<Vec<_>>()
            .join(", ");
        let lines = vec![
            field("Name", p.display_name.clone()),
            field("E-mail", view.email.clone()),
            field("Role", p.role_badge().to_string()),
            field("Permissions", if permissions.is_empty() { "-".into() } else { permissions }),
            field(
                "Last login",
                p.last_login
                    .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                    .unwrap_or_else(|| "-".into()),
            ),
        ];
        frame.render_widget(Paragraph::new(lines), area);
    }

    fn draw_password(form: &PasswordForm, style: &StyleSheet, theme: &Theme, frame: &mut Frame, area: Rect) {
        let label_width = 22u16;
        let mut lines = Vec::new();
        for (idx, label) in PASSWORD_FIELDS.iter().enumerate() {
            let focused = form.focus() == Some(idx);
            let value_style = if focused {
                theme.selected.patch(style.get("field-focused"))
            } else {
                theme.base.patch(style.get("field"))
            };
            lines.push(Line::from(vec![
                Span::styled(format!("{label:<w$}", w = label_width as usize), theme.muted),
                Span::styled(format!("{:<24}", form.masked(idx)), value_style),
            ]));
        }
        lines.push(Line::from(""));
        match form.message() {
            Some(PanelMessage::Info(m)) => lines.push(Line::styled(m.clone(), theme.accent)),
            Some(PanelMessage::Success(m)) => lines.push(Line::styled(m.clone(), theme.success)),
            Some(PanelMessage::Error(m)) => lines.push(Line::styled(m.clone(), theme.error)),
            None => {}
        }
        let hint = if form.focus().is_some() {
            "Enter next field or submit, Tab next field, Esc release"
        } else {
            "Enter to edit"
        };
        lines.push(Line::styled(hint, theme.muted));
        frame.render_widget(Paragraph::new(lines), area);

        if let Some(field) = form.focus()
            && (field as u16) < area.height
        {
            let x = area.x + label_width + form.curser_pos(field) as u16;
            let x = std::cmp::min(x, area.right().saturating_sub(1));
            frame.set_cursor_position(Position::new(x, area.y + field as u16));
        }
    }

    fn centered(frame: &Frame, width: u16, height: u16) -> Rect {
        let area = frame.area();
        let width = std::cmp::min(width, area.width);
        let height = std::cmp::min(height, area.height);
        Rect {
            x: area.x + (area.width - width) / 2,
            y: area.y + (area.height - height) / 2,
            width,
            height,
        }
    }

    fn draw_menu(model: &Model, theme: &Theme, frame: &mut Frame) {
        let area = Self::centered(frame, 30, MenuItem::ALL.len() as u16 + 2);
        let items: Vec<ListItem> = MenuItem::ALL.iter().map(|i| ListItem::new(i.label())).collect();
        let list = List::new(items)
            .block(Block::bordered().title(" Menu ").border_style(theme.accent))
            .highlight_style(theme.selected)
            .style(theme.base);
        let mut state = ListState::default().with_selected(Some(model.menu_selected()));
        frame.render_widget(Clear, area);
        frame.render_stateful_widget(list, area, &mut state);
    }

    fn draw_logout(theme: &Theme, frame: &mut Frame) {
        let area = Self::centered(frame, 44, 5);
        let text = Text::from(vec![
            Line::from("Do you really want to log out?"),
            Line::from(""),
            Line::from(vec!["<Enter>".bold(), " confirm   ".into(), "<Esc>".bold(), " cancel".into()]),
        ]);
        frame.render_widget(Clear, area);
        frame.render_widget(
            Paragraph::new(text)
                .centered()
                .style(theme.base)
                .block(Block::bordered().title(" Log out ").border_style(theme.error)),
            area,
        );
    }

    fn draw_popup(message: &str, theme: &Theme, frame: &mut Frame) {
        let height = message.lines().count() as u16 + 2;
        let area = Self::centered(frame, 72, height);
        frame.render_widget(Clear, area);
        frame.render_widget(
            Paragraph::new(message)
                .style(theme.base)
                .block(Block::bordered().title(" Help ").border_style(theme.accent)),
            area,
        );
    }

    fn draw_files(files: &FilesPopup, theme: &Theme, frame: &mut Frame) {
        let lines: Vec<Line> = match &files.listing {
            None => vec![Line::styled("Loading ...", theme.muted)],
            Some(Err(message)) => vec![Line::styled(message.clone(), theme.error)],
            Some(Ok(FileListing::Empty)) => vec![Line::styled("No files in this folder.", theme.muted)],
            Some(Ok(FileListing::Files(list))) => list
                .iter()
                .flat_map(|f| {
                    [
                        Line::styled(f.name.clone(), Style::new().add_modifier(Modifier::BOLD)),
                        Line::styled(format!("  {}", f.url), theme.muted),
                    ]
                })
                .collect(),
        };
        let area = Self::centered(frame, 80, lines.len() as u16 + 2);
        frame.render_widget(Clear, area);
        frame.render_widget(
            Paragraph::new(lines).style(theme.base).block(
                Block::bordered()
                    .title(format!(" Folder {} ", files.admission_code))
                    .border_style(theme.accent),
            ),
            area,
        );
    }

    fn draw_upload(panel: &UploadPanel, theme: &Theme, frame: &mut Frame) {
        let area = Self::centered(frame, 72, 7);
        let input_style = if panel.busy { theme.muted } else { theme.base };
        let mut lines = vec![
            Line::styled(format!("Destination: {}", panel.folder), theme.muted),
            Line::from(vec![Span::raw("File: "), Span::styled(panel.last_input.input.clone(), input_style)]),
        ];
        match &panel.message {
            Some(PanelMessage::Info(m)) => lines.push(Line::styled(m.clone(), theme.accent)),
            Some(PanelMessage::Success(m)) => lines.push(Line::styled(m.clone(), theme.success)),
            Some(PanelMessage::Error(m)) => lines.push(Line::styled(m.clone(), theme.error)),
            None => lines.push(Line::styled("JPEG, PNG or PDF. Enter to upload, Esc to close.", theme.muted)),
        }
        if let Some(url) = &panel.url {
            lines.push(Line::from(vec![Span::raw("View uploaded file: "), Span::styled(url.clone(), theme.accent)]));
        }
        frame.render_widget(Clear, area);
        frame.render_widget(
            Paragraph::new(lines).style(theme.base).block(
                Block::bordered()
                    .title(format!(" Upload to {} ", panel.admission_code))
                    .border_style(theme.accent),
            ),
            area,
        );
        if !panel.busy {
            frame.set_cursor_position(Position::new(
                area.x + 1 + 6 + panel.last_input.curser_pos as u16,
                area.y + 2,
            ));
        }
    }
}
