use ratatui::crossterm::event::{self, KeyCode, KeyModifiers};
use tracing::trace;

/// Single line text input used by the column filter popover and the upload prompt.
#[derive(Default)]
pub struct Inputter {
    current_input: String,
    curser_pos: usize, // in chars, not bytes
    finished: bool,
    canceled: bool,
    left_focus: bool,
}

#[derive(Default, Clone, Debug, PartialEq)]
pub struct InputResult {
    pub input: String,
    pub curser_pos: usize,
    /// Enter was pressed.
    pub finished: bool,
    /// Esc was pressed.
    pub canceled: bool,
    /// Focus moved away from the input (Tab).
    pub left_focus: bool,
    /// The text changed with this key.
    pub changed: bool,
}

impl Inputter {
    pub fn read(&mut self, key: event::KeyEvent) -> InputResult {
        let before = self.current_input.clone();
        match (key.code, key.modifiers) {
            (KeyCode::Enter, _) => self.finished = true,
            (KeyCode::Esc, _) => {
                self.canceled = true;
                self.finished = true;
            }
            (KeyCode::Tab, _) | (KeyCode::BackTab, _) => self.left_focus = true,
            (KeyCode::Backspace, _) => self.backspace(),
            (KeyCode::Delete, _) => self.delete(),
            (KeyCode::Left, _) => self.curser_pos = self.curser_pos.saturating_sub(1),
            (KeyCode::Right, _) => {
                self.curser_pos = std::cmp::min(self.curser_pos + 1, self.char_len())
            }
            (KeyCode::Home, _) => self.curser_pos = 0,
            (KeyCode::End, _) => self.curser_pos = self.char_len(),
            (KeyCode::Char(chr), KeyModifiers::NONE | KeyModifiers::SHIFT) => self.insert(chr),
            (kc, km) => trace!("Ignoring input key {kc:?} {km:?}"),
        }
        let mut result = self.get();
        result.changed = before != self.current_input;
        result
    }

    /// Replace the text and put the curser at its end.
    pub fn set(&mut self, s: &str) {
        self.current_input = s.to_string();
        self.curser_pos = self.char_len();
    }

    pub fn get(&self) -> InputResult {
        InputResult {
            input: self.current_input.clone(),
            curser_pos: self.curser_pos,
            finished: self.finished,
            canceled: self.canceled,
            left_focus: self.left_focus,
            changed: false,
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn char_len(&self) -> usize {
        self.current_input.chars().count()
    }

    fn insert(&mut self, chr: char) {
        let at = self.getbytepos(self.curser_pos);
        self.current_input.insert(at, chr);
        self.curser_pos += 1;
    }

    fn backspace(&mut self) {
        if self.curser_pos > 0 {
            let at = self.getbytepos(self.curser_pos - 1);
            self.current_input.remove(at);
            self.curser_pos -= 1;
        }
    }

    fn delete(&mut self) {
        if self.curser_pos < self.char_len() {
            let at = self.getbytepos(self.curser_pos);
            self.current_input.remove(at);
        }
    }

    fn getbytepos(&self, char_pos: usize) -> usize {
        self.current_input
            .char_indices()
            .nth(char_pos)
            .map(|(byte_idx, _)| byte_idx)
            .unwrap_or(self.current_input.len())
    }
}
