use std::time::{Duration, Instant};
use tracing::trace;

use ratatui::crossterm::event::{self, Event, KeyCode, KeyModifiers};
use crate::domain::{AppConfig, FdError, Message};
use crate::model::Model;

pub struct Controller {
    event_poll_time: u64,
}

impl Controller {
    pub fn new(cfg: &AppConfig) -> Self {
        Self {
            event_poll_time: cfg.event_poll_time,
        }
    }

    /// Wait for one terminal event. Without input this yields a tick.
    pub fn handle_event(&self, model: &Model) -> Result<Message, FdError> {
        if event::poll(Duration::from_millis(self.event_poll_time))? {
            match event::read()? {
                Event::Key(key) if key.kind == event::KeyEventKind::Press => {
                    if model.raw_keyevents() {
                        return Ok(Message::RawKey(key));
                    }
                    if let Some(message) = Self::handle_key(key) {
                        return Ok(message);
                    }
                }
                Event::Resize(width, height) => {
                    return Ok(Message::Resize(width as usize, height as usize));
                }
                _ => {}
            }
        }
        Ok(Message::Tick(Instant::now()))
    }

    fn handle_key(key: event::KeyEvent) -> Option<Message> {
        let message = match (key.code, key.modifiers) {
            (KeyCode::Char('c'), KeyModifiers::CONTROL) => Some(Message::Quit),
            (KeyCode::Char('q'), _) => Some(Message::Quit),
            (KeyCode::Up, _) | (KeyCode::Char('k'), _) => Some(Message::MoveUp),
            (KeyCode::Down, _) | (KeyCode::Char('j'), _) => Some(Message::MoveDown),
            (KeyCode::Left, _) | (KeyCode::Char('h'), _) => Some(Message::MoveLeft),
            (KeyCode::Right, _) | (KeyCode::Char('l'), _) => Some(Message::MoveRight),
            (KeyCode::PageDown, _) | (KeyCode::Char('n'), _) => Some(Message::NextPage),
            (KeyCode::PageUp, _) | (KeyCode::Char('p'), _) => Some(Message::PrevPage),
            (KeyCode::Char(']'), _) => Some(Message::NextYear),
            (KeyCode::Char('['), _) => Some(Message::PrevYear),
            (KeyCode::Char('}'), _) => Some(Message::NextMonth),
            (KeyCode::Char('{'), _) => Some(Message::PrevMonth),
            (KeyCode::Char(d @ '1'..='9'), _) => d.to_digit(10).map(|n| Message::ToggleStatus(n as usize)),
            (KeyCode::Char('s'), _) => Some(Message::CycleStatus),
            (KeyCode::Char('/'), _) => Some(Message::FilterColumn),
            (KeyCode::Char('x'), _) => Some(Message::ClearColumnFilter),
            (KeyCode::Char('>'), _) => Some(Message::WidenColumn),
            (KeyCode::Char('<'), _) => Some(Message::NarrowColumn),
            (KeyCode::Char('u'), _) => Some(Message::Upload),
            (KeyCode::Char('o'), _) => Some(Message::OpenFolder),
            (KeyCode::Char('c'), _) => Some(Message::CopyCell),
            (KeyCode::Char('r'), _) => Some(Message::Reload),
            (KeyCode::Char('m'), _) => Some(Message::Menu),
            (KeyCode::Char('t'), _) => Some(Message::ToggleTheme),
            (KeyCode::Char('?'), _) => Some(Message::Help),
            (KeyCode::Enter, _) => Some(Message::Enter),
            (KeyCode::Esc, _) => Some(Message::Exit),
            _ => None,
        };
        trace!("Mapped: {key:?} => {message:?}");
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratatui::crossterm::event::KeyEvent;

    #[test]
    fn maps_shell_keys() {
        let map = |code| Controller::handle_key(KeyEvent::new(code, KeyModifiers::NONE));
        assert_eq!(map(KeyCode::Char('q')), Some(Message::Quit));
        assert_eq!(map(KeyCode::Char('3')), Some(Message::ToggleStatus(3)));
        assert_eq!(map(KeyCode::Char('/')), Some(Message::FilterColumn));
        assert_eq!(map(KeyCode::Char('0')), None);
        assert_eq!(map(KeyCode::Char('s')), Some(Message::CycleStatus));
        assert_eq!(
            Controller::handle_key(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            Some(Message::Quit)
        );
    }
}
