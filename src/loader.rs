use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

use chrono::Utc;
use ratatui::style::{Color, Modifier, Style};
use tracing::{debug, error, info, trace, warn};

use crate::domain::{AppConfig, FdError};

pub trait AssetSource: Send + Sync {
    /// Text of the asset at `path`. The path may carry a `?t=` cache-busting query.
    fn fetch(&self, path: &str) -> Result<String, FdError>;
}

/// Serves module assets from a local directory.
#[derive(Debug)]
pub struct FsAssetSource {
    root: PathBuf,
}

impl FsAssetSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl AssetSource for FsAssetSource {
    fn fetch(&self, path: &str) -> Result<String, FdError> {
        let path = path.split('?').next().unwrap_or(path);
        fs::read_to_string(self.root.join(path))
            .map_err(|e| FdError::Load(format!("{path}: {e}")))
    }
}

/// The three assets a module is built from.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleSpec {
    pub markup: String,
    pub style: String,
    pub script: String,
}

impl ModuleSpec {
    pub fn new(base: &str) -> Self {
        Self {
            markup: format!("{base}.html"),
            style: format!("{base}.css"),
            script: format!("{base}.js"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Records,
    PersonalData,
    ChangePassword,
}

impl ModuleKind {
    pub fn spec(&self) -> ModuleSpec {
        match self {
            ModuleKind::Records => ModuleSpec::new("module/folderdrive"),
            ModuleKind::PersonalData => ModuleSpec::new("module/info/personal-data"),
            ModuleKind::ChangePassword => ModuleSpec::new("module/info/change-password"),
        }
    }

    /// Resolve the entry point named by a module script (`entry = <name>`).
    pub fn from_script(script: &str) -> Result<Self, FdError> {
        let entry = script
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with("//"))
            .find_map(|l| {
                l.strip_prefix("entry")
                    .map(|rest| rest.trim_start().trim_start_matches('=').trim())
            })
            .ok_or_else(|| FdError::Load("script has no entry point".to_string()))?;
        match entry {
            "records" | "folderdrive" => Ok(ModuleKind::Records),
            "personal-data" => Ok(ModuleKind::PersonalData),
            "change-password" => Ok(ModuleKind::ChangePassword),
            other => Err(FdError::Load(format!("unknown module entry {other:?}"))),
        }
    }
}

/// Static text shown at the top of a module: a title line and body lines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Markup {
    pub title: String,
    pub lines: Vec<String>,
}

impl Markup {
    pub fn parse(text: &str) -> Self {
        let mut lines = text
            .lines()
            .map(|l| l.trim_end().to_string())
            .skip_while(|l| l.trim().is_empty());
        let title = lines.next().unwrap_or_default().trim().to_string();
        Self {
            title,
            lines: lines.collect(),
        }
    }
}

/// Styles by selector, parsed from `selector: fg=<color> bg=<color> bold` lines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StyleSheet {
    rules: HashMap<String, Style>,
}

impl StyleSheet {
    pub fn parse(text: &str) -> Self {
        let mut rules = HashMap::new();
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with("/*") || line.starts_with('#') {
                continue;
            }
            let Some((selector, decls)) = line.split_once(':') else {
                warn!("Ignoring style line {line:?}");
                continue;
            };
            let mut style = Style::default();
            for decl in decls.split_whitespace() {
                style = match decl.split_once('=') {
                    Some(("fg", c)) => Color::from_str(c).map(|c| style.fg(c)).unwrap_or(style),
                    Some(("bg", c)) => Color::from_str(c).map(|c| style.bg(c)).unwrap_or(style),
                    None if decl == "bold" => style.add_modifier(Modifier::BOLD),
                    None if decl == "italic" => style.add_modifier(Modifier::ITALIC),
                    None if decl == "reversed" => style.add_modifier(Modifier::REVERSED),
                    _ => {
                        debug!("Unknown style declaration {decl:?}");
                        style
                    }
                };
            }
            rules.insert(selector.trim().to_string(), style);
        }
        Self { rules }
    }

    pub fn get(&self, selector: &str) -> Style {
        self.rules.get(selector).copied().unwrap_or_default()
    }
}

/// Identifies one `load` call. Completions of older generations are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct LoadGeneration(u64);

#[derive(Debug, Clone, PartialEq)]
pub enum LoaderEvent {
    /// Markup and style are ready to be mounted into the content region.
    Mount {
        generation: LoadGeneration,
        markup: Markup,
        style: StyleSheet,
    },
    /// Markup is mounted and the script resolved: the module may start.
    Activate {
        generation: LoadGeneration,
        kind: ModuleKind,
    },
    Failed {
        generation: LoadGeneration,
        message: String,
    },
}

enum Completion {
    Assets(Result<(String, String), FdError>),
    Script(Result<String, FdError>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Idle,
    FetchingAssets,
    AwaitingMount { attempts: usize, next_check: Instant },
    FetchingScript,
}

/// Fetches module assets in the background and sequences mounting.
///
/// Only the most recent `load` is live. The loader cannot abort a superseded fetch,
/// but its completion carries the old generation and is discarded in `poll`.
pub struct ModuleLoader {
    source: Arc<dyn AssetSource>,
    generation: LoadGeneration,
    spec: Option<ModuleSpec>,
    phase: Phase,
    max_attempts: usize,
    retry_interval: Duration,
    tx: Sender<(LoadGeneration, Completion)>,
    rx: Receiver<(LoadGeneration, Completion)>,
}

impl ModuleLoader {
    pub fn new(cfg: &AppConfig, source: Arc<dyn AssetSource>) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            source,
            generation: LoadGeneration::default(),
            spec: None,
            phase: Phase::Idle,
            max_attempts: cfg.loader_max_attempts,
            retry_interval: cfg.loader_retry_interval,
            tx,
            rx,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.phase != Phase::Idle
    }

    /// Start loading `spec`. The caller must have torn down the previous module.
    pub fn load(&mut self, spec: ModuleSpec) -> LoadGeneration {
        self.generation = LoadGeneration(self.generation.0 + 1);
        let generation = self.generation;
        info!("Loading module {} ({:?})", spec.markup, generation);

        let source = Arc::clone(&self.source);
        let tx = self.tx.clone();
        let (markup_path, style_path) = (spec.markup.clone(), spec.style.clone());
        rayon::spawn(move || {
            let assets = source.fetch(&markup_path).and_then(|markup| {
                let style = source.fetch(&style_path)?;
                if markup.trim().is_empty() || style.trim().is_empty() {
                    return Err(FdError::Load("module markup or style is empty".to_string()));
                }
                Ok((markup, style))
            });
            let _ = tx.send((generation, Completion::Assets(assets)));
        });

        self.spec = Some(spec);
        self.phase = Phase::FetchingAssets;
        generation
    }

    /// Forget the live load; anything still in flight becomes stale.
    pub fn cancel(&mut self) {
        self.generation = LoadGeneration(self.generation.0 + 1);
        self.phase = Phase::Idle;
        self.spec = None;
    }

    fn fail(&mut self, message: String) -> LoaderEvent {
        error!("Module load failed: {message}");
        self.phase = Phase::Idle;
        LoaderEvent::Failed {
            generation: self.generation,
            message,
        }
    }

    fn fetch_script(&mut self) {
        let Some(spec) = &self.spec else { return };
        let path = format!("{}?t={}", spec.script, Utc::now().timestamp_millis());
        trace!("Fetching module script {path}");
        let source = Arc::clone(&self.source);
        let tx = self.tx.clone();
        let generation = self.generation;
        rayon::spawn(move || {
            let _ = tx.send((generation, Completion::Script(source.fetch(&path))));
        });
        self.phase = Phase::FetchingScript;
    }

    /// Drain completions and advance the live load.
    ///
    /// `mounted` reports whether the content region currently holds the markup
    /// handed out with the last `Mount` event.
    pub fn poll(&mut self, now: Instant, mounted: bool) -> Vec<LoaderEvent> {
        let mut events = Vec::new();
        while let Ok((generation, completion)) = self.rx.try_recv() {
            if generation != self.generation {
                debug!("Discarding stale completion of {:?}", generation);
                continue;
            }
            match completion {
                Completion::Assets(Ok((markup, style))) => {
                    self.phase = Phase::AwaitingMount {
                        attempts: 0,
                        next_check: now,
                    };
                    events.push(LoaderEvent::Mount {
                        generation,
                        markup: Markup::parse(&markup),
                        style: StyleSheet::parse(&style),
                    });
                }
                Completion::Script(Ok(script)) => {
                    self.phase = Phase::Idle;
                    match ModuleKind::from_script(&script) {
                        Ok(kind) => events.push(LoaderEvent::Activate { generation, kind }),
                        Err(e) => events.push(self.fail(e.to_string())),
                    }
                }
                Completion::Assets(Err(e)) | Completion::Script(Err(e)) => {
                    events.push(self.fail(e.to_string()));
                }
            }
        }

        // Mount events emitted just now are mounted by the caller before the next poll.
        if !events.is_empty() {
            return events;
        }
        if let Phase::AwaitingMount { attempts, next_check } = self.phase
            && now >= next_check
        {
            if mounted {
                self.fetch_script();
            } else if attempts + 1 >= self.max_attempts {
                events.push(self.fail("timed out waiting for module content".to_string()));
            } else {
                self.phase = Phase::AwaitingMount {
                    attempts: attempts + 1,
                    next_check: now + self.retry_interval,
                };
            }
        }
        events
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::thread;

    #[derive(Default)]
    pub(crate) struct MemoryAssets {
        pub files: HashMap<String, String>,
        pub requests: Mutex<Vec<String>>,
        pub delay: HashMap<String, Duration>,
    }

    impl MemoryAssets {
        pub(crate) fn with_module(mut self, base: &str, entry: &str) -> Self {
            self.files.insert(format!("{base}.html"), format!("Title {entry}\nbody"));
            self.files.insert(format!("{base}.css"), "title: fg=cyan bold".into());
            self.files.insert(format!("{base}.js"), format!("entry = {entry}"));
            self
        }
    }

    impl AssetSource for MemoryAssets {
        fn fetch(&self, path: &str) -> Result<String, FdError> {
            self.requests.lock().unwrap().push(path.to_string());
            let key = path.split('?').next().unwrap_or(path);
            if let Some(d) = self.delay.get(key) {
                thread::sleep(*d);
            }
            self.files
                .get(key)
                .cloned()
                .ok_or_else(|| FdError::Load(format!("404 {key}")))
        }
    }

    /// Poll until an event arrives, treating the region as mounted once `Mount` was seen.
    pub(crate) fn drive(loader: &mut ModuleLoader, mut mounted: bool) -> Vec<LoaderEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            for event in loader.poll(Instant::now(), mounted) {
                if matches!(event, LoaderEvent::Mount { .. }) {
                    mounted = true;
                }
                let done = !matches!(event, LoaderEvent::Mount { .. });
                seen.push(event);
                if done {
                    return seen;
                }
            }
            thread::sleep(Duration::from_millis(2));
        }
        seen
    }

    #[test]
    fn loads_markup_style_then_script() {
        let assets = Arc::new(MemoryAssets::default().with_module("module/folderdrive", "records"));
        let mut loader = ModuleLoader::new(&AppConfig::default(), assets.clone());
        let generation = loader.load(ModuleKind::Records.spec());

        let events = drive(&mut loader, false);
        assert!(matches!(&events[0], LoaderEvent::Mount { markup, .. } if markup.title == "Title records"));
        assert_eq!(
            events.last(),
            Some(&LoaderEvent::Activate { generation, kind: ModuleKind::Records })
        );
        let requests = assets.requests.lock().unwrap();
        assert!(requests.iter().any(|r| r.starts_with("module/folderdrive.js?t=")));
    }

    #[test]
    fn empty_style_is_a_load_error() {
        let mut assets = MemoryAssets::default().with_module("module/folderdrive", "records");
        assets.files.insert("module/folderdrive.css".into(), "  \n".into());
        let mut loader = ModuleLoader::new(&AppConfig::default(), Arc::new(assets));
        loader.load(ModuleKind::Records.spec());
        let events = drive(&mut loader, false);
        assert!(matches!(events.last(), Some(LoaderEvent::Failed { message, .. }) if message.contains("empty")));
        assert!(!loader.is_busy());
    }

    #[test]
    fn stale_completion_is_discarded() {
        let mut assets = MemoryAssets::default()
            .with_module("module/folderdrive", "records")
            .with_module("module/info/personal-data", "personal-data");
        assets
            .delay
            .insert("module/folderdrive.html".into(), Duration::from_millis(100));
        let mut loader = ModuleLoader::new(&AppConfig::default(), Arc::new(assets));

        loader.load(ModuleKind::Records.spec());
        let second = loader.load(ModuleKind::PersonalData.spec());
        let events = drive(&mut loader, false);
        assert_eq!(
            events.last(),
            Some(&LoaderEvent::Activate { generation: second, kind: ModuleKind::PersonalData })
        );

        // The slow first load finishes later and must not surface.
        thread::sleep(Duration::from_millis(150));
        assert!(loader.poll(Instant::now(), true).is_empty());
    }

    #[test]
    fn unmounted_markup_times_out() {
        let assets = Arc::new(MemoryAssets::default().with_module("module/folderdrive", "records"));
        let cfg = AppConfig::default()
            .with_loader_max_attempts(3)
            .with_loader_retry_interval(Duration::ZERO);
        let mut loader = ModuleLoader::new(&cfg, assets);
        loader.load(ModuleKind::Records.spec());

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut failed = None;
        while failed.is_none() && Instant::now() < deadline {
            failed = loader
                .poll(Instant::now(), false)
                .into_iter()
                .find(|e| matches!(e, LoaderEvent::Failed { .. }));
            thread::sleep(Duration::from_millis(1));
        }
        assert!(matches!(failed, Some(LoaderEvent::Failed { message, .. }) if message.contains("timed out")));
    }

    #[test]
    fn script_entry_and_styles_parse() {
        assert_eq!(
            ModuleKind::from_script("// drive\nentry = records\n").unwrap(),
            ModuleKind::Records
        );
        assert_eq!(
            ModuleKind::from_script("entry = change-password").unwrap(),
            ModuleKind::ChangePassword
        );
        assert_eq!(
            ModuleKind::ChangePassword.spec().script,
            "module/info/change-password.js"
        );
        assert!(ModuleKind::from_script("console.log(1)").is_err());

        let sheet = StyleSheet::parse("title: fg=cyan bold\nbad line\nrow: bg=#102030");
        assert_eq!(sheet.get("title"), Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD));
        assert_eq!(sheet.get("row"), Style::default().bg(Color::Rgb(0x10, 0x20, 0x30)));
        assert_eq!(sheet.get("missing"), Style::default());
    }
}
