use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};

use chrono::Utc;
use tracing::{debug, error, info, trace};

use crate::domain::FdError;

const CHUNK_SIZE: usize = 64 * 1024;

/// MIME type derived from the file extension.
pub fn detect_mime(path: &Path) -> Option<&'static str> {
    match path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_uppercase())
        .as_deref()
    {
        Some("JPG") | Some("JPEG") => Some("image/jpeg"),
        Some("PNG") => Some("image/png"),
        Some("PDF") => Some("application/pdf"),
        Some("TXT") | Some("TEXT") | Some("LOG") => Some("text/plain"),
        Some("CSV") => Some("text/csv"),
        Some("GIF") => Some("image/gif"),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredFile {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FileListing {
    Empty,
    Files(Vec<StoredFile>),
}

pub trait ObjectStore: Send + Sync {
    /// Store `data` at `path`, reporting `(bytes_transferred, total_bytes)` as it goes.
    fn put(
        &self,
        path: &str,
        data: &mut dyn Read,
        total: u64,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), FdError>;

    /// Object paths under `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, FdError>;

    /// Durable URL of the object at `path`.
    fn url(&self, path: &str) -> Result<String, FdError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Progress(u8),
    Done(String),
    Failed(String),
}

/// A validated file ready to be sent to the object store.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub source: PathBuf,
    pub destination: String,
    pub mime: &'static str,
}

impl UploadRequest {
    /// Check the selection against the MIME allow-list. No store call happens here.
    pub fn validate(
        source: &Path,
        folder: &str,
        allowed: &[String],
        stamp_ms: i64,
    ) -> Result<Self, FdError> {
        if source.as_os_str().is_empty() {
            return Err(FdError::Validation("Please select a file.".to_string()));
        }
        let mime = detect_mime(source)
            .filter(|m| allowed.iter().any(|a| a == m))
            .ok_or_else(|| {
                FdError::Validation("Only JPEG/PNG images or PDF files are allowed.".to_string())
            })?;
        if !source.is_file() {
            return Err(FdError::Validation(format!("{} is not a file.", source.display())));
        }
        let name = source
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| FdError::Validation("File name is not valid UTF-8.".to_string()))?;
        Ok(Self {
            source: source.to_path_buf(),
            destination: format!("{folder}{stamp_ms}_{name}"),
            mime,
        })
    }
}

fn percentage(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done as f64 / total as f64) * 100.0).round() as u8
}

/// Run the upload, emitting progress and then exactly one `Done` or `Failed` event.
pub fn run_upload(store: &dyn ObjectStore, request: &UploadRequest, events: &Sender<UploadEvent>) {
    let result = File::open(&request.source)
        .map_err(|e| FdError::Upload(e.to_string()))
        .and_then(|mut file| {
            let total = file.metadata().map(|m| m.len()).unwrap_or(0);
            let mut last = None;
            store.put(&request.destination, &mut file, total, &mut |done, total| {
                let pct = percentage(done, total);
                if last != Some(pct) {
                    last = Some(pct);
                    let _ = events.send(UploadEvent::Progress(pct));
                }
            })?;
            store.url(&request.destination)
        });

    let event = match result {
        Ok(url) => {
            info!("Uploaded {:?} to {}", request.source, request.destination);
            UploadEvent::Done(url)
        }
        Err(e) => {
            error!("Upload of {:?} failed: {e}", request.source);
            let message = match e {
                FdError::Upload(m) | FdError::Storage(m) => m,
                other => other.to_string(),
            };
            UploadEvent::Failed(message)
        }
    };
    let _ = events.send(event);
}

/// Validate and start an upload on the thread pool.
pub fn spawn_upload(
    store: Arc<dyn ObjectStore>,
    source: &Path,
    folder: &str,
    allowed: &[String],
) -> Result<Receiver<UploadEvent>, FdError> {
    let request = UploadRequest::validate(source, folder, allowed, Utc::now().timestamp_millis())?;
    let (tx, rx) = mpsc::channel();
    rayon::spawn(move || run_upload(store.as_ref(), &request, &tx));
    Ok(rx)
}

/// List the files under `prefix` on the thread pool.
pub fn spawn_list_files(store: Arc<dyn ObjectStore>, prefix: &str) -> Receiver<Result<FileListing, FdError>> {
    let (tx, rx) = mpsc::channel();
    let prefix = prefix.to_string();
    rayon::spawn(move || {
        let _ = tx.send(list_files(store.as_ref(), &prefix));
    });
    rx
}

/// List the files under `prefix` with their display name and URL.
pub fn list_files(store: &dyn ObjectStore, prefix: &str) -> Result<FileListing, FdError> {
    let paths = store.list(prefix)?;
    if paths.is_empty() {
        return Ok(FileListing::Empty);
    }
    let files = paths
        .iter()
        .map(|path| {
            Ok(StoredFile {
                name: path.strip_prefix(prefix).unwrap_or(path).to_string(),
                url: store.url(path)?,
            })
        })
        .collect::<Result<Vec<_>, FdError>>()?;
    Ok(FileListing::Files(files))
}

/// Object store rooted at a local directory. Object paths map to relative file paths.
#[derive(Debug)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, FdError> {
        let relative = Path::new(path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(FdError::Storage(format!("invalid object path {path:?}")));
        }
        Ok(self.root.join(relative))
    }
}

impl ObjectStore for FsObjectStore {
    fn put(
        &self,
        path: &str,
        data: &mut dyn Read,
        total: u64,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), FdError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| FdError::Upload(e.to_string()))?;
        }
        let mut out = File::create(&target).map_err(|e| FdError::Upload(e.to_string()))?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut done = 0u64;
        progress(0, total);
        loop {
            let n = data.read(&mut buf).map_err(|e| FdError::Upload(e.to_string()))?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])
                .map_err(|e| FdError::Upload(e.to_string()))?;
            done += n as u64;
            progress(done, total.max(done));
        }
        trace!("Wrote {} bytes to {:?}", done, target);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, FdError> {
        let dir = self.resolve(prefix.trim_end_matches('/'))?;
        if !dir.is_dir() {
            debug!("No objects under {}", prefix);
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| FdError::Storage(e.to_string()))? {
            let entry = entry.map_err(|e| FdError::Storage(e.to_string()))?;
            if entry.path().is_file()
                && let Some(name) = entry.file_name().to_str()
            {
                paths.push(format!("{prefix}{name}"));
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn url(&self, path: &str) -> Result<String, FdError> {
        let target = self.resolve(path)?;
        if !target.is_file() {
            return Err(FdError::Storage(format!("object {path} does not exist")));
        }
        let absolute = fs::canonicalize(&target).map_err(|e| FdError::Storage(e.to_string()))?;
        Ok(format!("file://{}", absolute.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn allowed() -> Vec<String> {
        crate::domain::AppConfig::default().allowed_mime_types
    }

    /// Store that records calls and always fails puts.
    #[derive(Default)]
    struct RejectingStore {
        calls: Mutex<usize>,
    }

    impl ObjectStore for RejectingStore {
        fn put(
            &self,
            _path: &str,
            _data: &mut dyn Read,
            total: u64,
            progress: &mut dyn FnMut(u64, u64),
        ) -> Result<(), FdError> {
            *self.calls.lock().unwrap() += 1;
            progress(0, total);
            Err(FdError::Upload("quota exceeded".into()))
        }

        fn list(&self, _prefix: &str) -> Result<Vec<String>, FdError> {
            *self.calls.lock().unwrap() += 1;
            Ok(Vec::new())
        }

        fn url(&self, _path: &str) -> Result<String, FdError> {
            Ok(String::new())
        }
    }

    #[test]
    fn plain_text_is_rejected_before_any_store_call() {
        let dir = tempfile::tempdir().unwrap();
        let txt = dir.path().join("notes.txt");
        fs::write(&txt, "hello").unwrap();

        let store = Arc::new(RejectingStore::default());
        let result = spawn_upload(store.clone(), &txt, "clinic_patients/ADM001/", &allowed());
        assert!(matches!(result, Err(FdError::Validation(_))));
        assert_eq!(*store.calls.lock().unwrap(), 0);
    }

    #[test]
    fn empty_selection_is_rejected() {
        let result = UploadRequest::validate(Path::new(""), "x/", &allowed(), 1);
        assert!(matches!(result, Err(FdError::Validation(m)) if m.contains("select")));
    }

    #[test]
    fn upload_reports_progress_and_url() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("consent.pdf");
        fs::write(&pdf, vec![7u8; CHUNK_SIZE * 2 + 10]).unwrap();
        let store = FsObjectStore::new(dir.path().join("bucket"));

        let request =
            UploadRequest::validate(&pdf, "hospital_patients/ADM001/", &allowed(), 42).unwrap();
        assert_eq!(request.destination, "hospital_patients/ADM001/42_consent.pdf");
        assert_eq!(request.mime, "application/pdf");

        let (tx, rx) = mpsc::channel();
        run_upload(&store, &request, &tx);
        let events: Vec<UploadEvent> = rx.try_iter().collect();
        assert_eq!(events.first(), Some(&UploadEvent::Progress(0)));
        assert!(events.contains(&UploadEvent::Progress(100)));
        assert!(matches!(events.last(), Some(UploadEvent::Done(url)) if url.starts_with("file://")));
    }

    #[test]
    fn failure_message_is_passed_through() {
        let dir = tempfile::tempdir().unwrap();
        let png = dir.path().join("scan.png");
        fs::write(&png, "png").unwrap();
        let request = UploadRequest::validate(&png, "a/", &allowed(), 1).unwrap();

        let (tx, rx) = mpsc::channel();
        run_upload(&RejectingStore::default(), &request, &tx);
        let events: Vec<UploadEvent> = rx.try_iter().collect();
        assert_eq!(events.last(), Some(&UploadEvent::Failed("quota exceeded".into())));
    }

    #[test]
    fn listing_is_empty_or_named() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        assert_eq!(list_files(&store, "clinic_patients/ADM9/").unwrap(), FileListing::Empty);

        let folder = dir.path().join("clinic_patients/ADM9");
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("1_b.pdf"), "b").unwrap();
        fs::write(folder.join("0_a.png"), "a").unwrap();

        let FileListing::Files(files) = list_files(&store, "clinic_patients/ADM9/").unwrap() else {
            panic!("expected files");
        };
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["0_a.png", "1_b.pdf"]);

        let rx = spawn_list_files(Arc::new(store), "clinic_patients/ADM9/");
        let listing = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap().unwrap();
        assert!(matches!(listing, FileListing::Files(f) if f.len() == 2));
    }

    #[test]
    fn paths_cannot_escape_the_root() {
        let store = FsObjectStore::new("/tmp/bucket");
        assert!(matches!(store.url("../etc/passwd"), Err(FdError::Storage(_))));
    }
}
