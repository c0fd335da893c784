//! Loading of external script and stylesheet files.
//!
//! Requests are keyed by their normalised URL. Concurrent requests for the
//! same file share one fetch; files that loaded once short-circuit.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::fs;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use url::Url;

use crate::callback::{CallbackHandle, CallbackRegistry};
use crate::marshal::{callback_expression, string_literal};
use crate::pending::CommandBuffer;

pub type Continuation = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Script,
    Stylesheet,
}

impl ResourceKind {
    fn name(self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Stylesheet => "stylesheet",
        }
    }
}

type LoadKey = (ResourceKind, String);

struct Waiter {
    on_success: Continuation,
    on_failure: Continuation,
}

#[derive(Default)]
struct LoadTable {
    pending: HashMap<LoadKey, Vec<Waiter>>,
    loaded: HashSet<LoadKey>,
    /// Bumped by `reset` so completions of abandoned fetches are ignored.
    generation: u64,
}

/// Starts the actual fetch of a resource.
///
/// Implementations must eventually consume `completion` exactly once, either
/// from inside `fetch` or later from any thread.
pub trait ResourceFetcher: Send + Sync {
    fn fetch(&self, kind: ResourceKind, url: &str, completion: LoadCompletion);
}

/// Completion token for one in-flight fetch.
pub struct LoadCompletion {
    table: Arc<Mutex<LoadTable>>,
    key: LoadKey,
    generation: u64,
}

impl fmt::Debug for LoadCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadCompletion")
            .field("kind", &self.key.0)
            .field("url", &self.key.1)
            .finish()
    }
}

impl LoadCompletion {
    pub fn url(&self) -> &str {
        &self.key.1
    }

    pub fn kind(&self) -> ResourceKind {
        self.key.0
    }

    pub fn succeed(self) {
        self.finish(true);
    }

    pub fn fail(self) {
        self.finish(false);
    }

    fn finish(self, success: bool) {
        let waiters = {
            let mut table = self.table.lock();
            if table.generation != self.generation {
                debug!(target: "file_load", url = %self.key.1, "completion after reset ignored");
                return;
            }
            let Some(waiters) = table.pending.remove(&self.key) else {
                return;
            };
            if success {
                table.loaded.insert(self.key.clone());
            }
            waiters
        };

        debug!(
            target: "file_load",
            kind = self.key.0.name(),
            url = %self.key.1,
            success,
            waiters = waiters.len(),
            "load finished"
        );
        for waiter in waiters {
            if success {
                (waiter.on_success)();
            } else {
                (waiter.on_failure)();
            }
        }
    }
}

#[derive(Clone)]
pub struct FileLoadCoordinator {
    base: Url,
    fetcher: Arc<dyn ResourceFetcher>,
    table: Arc<Mutex<LoadTable>>,
}

impl FileLoadCoordinator {
    /// Relative paths are resolved against `base`.
    pub fn new(base: Url, fetcher: Arc<dyn ResourceFetcher>) -> Self {
        Self {
            base,
            fetcher,
            table: Arc::new(Mutex::new(LoadTable::default())),
        }
    }

    /// Different spellings of the same file map to one key.
    pub fn normalize(&self, path: &str) -> Result<String> {
        let resolved = self
            .base
            .join(path)
            .with_context(|| format!("failed to resolve {} relative to {}", path, self.base))?;
        Ok(resolved.to_string())
    }

    pub fn load<S, F>(&self, path: &str, on_success: S, on_failure: F)
    where
        S: FnOnce() + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.load_kind(
            ResourceKind::Script,
            path,
            Box::new(on_success),
            Box::new(on_failure),
        );
    }

    /// Load `paths` one after another. The first failure abandons the rest.
    pub fn load_many<C, E>(&self, paths: Vec<String>, on_completed: C, on_error: E)
    where
        C: FnOnce() + Send + 'static,
        E: FnOnce() + Send + 'static,
    {
        self.load_chain(
            ResourceKind::Script,
            paths.into(),
            Box::new(on_completed),
            Arc::new(Mutex::new(Some(Box::new(on_error) as Continuation))),
        );
    }

    /// `on_loaded` runs once the stylesheet request settles, whatever the
    /// outcome.
    pub fn load_css<F>(&self, path: &str, on_loaded: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let (on_success, on_failure) = either_once(Box::new(on_loaded));
        self.load_kind(ResourceKind::Stylesheet, path, on_success, on_failure);
    }

    pub fn load_css_many<C>(&self, paths: Vec<String>, on_completed: C)
    where
        C: FnOnce() + Send + 'static,
    {
        let (on_success, on_failure) = either_once(Box::new(on_completed));
        self.load_chain(
            ResourceKind::Stylesheet,
            paths.into(),
            on_success,
            Arc::new(Mutex::new(Some(on_failure))),
        );
    }

    pub fn is_loaded(&self, kind: ResourceKind, path: &str) -> bool {
        let Ok(url) = self.normalize(path) else {
            return false;
        };
        self.table.lock().loaded.contains(&(kind, url))
    }

    /// Forget every loaded and pending file. Continuations of fetches still in
    /// flight are dropped without running.
    pub fn reset(&self) {
        let mut table = self.table.lock();
        table.pending.clear();
        table.loaded.clear();
        table.generation += 1;
        debug!(target: "file_load", "load tables reset");
    }

    fn load_chain(
        &self,
        kind: ResourceKind,
        mut remaining: VecDeque<String>,
        on_completed: Continuation,
        on_error: Arc<Mutex<Option<Continuation>>>,
    ) {
        let Some(next) = remaining.pop_front() else {
            on_completed();
            return;
        };
        let coordinator = self.clone();
        let abort = Arc::clone(&on_error);
        self.load_kind(
            kind,
            &next,
            Box::new(move || coordinator.load_chain(kind, remaining, on_completed, on_error)),
            Box::new(move || {
                if let Some(on_error) = abort.lock().take() {
                    on_error();
                }
            }),
        );
    }

    fn load_kind(
        &self,
        kind: ResourceKind,
        path: &str,
        on_success: Continuation,
        on_failure: Continuation,
    ) {
        let url = match self.normalize(path) {
            Ok(url) => url,
            Err(err) => {
                warn!(target: "file_load", path, error = %err, "cannot load file");
                on_failure();
                return;
            }
        };
        let key = (kind, url);

        let generation = {
            let mut table = self.table.lock();
            if table.loaded.contains(&key) {
                drop(table);
                trace!(target: "file_load", url = %key.1, "already loaded");
                on_success();
                return;
            }
            if let Some(waiters) = table.pending.get_mut(&key) {
                waiters.push(Waiter {
                    on_success,
                    on_failure,
                });
                trace!(target: "file_load", url = %key.1, "joined pending load");
                return;
            }
            table.pending.insert(
                key.clone(),
                vec![Waiter {
                    on_success,
                    on_failure,
                }],
            );
            table.generation
        };

        debug!(target: "file_load", kind = kind.name(), url = %key.1, "starting load");
        let url = key.1.clone();
        self.fetcher.fetch(
            kind,
            &url,
            LoadCompletion {
                table: Arc::clone(&self.table),
                key,
                generation,
            },
        );
    }
}

/// Two continuations sharing one action; whichever runs first runs it.
fn either_once(action: Continuation) -> (Continuation, Continuation) {
    let slot = Arc::new(Mutex::new(Some(action)));
    let other = Arc::clone(&slot);
    (
        Box::new(move || {
            if let Some(action) = slot.lock().take() {
                action();
            }
        }),
        Box::new(move || {
            if let Some(action) = other.lock().take() {
                action();
            }
        }),
    )
}

/// Loads files by appending `<script>`/`<link>` tags to the document head.
/// Completion is signalled back through one-shot callbacks.
pub struct ScriptTagFetcher {
    callbacks: Arc<CallbackRegistry>,
    commands: Arc<dyn CommandBuffer>,
}

impl ScriptTagFetcher {
    pub fn new(callbacks: Arc<CallbackRegistry>, commands: Arc<dyn CommandBuffer>) -> Self {
        Self {
            callbacks,
            commands,
        }
    }
}

impl ResourceFetcher for ScriptTagFetcher {
    fn fetch(&self, kind: ResourceKind, url: &str, completion: LoadCompletion) {
        let completion = Arc::new(Mutex::new(Some(completion)));
        let handles: Arc<Mutex<Vec<Arc<CallbackHandle>>>> = Arc::new(Mutex::new(Vec::new()));

        let settle = |success: bool| {
            let completion = Arc::clone(&completion);
            let handles = Arc::clone(&handles);
            self.callbacks.create_self_disposing(move |_| {
                for handle in handles.lock().drain(..) {
                    handle.dispose();
                }
                if let Some(completion) = completion.lock().take() {
                    if success {
                        completion.succeed();
                    } else {
                        completion.fail();
                    }
                }
            })
        };
        let on_load = settle(true);
        let on_error = settle(false);
        handles.lock().extend([Arc::clone(&on_load), Arc::clone(&on_error)]);

        let src = string_literal(url);
        let on_load = callback_expression(&on_load);
        let on_error = callback_expression(&on_error);
        let script = match kind {
            ResourceKind::Script => format!(
                "(function() {{\n\
                 try {{\n\
                 var head = document.getElementsByTagName('head')[0];\n\
                 var script = document.createElement('script');\n\
                 script.type = 'text/javascript';\n\
                 script.src = {src};\n\
                 script.onload = {on_load};\n\
                 script.onerror = {on_error};\n\
                 head.appendChild(script);\n\
                 }} catch (e) {{\n\
                 {on_error}();\n\
                 }}\n\
                 }})()",
            ),
            // `link` has no reliable load event; an `img` pointed at the same
            // URL always fires `onerror` once the request settles.
            ResourceKind::Stylesheet => format!(
                "(function() {{\n\
                 try {{\n\
                 var head = document.getElementsByTagName('head')[0];\n\
                 var link = document.createElement('link');\n\
                 link.rel = 'stylesheet';\n\
                 link.type = 'text/css';\n\
                 link.href = {src};\n\
                 link.media = 'all';\n\
                 head.appendChild(link);\n\
                 var img = document.createElement('img');\n\
                 img.onerror = {on_load};\n\
                 img.src = {src};\n\
                 }} catch (e) {{\n\
                 {on_error}();\n\
                 }}\n\
                 }})()",
            ),
        };
        self.commands.submit(&script);
    }
}

/// Reads `file://` scripts from disk and evaluates them directly. Used where
/// the engine has no document to attach tags to.
pub struct LocalFileFetcher {
    commands: Arc<dyn CommandBuffer>,
}

impl LocalFileFetcher {
    pub fn new(commands: Arc<dyn CommandBuffer>) -> Self {
        Self { commands }
    }

    fn read(url: &str) -> Result<String> {
        let parsed = Url::parse(url).with_context(|| format!("invalid file URL: {url}"))?;
        let path = parsed
            .to_file_path()
            .map_err(|_| anyhow!("not a local file: {url}"))?;
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))
    }
}

impl ResourceFetcher for LocalFileFetcher {
    fn fetch(&self, kind: ResourceKind, url: &str, completion: LoadCompletion) {
        if kind == ResourceKind::Stylesheet {
            trace!(target: "file_load", url, "stylesheets have no effect without a document");
            completion.succeed();
            return;
        }

        // Queued commands go first and on their own, so a file that fails to
        // parse only fails its own load.
        let outcome = Self::read(url).and_then(|source| {
            self.commands.drain();
            self.commands
                .execute_unbuffered(&source)
                .map(|_| ())
                .map_err(|err| anyhow!(err))
        });
        match outcome {
            Ok(()) => completion.succeed(),
            Err(err) => {
                warn!(target: "file_load", url, error = %err, "failed to load script");
                completion.fail();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Holds completions until the test settles them.
    #[derive(Default)]
    struct ManualFetcher {
        started: Mutex<Vec<LoadCompletion>>,
        fetches: AtomicUsize,
    }

    impl ResourceFetcher for ManualFetcher {
        fn fetch(&self, _kind: ResourceKind, _url: &str, completion: LoadCompletion) {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.started.lock().push(completion);
        }
    }

    impl ManualFetcher {
        fn settle_next(&self, success: bool) -> String {
            let completion = self.started.lock().remove(0);
            let url = completion.url().to_string();
            if success {
                completion.succeed();
            } else {
                completion.fail();
            }
            url
        }
    }

    fn coordinator() -> (Arc<ManualFetcher>, FileLoadCoordinator) {
        let fetcher = Arc::new(ManualFetcher::default());
        let base = Url::parse("https://app.example/index.html").unwrap();
        (fetcher.clone(), FileLoadCoordinator::new(base, fetcher))
    }

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let bump = Arc::clone(&count);
        (count, move || {
            bump.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn normalizes_relative_spellings() {
        let (_, coordinator) = coordinator();
        assert_eq!(
            coordinator.normalize("./lib/a.js").unwrap(),
            "https://app.example/lib/a.js"
        );
        assert_eq!(
            coordinator.normalize("/lib/../lib/a.js").unwrap(),
            "https://app.example/lib/a.js"
        );
    }

    #[test]
    fn concurrent_requests_share_one_fetch() {
        let (fetcher, coordinator) = coordinator();
        let (first, on_first) = counter();
        let (second, on_second) = counter();
        coordinator.load("lib/a.js", on_first, || {});
        coordinator.load("./lib/a.js", on_second, || {});
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);

        fetcher.settle_next(true);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        let (third, on_third) = counter();
        coordinator.load("lib/a.js", on_third, || {});
        assert_eq!(third.load(Ordering::SeqCst), 1);
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);
        assert!(coordinator.is_loaded(ResourceKind::Script, "lib/a.js"));
    }

    #[test]
    fn failure_notifies_every_waiter_and_allows_retry() {
        let (fetcher, coordinator) = coordinator();
        let (failures, on_failure) = counter();
        let (more_failures, on_more_failure) = counter();
        coordinator.load("a.js", || {}, on_failure);
        coordinator.load("a.js", || {}, on_more_failure);
        fetcher.settle_next(false);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(more_failures.load(Ordering::SeqCst), 1);
        assert!(!coordinator.is_loaded(ResourceKind::Script, "a.js"));

        coordinator.load("a.js", || {}, || {});
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn load_many_stops_at_first_failure() {
        let (fetcher, coordinator) = coordinator();
        let (completed, on_completed) = counter();
        let (errors, on_error) = counter();
        coordinator.load_many(vec!["a.js".into(), "b.js".into()], on_completed, on_error);

        let url = fetcher.settle_next(false);
        assert_eq!(url, "https://app.example/a.js");
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(completed.load(Ordering::SeqCst), 0);
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);
        assert!(fetcher.started.lock().is_empty());
    }

    #[test]
    fn load_many_runs_in_order() {
        let (fetcher, coordinator) = coordinator();
        let (completed, on_completed) = counter();
        coordinator.load_many(vec!["a.js".into(), "b.js".into()], on_completed, || {});

        assert_eq!(fetcher.settle_next(true), "https://app.example/a.js");
        assert_eq!(completed.load(Ordering::SeqCst), 0);
        assert_eq!(fetcher.settle_next(true), "https://app.example/b.js");
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_load_many_completes_immediately() {
        let (_, coordinator) = coordinator();
        let (completed, on_completed) = counter();
        coordinator.load_many(Vec::new(), on_completed, || {});
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn css_completion_fires_on_either_outcome() {
        let (fetcher, coordinator) = coordinator();
        let (loaded, on_loaded) = counter();
        coordinator.load_css("theme.css", on_loaded);
        fetcher.settle_next(false);
        assert_eq!(loaded.load(Ordering::SeqCst), 1);

        let (all, on_all) = counter();
        coordinator.load_css_many(vec!["a.css".into(), "b.css".into()], on_all);
        fetcher.settle_next(true);
        fetcher.settle_next(true);
        assert_eq!(all.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reset_drops_in_flight_completions() {
        let (fetcher, coordinator) = coordinator();
        let (loaded, on_loaded) = counter();
        coordinator.load("a.js", on_loaded, || {});
        coordinator.reset();
        fetcher.settle_next(true);
        assert_eq!(loaded.load(Ordering::SeqCst), 0);
        assert!(!coordinator.is_loaded(ResourceKind::Script, "a.js"));
    }
}
