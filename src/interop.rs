//! Host-facing entry point of the bridge.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::runtime::Handle;
use tracing::{debug, warn};
use url::Url;

use crate::callback::{CallbackRegistry, SweepTimer};
use crate::config::BridgeConfig;
use crate::diagnostics::{ErrorReporter, ErrorReportingStore, TracingReporter};
use crate::error::BridgeError;
use crate::handler::{HostDispatcher, ScriptExecutionHandler};
use crate::ids::ReferenceIdGenerator;
use crate::loader::{FileLoadCoordinator, LocalFileFetcher, ResourceFetcher, ScriptTagFetcher};
use crate::marshal::{string_literal, RemoteObjectRef, ScriptValue, ValueMarshaler};
use crate::pending::{self, CommandBuffer};
use crate::runtime_js::NO_ERROR_ID;

/// How `Interop::execute` runs a script.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Queue the script and return without waiting for the engine.
    pub run_async: bool,
    /// Run synchronously without flushing queued commands first.
    pub no_impact_on_pending: bool,
}

impl ExecuteOptions {
    pub fn sync() -> Self {
        Self::default()
    }

    pub fn asynchronous() -> Self {
        Self {
            run_async: true,
            no_impact_on_pending: false,
        }
    }

    pub fn unbuffered() -> Self {
        Self {
            run_async: false,
            no_impact_on_pending: true,
        }
    }

    fn validate(self) -> Result<(), BridgeError> {
        if self.run_async && self.no_impact_on_pending {
            return Err(BridgeError::ConflictingOptions);
        }
        Ok(())
    }
}

/// Outcome of [`Interop::execute`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptResult {
    /// Decoded result. Always null for asynchronous calls.
    pub value: ScriptValue,
    /// Where the engine published the result for later calls.
    pub reference: RemoteObjectRef,
}

/// Where the file loader gets its files from.
pub enum FetcherKind {
    /// Append `<script>`/`<link>` tags to the document.
    ScriptTags,
    /// Read `file://` URLs from disk and evaluate them directly.
    LocalFiles,
    Custom(Arc<dyn ResourceFetcher>),
}

pub struct InteropBuilder {
    config: BridgeConfig,
    handler: Arc<dyn ScriptExecutionHandler>,
    reporter: Arc<dyn ErrorReporter>,
    base_url: Option<Url>,
    fetcher: FetcherKind,
}

impl InteropBuilder {
    pub fn reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Base against which relative file paths are resolved. `file:///` by
    /// default.
    pub fn base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }

    pub fn fetcher(mut self, fetcher: FetcherKind) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn build(self) -> Result<Arc<Interop>, BridgeError> {
        let commands = pending::build(&self.config, self.handler)?;
        let callbacks = CallbackRegistry::new(Arc::clone(&commands));
        let fetcher: Arc<dyn ResourceFetcher> = match self.fetcher {
            FetcherKind::ScriptTags => Arc::new(ScriptTagFetcher::new(
                Arc::clone(&callbacks),
                Arc::clone(&commands),
            )),
            FetcherKind::LocalFiles => Arc::new(LocalFileFetcher::new(Arc::clone(&commands))),
            FetcherKind::Custom(fetcher) => fetcher,
        };
        let base_url = match self.base_url {
            Some(base_url) => base_url,
            None => Url::parse("file:///")?,
        };

        debug!(
            target: "interop",
            strategy = self.config.strategy.name(),
            error_reporting = self.config.enable_error_reporting,
            "interop ready"
        );
        Ok(Arc::new(Interop {
            marshaler: ValueMarshaler::new(Arc::clone(&callbacks)),
            loader: FileLoadCoordinator::new(base_url, fetcher),
            config: self.config,
            commands,
            callbacks,
            reference_ids: ReferenceIdGenerator::new(),
            error_store: ErrorReportingStore::new(),
            reporter: self.reporter,
            sweeper: Mutex::new(None),
        }))
    }
}

pub struct Interop {
    config: BridgeConfig,
    commands: Arc<dyn CommandBuffer>,
    callbacks: Arc<CallbackRegistry>,
    marshaler: ValueMarshaler,
    reference_ids: ReferenceIdGenerator,
    error_store: ErrorReportingStore,
    reporter: Arc<dyn ErrorReporter>,
    loader: FileLoadCoordinator,
    sweeper: Mutex<Option<SweepTimer>>,
}

impl Interop {
    pub fn builder(config: BridgeConfig, handler: Arc<dyn ScriptExecutionHandler>) -> InteropBuilder {
        InteropBuilder {
            config,
            handler,
            reporter: Arc::new(TracingReporter),
            base_url: None,
            fetcher: FetcherKind::ScriptTags,
        }
    }

    pub fn new(
        config: BridgeConfig,
        handler: Arc<dyn ScriptExecutionHandler>,
    ) -> Result<Arc<Self>, BridgeError> {
        Self::builder(config, handler).build()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.callbacks
    }

    pub fn commands(&self) -> &Arc<dyn CommandBuffer> {
        &self.commands
    }

    pub fn marshaler(&self) -> &ValueMarshaler {
        &self.marshaler
    }

    pub fn loader(&self) -> &FileLoadCoordinator {
        &self.loader
    }

    /// Start the periodic callback sweep on `tokio_handle`. Restarting
    /// replaces the previous timer.
    pub fn start_sweeper(&self, tokio_handle: &Handle) {
        let timer = SweepTimer::start(
            tokio_handle,
            Arc::downgrade(&self.callbacks),
            self.config.sweep_interval(),
        );
        *self.sweeper.lock() = Some(timer);
    }

    pub fn stop_sweeper(&self) {
        self.sweeper.lock().take();
    }

    /// Substitute `$0..$n` with the marshaled `args`. The longest placeholder
    /// naming an existing argument wins, so `$10` is never read as `$1`
    /// followed by `0`. Substituted text is not scanned again.
    pub fn format_script(&self, script: &str, args: &[ScriptValue]) -> String {
        if args.is_empty() {
            return script.to_string();
        }

        let mut formatted = String::with_capacity(script.len());
        let mut rest = script;
        while let Some(pos) = rest.find('$') {
            formatted.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];
            let digits = after.bytes().take_while(|b| b.is_ascii_digit()).count();
            let placeholder = (1..=digits).rev().find_map(|len| {
                if len > 1 && after.starts_with('0') {
                    return None;
                }
                after[..len]
                    .parse::<usize>()
                    .ok()
                    .filter(|index| *index < args.len())
                    .map(|index| (len, index))
            });
            match placeholder {
                Some((len, index)) => {
                    formatted.push_str(&self.marshaler.to_expression(&args[index]));
                    rest = &after[len..];
                }
                None => {
                    formatted.push('$');
                    rest = after;
                }
            }
        }
        formatted.push_str(rest);
        formatted
    }

    /// Run `script` and publish its result under a fresh reference id.
    pub fn execute(
        &self,
        script: &str,
        args: &[ScriptValue],
        options: ExecuteOptions,
    ) -> Result<ScriptResult, BridgeError> {
        options.validate()?;

        let code = self.format_script(script, args);
        let error_id = if self.config.enable_error_reporting {
            Some(self.error_store.record(&code))
        } else {
            None
        };
        let reference_id = self.reference_ids.new_id() as i64;
        let wrapped = format!(
            "document.callScriptSafe(\"{reference_id}\",{},{})",
            string_literal(&code),
            error_id.map_or(NO_ERROR_ID, |id| id as i64),
        );
        if self.config.interop_logging {
            debug!(target: "interop", reference_id, run_async = options.run_async, "execute\n{code}");
        }

        if options.run_async {
            self.commands.submit(&wrapped);
            return Ok(ScriptResult {
                value: ScriptValue::Null,
                reference: RemoteObjectRef::new(reference_id),
            });
        }

        let raw = if options.no_impact_on_pending {
            self.commands.execute_unbuffered(&wrapped)
        } else {
            self.commands.submit_and_execute(&wrapped)
        };
        if let Some(error_id) = error_id {
            self.error_store.forget(error_id);
        }

        let value = self.marshaler.from_script_result(&raw?, Some(reference_id));
        let reference = value
            .as_remote()
            .copied()
            .unwrap_or_else(|| RemoteObjectRef::new(reference_id));
        Ok(ScriptResult { value, reference })
    }

    /// Queue `script` as is: no result publication, no error correlation.
    pub fn execute_fast_async(&self, script: &str, args: &[ScriptValue]) {
        let code = self.format_script(script, args);
        self.commands.submit(&code);
    }

    /// Send every queued command to the engine.
    pub fn flush(&self) {
        self.commands.drain();
    }

    pub fn to_expression(&self, value: &ScriptValue) -> String {
        self.marshaler.to_expression(value)
    }

    /// Forget loaded files, e.g. when the application is reloaded.
    pub fn reset(&self) {
        self.loader.reset();
    }

    /// Calls recorded for error correlation that have not completed yet.
    pub fn pending_call_records(&self) -> usize {
        self.error_store.len()
    }

    pub fn downgrade_dispatcher(self: &Arc<Self>) -> Weak<dyn HostDispatcher> {
        let dispatcher: Arc<dyn HostDispatcher> = Arc::clone(self) as Arc<dyn HostDispatcher>;
        Arc::downgrade(&dispatcher)
    }
}

impl HostDispatcher for Interop {
    fn dispatch_callback(&self, id: u64, args: Vec<JsonValue>, expects_result: bool) -> JsonValue {
        let args = self.marshaler.decode_arguments(&args);
        match self.callbacks.invoke(id, &args) {
            Some(value) if expects_result => self.marshaler.to_wire(&value),
            _ => JsonValue::Null,
        }
    }

    fn report_script_error(&self, error_id: u64, message: &str) {
        match self.error_store.resolve(error_id, message) {
            Some(diagnostic) => self.reporter.report(&diagnostic),
            None => warn!(target: "interop", error_id, message, "script error for unknown call"),
        }
    }

    fn release_call_record(&self, error_id: u64) {
        self.error_store.forget(error_id);
    }
}

impl Drop for Interop {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferStrategy;
    use crate::diagnostics::ScriptDiagnostic;
    use crate::handler::RecordingHandler;
    use crate::marshal::DomElementRef;
    use serde_json::json;

    #[derive(Default)]
    struct CollectingReporter {
        reports: Mutex<Vec<ScriptDiagnostic>>,
    }

    impl ErrorReporter for CollectingReporter {
        fn report(&self, diagnostic: &ScriptDiagnostic) {
            self.reports.lock().push(diagnostic.clone());
        }
    }

    fn interop_with(
        config: BridgeConfig,
        handler: Arc<RecordingHandler>,
    ) -> (Arc<CollectingReporter>, Arc<Interop>) {
        let reporter = Arc::new(CollectingReporter::default());
        let interop = Interop::builder(config, handler)
            .reporter(reporter.clone())
            .build()
            .unwrap();
        (reporter, interop)
    }

    fn joined() -> BridgeConfig {
        BridgeConfig {
            strategy: BufferStrategy::Joined,
            ..BridgeConfig::default()
        }
    }

    #[test]
    fn placeholders_take_the_longest_existing_index() {
        let (_, interop) = interop_with(joined(), Arc::new(RecordingHandler::new()));
        let args: Vec<ScriptValue> = (0..11i32).map(ScriptValue::from).collect();
        assert_eq!(interop.format_script("f($10, $1, $0)", &args), "f(10, 1, 0)");

        let two = [ScriptValue::from("a"), ScriptValue::from(2i32)];
        assert_eq!(interop.format_script("g($10)", &two), "g(20)");
        assert_eq!(interop.format_script("cost: $5 and $", &two), "cost: $5 and $");
        assert_eq!(
            interop.format_script("h($0)", &[ScriptValue::from("$1")]),
            r#"h("$1")"#
        );
    }

    #[test]
    fn placeholders_marshal_references() {
        let (_, interop) = interop_with(joined(), Arc::new(RecordingHandler::new()));
        let script = interop.format_script(
            "$0.appendChild($1)",
            &[
                RemoteObjectRef::new(3).into(),
                DomElementRef::new("id7").into(),
            ],
        );
        assert_eq!(
            script,
            r#"document.jsObjRef["3"].appendChild(document.getElementByIdSafe("id7"))"#
        );
    }

    #[test]
    fn conflicting_options_are_rejected() {
        let handler = Arc::new(RecordingHandler::new());
        let (_, interop) = interop_with(joined(), handler.clone());
        let options = ExecuteOptions {
            run_async: true,
            no_impact_on_pending: true,
        };
        assert!(matches!(
            interop.execute("x()", &[], options),
            Err(BridgeError::ConflictingOptions)
        ));
        assert!(handler.scripts().is_empty());
    }

    #[test]
    fn sync_execute_wraps_and_decodes() {
        let handler = Arc::new(RecordingHandler::with_responder(|_| Ok(json!(3.5))));
        let (_, interop) = interop_with(joined(), handler.clone());
        let result = interop.execute("$0 + 1", &[2.5.into()], ExecuteOptions::sync()).unwrap();
        assert_eq!(result.value, ScriptValue::Number(3.5));

        let script = &handler.scripts()[0];
        let reference_id = result.reference.reference_id();
        assert_eq!(
            script,
            &format!("document.callScriptSafe(\"{reference_id}\",\"2.5 + 1\",1);\n")
        );
        assert_eq!(interop.pending_call_records(), 0);
    }

    #[test]
    fn object_results_become_references() {
        let handler = Arc::new(RecordingHandler::with_responder(|_| Ok(json!([]))));
        let (_, interop) = interop_with(joined(), handler);
        let result = interop.execute("[1, 2]", &[], ExecuteOptions::sync()).unwrap();
        let reference = result.value.as_remote().copied().unwrap();
        assert!(reference.is_array());
        assert_eq!(reference, result.reference);
        assert_eq!(
            interop.to_expression(&reference.element(1).into()),
            format!("document.jsObjRef[\"{}\"][1]", reference.reference_id())
        );
    }

    #[test]
    fn async_execute_queues_until_flush() {
        let handler = Arc::new(RecordingHandler::new());
        let config = BridgeConfig {
            enable_error_reporting: false,
            ..joined()
        };
        let (_, interop) = interop_with(config, handler.clone());
        let result = interop.execute("a()", &[], ExecuteOptions::asynchronous()).unwrap();
        assert!(result.value.is_null());
        interop.execute_fast_async("b($0)", &[true.into()]);
        assert!(handler.scripts().is_empty());

        interop.flush();
        let reference_id = result.reference.reference_id();
        assert_eq!(
            handler.scripts(),
            vec![format!(
                "document.callScriptSafe(\"{reference_id}\",\"a()\",-1);\nb(true);\n"
            )]
        );
    }

    #[test]
    fn unbuffered_execute_leaves_queue() {
        let handler = Arc::new(RecordingHandler::new());
        let (_, interop) = interop_with(joined(), handler.clone());
        interop.execute_fast_async("queued()", &[]);
        interop.execute("probe()", &[], ExecuteOptions::unbuffered()).unwrap();
        assert_eq!(handler.scripts().len(), 1);
        assert!(interop.commands().has_pending());
    }

    #[test]
    fn script_error_reports_original_command() {
        let handler = Arc::new(RecordingHandler::new());
        let (reporter, interop) = interop_with(joined(), handler);
        interop
            .execute("missing($0)", &["x".into()], ExecuteOptions::asynchronous())
            .unwrap();
        assert_eq!(interop.pending_call_records(), 1);

        interop.report_script_error(1, "ReferenceError: missing is not defined");
        let reports = reporter.reports.lock().clone();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].command, r#"missing("x")"#);
        assert_eq!(interop.pending_call_records(), 0);

        interop.report_script_error(1, "again");
        assert_eq!(reporter.reports.lock().len(), 1);
    }

    #[test]
    fn dispatch_decodes_arguments_and_encodes_result() {
        let (_, interop) = interop_with(joined(), Arc::new(RecordingHandler::new()));
        let handle = interop.callbacks().create_strong(
            |args| match args {
                [ScriptValue::RemoteObject(reference), ScriptValue::Number(n)] => {
                    ScriptValue::from(format!("{}:{}", reference.reference_id(), n))
                }
                _ => ScriptValue::Null,
            },
            crate::callback::ReturnKind::Value,
        );
        let result = interop.dispatch_callback(
            handle.id(),
            vec![json!({ "__jsRef": -1, "isArray": false }), json!(4)],
            true,
        );
        assert_eq!(result, json!("-1:4"));
        assert_eq!(interop.dispatch_callback(999, Vec::new(), true), JsonValue::Null);
    }
}
