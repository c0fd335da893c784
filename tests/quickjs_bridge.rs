#![cfg(feature = "quickjs")]

use std::sync::{Arc, Weak};

use htmlbridge::diagnostics::{ErrorReporter, ScriptDiagnostic};
use htmlbridge::interop::{FetcherKind, ScriptResult};
use htmlbridge::js::QuickJsHandler;
use htmlbridge::loader::ResourceKind;
use htmlbridge::{
    BridgeConfig, BridgeError, BufferStrategy, ExecuteOptions, ExecutionError, Interop,
    ReturnKind, ScriptValue,
};
use parking_lot::Mutex;
use url::Url;

#[derive(Default)]
struct CollectingReporter {
    reports: Mutex<Vec<ScriptDiagnostic>>,
}

impl ErrorReporter for CollectingReporter {
    fn report(&self, diagnostic: &ScriptDiagnostic) {
        self.reports.lock().push(diagnostic.clone());
    }
}

fn bridge_with(
    config: BridgeConfig,
    fetcher: FetcherKind,
    base: Option<Url>,
) -> (Arc<CollectingReporter>, Arc<Interop>) {
    let handler = Arc::new(QuickJsHandler::new().expect("engine"));
    let reporter = Arc::new(CollectingReporter::default());
    let mut builder = Interop::builder(config, handler.clone())
        .reporter(reporter.clone())
        .fetcher(fetcher);
    if let Some(base) = base {
        builder = builder.base_url(base);
    }
    let interop = builder.build().expect("interop");
    handler.set_dispatcher(interop.downgrade_dispatcher());
    (reporter, interop)
}

fn bridge(strategy: BufferStrategy) -> (Arc<CollectingReporter>, Arc<Interop>) {
    let config = BridgeConfig {
        strategy,
        ..BridgeConfig::default()
    };
    bridge_with(config, FetcherKind::ScriptTags, None)
}

fn run(interop: &Interop, script: &str, args: &[ScriptValue]) -> ScriptResult {
    interop
        .execute(script, args, ExecuteOptions::sync())
        .expect("execute")
}

#[test]
fn primitives_round_trip_through_the_engine() {
    let (_, interop) = bridge(BufferStrategy::Text);
    for value in [
        ScriptValue::Number(3.5),
        ScriptValue::Number(-0.25),
        ScriptValue::from("a\"b"),
        ScriptValue::from("tab\tand ünïcødé"),
        ScriptValue::Bool(true),
        ScriptValue::Null,
    ] {
        assert_eq!(run(&interop, "$0", &[value.clone()]).value, value);
    }
}

#[test]
fn results_are_published_as_references() {
    let (_, interop) = bridge(BufferStrategy::Bytes);
    let list = run(&interop, "[10, 20, 30]", &[]).value;
    let reference = *list.as_remote().expect("array reference");
    assert!(reference.is_array());

    assert_eq!(run(&interop, "$0.length", &[list.clone()]).value, ScriptValue::Number(3.0));
    assert_eq!(
        run(&interop, "$0", &[reference.element(1).into()]).value,
        ScriptValue::Number(20.0)
    );

    let object = run(&interop, "({ name: 'widget' })", &[]).value;
    assert!(!object.as_remote().expect("object reference").is_array());
    assert_eq!(
        run(&interop, "$0.name", &[object]).value,
        ScriptValue::from("widget")
    );
}

#[test]
fn queued_commands_run_before_synchronous_results() {
    let (_, interop) = bridge(BufferStrategy::Chars);
    interop.execute_fast_async("globalThis.log = []", &[]);
    for i in 0..5i32 {
        interop
            .execute("log.push($0)", &[i.into()], ExecuteOptions::asynchronous())
            .expect("queue");
    }
    assert_eq!(
        run(&interop, "log.join(',')", &[]).value,
        ScriptValue::from("0,1,2,3,4")
    );
}

#[test]
fn unbuffered_execution_does_not_flush() {
    let (_, interop) = bridge(BufferStrategy::Joined);
    interop.execute_fast_async("globalThis.marker = 'set'", &[]);
    let probe = interop
        .execute("typeof globalThis.marker", &[], ExecuteOptions::unbuffered())
        .expect("probe");
    assert_eq!(probe.value, ScriptValue::from("undefined"));
    assert_eq!(run(&interop, "marker", &[]).value, ScriptValue::from("set"));
}

#[test]
fn callbacks_receive_arguments_and_return_values() {
    let (_, interop) = bridge(BufferStrategy::Text);
    let double = interop.callbacks().create_strong(
        |args| match args.first() {
            Some(ScriptValue::Number(n)) => ScriptValue::Number(n * 2.0),
            _ => ScriptValue::Null,
        },
        ReturnKind::Value,
    );
    assert_eq!(
        run(&interop, "$0(21)", &[double.clone().into()]).value,
        ScriptValue::Number(42.0)
    );

    let echo = interop
        .callbacks()
        .create_strong(|args| args.first().cloned().unwrap_or(ScriptValue::Null), ReturnKind::Value);
    assert_eq!(
        run(&interop, "var o = { a: 1 }; $0(o) === o", &[echo.into()]).value,
        ScriptValue::Bool(true)
    );

    let raw: htmlbridge::callback::HostFunction = Arc::new(|_| ScriptValue::from("raw"));
    assert_eq!(
        run(&interop, "$0()", &[ScriptValue::Function(Arc::clone(&raw))]).value,
        ScriptValue::from("raw")
    );
}

#[test]
fn disposed_callbacks_are_inert_in_script() {
    let (_, interop) = bridge(BufferStrategy::Text);
    let handle = interop
        .callbacks()
        .create_strong(|_| ScriptValue::from("alive"), ReturnKind::Value);
    let callback = ScriptValue::Callback(handle.clone());
    assert_eq!(run(&interop, "$0()", &[callback.clone()]).value, ScriptValue::from("alive"));

    handle.dispose();
    assert_eq!(
        run(&interop, "$0() === undefined", &[callback]).value,
        ScriptValue::Bool(true)
    );
}

#[test]
fn callbacks_may_queue_commands_but_not_block() {
    let (_, interop) = bridge(BufferStrategy::Text);
    let weak: Weak<Interop> = Arc::downgrade(&interop);
    let outcome = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&outcome);
    let handle = interop.callbacks().create_strong(
        move |_| {
            let Some(interop) = weak.upgrade() else {
                return ScriptValue::Null;
            };
            interop.execute_fast_async("globalThis.fromCallback = 7", &[]);
            interop.flush();
            let nested = interop.execute("1", &[], ExecuteOptions::sync());
            *seen.lock() = Some(nested.map(|result| result.value));
            ScriptValue::Null
        },
        ReturnKind::Void,
    );

    run(&interop, "$0()", &[handle.into()]);
    let nested = outcome.lock().take().expect("callback ran");
    assert!(matches!(
        nested,
        Err(BridgeError::Execution(ExecutionError::Reentrant))
    ));
    assert_eq!(run(&interop, "fromCallback", &[]).value, ScriptValue::Number(7.0));
}

#[test]
fn script_errors_are_reported_with_the_failing_command() {
    let (reporter, interop) = bridge(BufferStrategy::Text);
    let result = run(&interop, "undefinedFunction($0)", &["arg".into()]);
    assert!(result.value.is_null());

    let reports = reporter.reports.lock().clone();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].command, r#"undefinedFunction("arg")"#);
    assert!(reports[0].message.contains("undefinedFunction"));
    assert_eq!(interop.pending_call_records(), 0);

    interop
        .execute("alsoMissing()", &[], ExecuteOptions::asynchronous())
        .expect("queue");
    interop.execute("1", &[], ExecuteOptions::sync()).expect("flush");
    let reports = reporter.reports.lock().clone();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[1].command, "alsoMissing()");
    assert_eq!(interop.pending_call_records(), 0);
}

#[test]
fn script_errors_surface_as_results_without_reporting() {
    let config = BridgeConfig {
        enable_error_reporting: false,
        ..BridgeConfig::default()
    };
    let (reporter, interop) = bridge_with(config, FetcherKind::ScriptTags, None);
    let err = interop
        .execute("undefinedFunction()", &[], ExecuteOptions::sync())
        .unwrap_err();
    assert!(matches!(err, BridgeError::Execution(ExecutionError::Script(_))));
    assert!(reporter.reports.lock().is_empty());
}

#[test]
fn local_files_are_loaded_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        dir.path().join("lib.js"),
        "globalThis.loads = (globalThis.loads || 0) + 1;",
    )
    .expect("write lib");
    std::fs::write(dir.path().join("broken.js"), "this is not javascript").expect("write broken");
    let base = Url::from_directory_path(dir.path()).expect("base url");

    let (_, interop) = bridge_with(BridgeConfig::default(), FetcherKind::LocalFiles, Some(base));
    let outcomes = Arc::new(Mutex::new(Vec::new()));

    for _ in 0..2 {
        let ok = Arc::clone(&outcomes);
        let failed = Arc::clone(&outcomes);
        interop.loader().load(
            "./lib.js",
            move || ok.lock().push("ok"),
            move || failed.lock().push("failed"),
        );
    }
    assert_eq!(run(&interop, "loads", &[]).value, ScriptValue::Number(1.0));

    let done = Arc::clone(&outcomes);
    let failed = Arc::clone(&outcomes);
    interop.loader().load_many(
        vec!["broken.js".into(), "lib.js".into()],
        move || done.lock().push("all"),
        move || failed.lock().push("aborted"),
    );
    assert_eq!(*outcomes.lock(), vec!["ok", "ok", "aborted"]);

    interop.reset();
    let ok = Arc::clone(&outcomes);
    interop.loader().load("lib.js", move || ok.lock().push("reloaded"), || {});
    assert_eq!(run(&interop, "loads", &[]).value, ScriptValue::Number(2.0));
}

#[test]
fn broken_local_file_does_not_swallow_queued_commands() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("broken.js"), "this is not javascript").expect("write broken");
    let base = Url::from_directory_path(dir.path()).expect("base url");

    let (_, interop) = bridge_with(BridgeConfig::default(), FetcherKind::LocalFiles, Some(base));
    interop
        .execute("globalThis.queued = 1", &[], ExecuteOptions::asynchronous())
        .expect("queue");

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let ok = Arc::clone(&outcomes);
    let failed = Arc::clone(&outcomes);
    interop.loader().load(
        "broken.js",
        move || ok.lock().push("ok"),
        move || failed.lock().push("failed"),
    );
    assert_eq!(*outcomes.lock(), vec!["failed"]);

    assert_eq!(
        run(&interop, "typeof globalThis.queued", &[]).value,
        ScriptValue::from("number")
    );
    assert_eq!(interop.pending_call_records(), 0);
}

#[test]
fn tag_loader_reports_failure_without_a_document() {
    let (_, interop) = bridge(BufferStrategy::Text);
    let outcomes = Arc::new(Mutex::new(Vec::new()));

    let ok = Arc::clone(&outcomes);
    let failed = Arc::clone(&outcomes);
    interop.loader().load(
        "lib.js",
        move || ok.lock().push("ok"),
        move || failed.lock().push("failed"),
    );
    let css = Arc::clone(&outcomes);
    interop.loader().load_css("site.css", move || css.lock().push("css"));

    run(&interop, "1", &[]);
    assert_eq!(*outcomes.lock(), vec!["failed", "css"]);
    assert!(!interop.loader().is_loaded(ResourceKind::Script, "lib.js"));
}
