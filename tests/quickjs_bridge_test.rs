use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use frontier_bridge::js::{run_document_scripts, BackendState, SandboxRegistry};
use frontier_bridge::js::{HostCapabilities, QuickJsRuntime};
use frontier_bridge::{BackendManager, BridgeConfig, BridgeError, DocumentTree, Page};
use futures_util::future::join;
use serde_json::{json, Value as JsonValue};
use tokio::runtime::Builder;
use tokio::task::LocalSet;
use tokio::time::sleep;

const QUICKJS: Option<&str> = Some("quickjs");

fn run_local<F: Future>(future: F) -> F::Output {
    let runtime = Builder::new_current_thread().enable_all().build().unwrap();
    LocalSet::new().block_on(&runtime, future)
}

fn page() -> Rc<Page> {
    Page::parse("https://example.com/app/index.html").expect("valid page url")
}

#[test]
fn script_mutates_host_document() {
    run_local(async {
        let page = page();
        let doc = page.load_document("<p id=msg class=pending>Loading</p>");
        let manager = BackendManager::new(BridgeConfig::default(), page.clone());

        let value = manager
            .evaluate(
                doc.clone(),
                QUICKJS,
                r#"
                const msg = document.getElementById('msg');
                msg.textContent = 'Ready';
                msg.className = 'done';
                msg.textContent + '/' + msg.className
                "#,
            )
            .await
            .expect("script runs");

        assert_eq!(value, Some(json!("Ready/done")));
        let html = doc.to_html();
        assert!(html.contains(r#"<p class="done" id="msg">Ready</p>"#) || html.contains(r#"<p id="msg" class="done">Ready</p>"#));
    });
}

#[test]
fn inner_html_and_selectors() {
    run_local(async {
        let page = page();
        let doc = page.load_document("<ul id=list></ul>");
        let manager = BackendManager::new(BridgeConfig::default(), page.clone());

        let value = manager
            .evaluate(
                doc.clone(),
                QUICKJS,
                r#"
                document.querySelector('#list').innerHTML = '<li class=item>one</li><li>two</li>';
                [document.querySelector('.item').textContent, document.querySelector('#missing')]
                "#,
            )
            .await
            .unwrap();

        assert_eq!(value, Some(json!(["one", null])));
        assert!(doc.to_html().contains("<li class=\"item\">one</li><li>two</li>"));
    });
}

#[test]
fn undefined_completion_is_none() {
    run_local(async {
        let page = page();
        let doc = page.load_document("");
        let manager = BackendManager::new(BridgeConfig::default(), page.clone());

        let value = manager
            .evaluate(doc, QUICKJS, "function unused() {}")
            .await
            .unwrap();
        assert_eq!(value, None);
    });
}

#[test]
fn uncaught_exception_becomes_script_error() {
    run_local(async {
        let page = page();
        let doc = page.load_document("");
        let manager = BackendManager::new(BridgeConfig::default(), page.clone());

        let err = manager
            .evaluate(doc.clone(), QUICKJS, "throw new Error('nope')")
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Script(ref message) if message.contains("nope")));

        let value = manager.evaluate(doc, QUICKJS, "1 + 2").await.unwrap();
        assert_eq!(value, Some(json!(3)));
    });
}

#[test]
fn location_and_alert_reach_the_page() {
    run_local(async {
        let page = page();
        let doc = page.load_document("");
        let manager = BackendManager::new(BridgeConfig::default(), page.clone());

        let href = manager
            .evaluate(doc.clone(), QUICKJS, "location.href")
            .await
            .unwrap();
        assert_eq!(href, Some(json!("https://example.com/app/index.html")));

        manager
            .evaluate(doc, QUICKJS, "alert('saved'); location.href = 'next.html';")
            .await
            .unwrap();
        assert_eq!(page.alerts(), vec!["saved"]);
        assert_eq!(page.take_navigations(), vec!["https://example.com/app/next.html"]);
    });
}

#[test]
fn unknown_operation_is_reported_to_script() {
    run_local(async {
        let page = page();
        let doc = page.load_document("");
        let manager = BackendManager::new(BridgeConfig::default(), page.clone());

        let value = manager
            .evaluate(
                doc,
                QUICKJS,
                "JSON.parse(__bridge_call('Element.explode', '{}')).error",
            )
            .await
            .unwrap();
        assert_eq!(value, Some(json!("unknown operation 'Element.explode'")));
    });
}

#[test]
fn empty_script_and_null_kind_touch_nothing() {
    run_local(async {
        let page = page();
        let doc = page.load_document("");
        let manager = BackendManager::new(BridgeConfig::default(), page.clone());

        assert_eq!(manager.evaluate(doc.clone(), QUICKJS, "").await.unwrap(), None);
        assert_eq!(manager.evaluate(doc.clone(), QUICKJS, "   ").await.unwrap(), None);
        assert_eq!(manager.evaluate(doc.clone(), None, "alert(1)").await.unwrap(), None);
        assert!(manager.instance(doc.handle()).is_none());
        assert!(page.alerts().is_empty());
    });
}

#[test]
fn switching_kind_replaces_backend() {
    run_local(async {
        let page = page();
        let doc = page.load_document("");
        let mut runtimes = SandboxRegistry::with_defaults();
        runtimes.register("alt", Rc::new(QuickJsRuntime::default()));
        let manager = BackendManager::with_runtimes(
            BridgeConfig::default(),
            page.clone(),
            runtimes,
            HostCapabilities::detect(),
        );

        manager
            .evaluate(doc.clone(), QUICKJS, "var kept = 'first'")
            .await
            .unwrap();
        let first = manager.instance(doc.handle()).unwrap();
        assert_eq!(
            manager.evaluate(doc.clone(), QUICKJS, "kept").await.unwrap(),
            Some(json!("first"))
        );

        let fresh = manager
            .evaluate(doc.clone(), Some("alt"), "typeof kept")
            .await
            .unwrap();
        assert_eq!(fresh, Some(json!("undefined")));
        assert!(first.is_terminated());
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.instance(doc.handle()).unwrap().kind(), "alt");
    });
}

#[test]
fn stop_without_backend_is_noop() {
    run_local(async {
        let page = page();
        let doc = page.load_document("");
        let manager = BackendManager::new(BridgeConfig::default(), page.clone());
        manager.stop(doc.handle());
        manager.stop_all();
        assert!(manager.is_empty());
    });
}

#[test]
fn stop_cancels_running_evaluation() {
    run_local(async {
        let page = page();
        let doc = page.load_document("");
        let manager = BackendManager::new(BridgeConfig::default(), page.clone());
        let handle = doc.handle();

        let task = tokio::task::spawn_local({
            let manager = Rc::clone(&manager);
            let doc = doc.clone();
            async move { manager.evaluate(doc, QUICKJS, "while (true) {}").await }
        });

        for _ in 0..500 {
            let state = manager.instance(handle).map(|instance| instance.state());
            if state == Some(BackendState::AwaitingDone) {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let instance = manager.instance(handle).expect("backend started");
        manager.stop(handle);

        let outcome = task.await.unwrap();
        assert!(matches!(outcome, Err(BridgeError::Cancelled)));
        assert_eq!(instance.state(), BackendState::Terminated);
        assert!(manager.instance(handle).is_none());
    });
}

#[test]
fn unsupported_environment_creates_no_backend() {
    run_local(async {
        let page = page();
        let doc = page.load_document("");
        let manager = BackendManager::with_runtimes(
            BridgeConfig::default(),
            page.clone(),
            SandboxRegistry::with_defaults(),
            HostCapabilities {
                shared_memory: false,
            },
        );

        let err = manager.evaluate(doc, QUICKJS, "1").await.unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedEnvironment));
        assert!(manager.is_empty());
        assert_eq!(page.alerts().len(), 1);
    });
}

#[test]
fn oversized_reply_becomes_error() {
    run_local(async {
        let page = page();
        let big = "x".repeat(4096);
        let doc = page.load_document(&format!("<p id=big>{big}</p>"));
        let config = BridgeConfig {
            buffer_capacity: 1024,
            ..BridgeConfig::default()
        };
        let manager = BackendManager::new(config, page.clone());

        let value = manager
            .evaluate(
                doc,
                QUICKJS,
                "try { document.querySelector('#big').textContent; 'read' } catch (e) { e.message }",
            )
            .await
            .unwrap();
        let message = value.and_then(|v| v.as_str().map(str::to_string)).unwrap();
        assert!(message.contains("exceeds the channel capacity"), "{message}");
    });
}

#[test]
fn documents_stay_isolated_under_interleaving() {
    run_local(async {
        let page = page();
        let left = page.load_document("<span id=v>left</span>");
        let right = page.load_document("<span id=v>right</span>");
        let manager = BackendManager::new(BridgeConfig::default(), page.clone());

        let left_ptr = manager
            .evaluate(left.clone(), QUICKJS, "document.querySelector('#v').ptr")
            .await
            .unwrap()
            .and_then(|v| v.as_u64())
            .unwrap();

        for round in 0..10 {
            let script = |name: &str| {
                format!(
                    "const el{round} = document.querySelector('#v'); \
                     el{round}.textContent = '{name}-{round}'; el{round}.textContent"
                )
            };
            let (l, r) = join(
                manager.evaluate(left.clone(), QUICKJS, &script("left")),
                manager.evaluate(right.clone(), QUICKJS, &script("right")),
            )
            .await;
            assert_eq!(l.unwrap(), Some(json!(format!("left-{round}"))));
            assert_eq!(r.unwrap(), Some(json!(format!("right-{round}"))));
        }

        // A handle issued by one document does not resolve in another.
        let foreign = manager
            .evaluate(
                right.clone(),
                QUICKJS,
                &format!(
                    "JSON.parse(__bridge_call('Element.getTextContent', JSON.stringify({{ ptr: {left_ptr} }}))).error"
                ),
            )
            .await
            .unwrap();
        assert!(matches!(foreign, Some(JsonValue::String(ref e)) if e.contains("does not resolve")));
        assert!(left.to_html().contains("left-9"));
        assert!(right.to_html().contains("right-9"));
        assert_eq!(manager.len(), 2);
    });
}

#[test]
fn processor_runs_page_and_frame_scripts() {
    run_local(async {
        let page = page();
        let doc = page.load_document(
            r#"<p id=status>idle</p>
               <script>function greet(name) { return 'hi ' + name; }</script>
               <script>document.querySelector('#status').textContent = 'booted';</script>
               <script src="remote.js"></script>
               <script>throw new Error('broken script');</script>
               <iframe srcdoc="<p id=out></p><script>document.querySelector('#out').textContent = parent.greet('frame');</script>"></iframe>"#,
        );
        let manager = BackendManager::new(BridgeConfig::default(), page.clone());

        let summary = run_document_scripts(&manager, doc.clone(), QUICKJS)
            .await
            .expect("scripts run");

        assert_eq!(summary.documents, 2);
        assert_eq!(summary.executed_scripts, 3);
        assert_eq!(summary.failed_scripts, 1);
        assert_eq!(summary.skipped_scripts, 1);
        assert!(doc.to_html().contains("<p id=\"status\">booted</p>"));
        let frame = &doc.frame_documents()[0];
        assert!(frame.to_html().contains("<p id=\"out\">hi frame</p>"));
    });
}

#[test]
fn document_write_into_frame() {
    run_local(async {
        let page = page();
        let doc = page.load_document("<iframe id=f></iframe>");
        let manager = BackendManager::new(BridgeConfig::default(), page.clone());

        manager
            .evaluate(
                doc.clone(),
                QUICKJS,
                r#"
                const frameDoc = document.querySelector('#f').contentDocument;
                frameDoc.open();
                frameDoc.write('<h1>', 'written', '</h1>');
                frameDoc.close();
                "#,
            )
            .await
            .unwrap();

        let frame = &doc.frame_documents()[0];
        assert!(frame.to_html().contains("<h1>written</h1>"));
    });
}
