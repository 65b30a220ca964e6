use std::collections::VecDeque;
use std::rc::Rc;

use anyhow::{anyhow, Context as AnyhowContext, Result};
use tracing::{debug, error, info};

use super::backend::BackendManager;
use super::error::BridgeError;
use super::script::{ScriptDescriptor, ScriptExecution, ScriptKind, ScriptSource};
use crate::dom::{DocumentTree, HtmlDocument};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScriptExecutionSummary {
    pub documents: usize,
    pub executed_scripts: usize,
    pub failed_scripts: usize,
    /// External, module and unknown scripts that were not run.
    pub skipped_scripts: usize,
}

/// Find every `<script>` element of `document`, in tree order.
pub fn collect_scripts(document: &HtmlDocument) -> Result<Vec<ScriptDescriptor>> {
    let mut collected = Vec::new();
    let selector = document
        .root()
        .select("script")
        .map_err(|_| anyhow!("failed to compile selector"))?;

    for (index, script) in selector.enumerate() {
        let attributes = script.attributes.borrow();
        let kind = classify_kind(attributes.get("type"));

        if let Some(src) = attributes
            .get("src")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
        {
            collected.push(ScriptDescriptor {
                index,
                kind,
                execution: determine_execution(&attributes, kind),
                source: ScriptSource::External {
                    src: src.to_string(),
                },
            });
            continue;
        }

        drop(attributes);
        let code = script.text_contents();
        if code.trim().is_empty() {
            continue;
        }
        collected.push(ScriptDescriptor::inline(index, code, kind));
    }

    Ok(collected)
}

fn classify_kind(script_type: Option<&str>) -> ScriptKind {
    let Some(value) = script_type else {
        return ScriptKind::Classic;
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "text/javascript" | "application/javascript" | "text/ecmascript"
        | "application/ecmascript" => ScriptKind::Classic,
        "module" | "text/javascript+module" => ScriptKind::Module,
        _ => ScriptKind::Unknown,
    }
}

fn determine_execution(attributes: &kuchiki::Attributes, kind: ScriptKind) -> ScriptExecution {
    if attributes.get("async").is_some() {
        return ScriptExecution::Async;
    }
    if attributes.get("defer").is_some() || kind == ScriptKind::Module {
        return ScriptExecution::Defer;
    }
    ScriptExecution::Blocking
}

/// Run the blocking inline scripts of `document` in order, then those of
/// every frame document below it, parents before children.
///
/// A script that throws is logged and counted; errors that make the whole
/// backend unusable abort the run.
pub async fn run_document_scripts(
    manager: &Rc<BackendManager>,
    document: Rc<HtmlDocument>,
    kind: Option<&str>,
) -> Result<ScriptExecutionSummary> {
    let mut summary = ScriptExecutionSummary::default();
    let Some(kind) = kind else {
        debug!(target: "bridge", "scripting disabled");
        return Ok(summary);
    };

    let mut pending = VecDeque::from([document]);
    while let Some(document) = pending.pop_front() {
        summary.documents += 1;
        let scripts = collect_scripts(&document)?;
        debug!(
            target: "bridge",
            document = %document.handle(),
            scripts = scripts.len(),
            "running document scripts"
        );

        for descriptor in &scripts {
            let Some(code) = descriptor.blocking_inline_code() else {
                summary.skipped_scripts += 1;
                continue;
            };
            let target: Rc<dyn DocumentTree> = document.clone();
            match manager.evaluate(target, Some(kind), code).await {
                Ok(_) => summary.executed_scripts += 1,
                Err(BridgeError::Script(message)) => {
                    error!(
                        target: "bridge",
                        document = %document.handle(),
                        index = descriptor.index,
                        error = %message,
                        "inline script failed"
                    );
                    summary.failed_scripts += 1;
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("failed to run scripts of document {}", document.handle())
                    });
                }
            }
        }

        pending.extend(document.frame_documents());
    }

    info!(
        target: "bridge",
        documents = summary.documents,
        executed = summary.executed_scripts,
        failed = summary.failed_scripts,
        skipped = summary.skipped_scripts,
        "script execution finished"
    );
    Ok(summary)
}
