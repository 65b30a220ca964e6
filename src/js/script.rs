use serde::{Deserialize, Serialize};

/// How a script is scheduled relative to HTML parsing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptExecution {
    /// Classic scripts that run immediately and block parsing.
    #[default]
    Blocking,
    /// External scripts marked `async`.
    Async,
    /// External scripts marked `defer`, and modules.
    Defer,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptKind {
    #[default]
    Classic,
    /// `<script type="module">`.
    Module,
    /// Data blocks and unsupported languages; never executed.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptSource {
    Inline { code: String },
    External { src: String },
}

/// A `<script>` element found in a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptDescriptor {
    /// Position among the document's script elements.
    pub index: usize,
    pub kind: ScriptKind,
    pub execution: ScriptExecution,
    pub source: ScriptSource,
}

impl ScriptDescriptor {
    pub fn inline(index: usize, code: String, kind: ScriptKind) -> Self {
        let execution = match kind {
            ScriptKind::Module => ScriptExecution::Defer,
            _ => ScriptExecution::Blocking,
        };
        Self {
            index,
            kind,
            execution,
            source: ScriptSource::Inline { code },
        }
    }

    /// Source text of an inline classic script that runs during parsing.
    pub fn blocking_inline_code(&self) -> Option<&str> {
        match (&self.source, self.kind, self.execution) {
            (ScriptSource::Inline { code }, ScriptKind::Classic, ScriptExecution::Blocking) => {
                Some(code)
            }
            _ => None,
        }
    }
}
