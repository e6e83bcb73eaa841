//! Mail body rendering.
//!
//! Templates use a small subset of the usual curly-brace syntax:
//! `{{ var }}` substitutes a value and `{% for event in events %}` ...
//! `{% endfor %}` repeats its body once per event, where `{{ event.<field> }}`
//! reads a field of the event view.
//!
//! `{% sortbyattr events name sevr as by_name %}` binds `by_name` to a copy of
//! the batch stably sorted by the listed fields, which a later `for` can loop
//! over. Parsed templates are cached by id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use tracing::debug;

use super::events::{AlarmEvent, EventView};
use crate::config::DestinationConfig;
use crate::{Error, Result};

/// Id of the compiled-in plain text template.
pub const BUILTIN_PLAIN: &str = "builtin:plain";
/// Id of the compiled-in HTML template.
pub const BUILTIN_HTML: &str = "builtin:html";

const BUILTIN_PLAIN_SOURCE: &str = include_str!("../../templates/template.txt");
const BUILTIN_HTML_SOURCE: &str = include_str!("../../templates/template.html");

/// Data a template is rendered against.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    /// Batch in delivery order.
    pub events: &'a [AlarmEvent],
    pub destination: &'a DestinationConfig,
    pub now: DateTime<Local>,
}

impl<'a> RenderContext<'a> {
    pub fn new(events: &'a [AlarmEvent], destination: &'a DestinationConfig) -> Self {
        Self {
            events,
            destination,
            now: Local::now(),
        }
    }

    fn variable(&self, name: &str) -> Option<String> {
        let value = match name {
            "count" => self.events.len().to_string(),
            "now" => self.now.format("%a %b %e %H:%M:%S %Y").to_string(),
            "destination" => self.destination.name.clone(),
            "from" => self.destination.from.clone(),
            "to" => self.destination.to.join(", "),
            "subject" => self.destination.subject_for(self.events.len()),
            _ => return None,
        };
        Some(value)
    }
}

/// Renders a named template against a batch.
pub trait Renderer: Send + Sync {
    fn render(&self, template_id: &str, ctx: &RenderContext<'_>) -> Result<String>;
}

/// List every batch template starts with.
const EVENTS: &str = "events";

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Var(String),
    Loop {
        var: String,
        list: String,
        body: Vec<Node>,
    },
    Sort {
        input: String,
        keys: Vec<String>,
        output: String,
    },
}

type OpenLoop = Option<(String, String)>;

/// Parse template text into a node tree.
fn parse(id: &str, source: &str) -> Result<Vec<Node>> {
    // Stack of open loops: ((loop variable, list), nodes collected so far).
    let mut stack: Vec<(OpenLoop, Vec<Node>)> = vec![(None, Vec::new())];
    let mut rest = source;

    while !rest.is_empty() {
        let next = match (rest.find("{{"), rest.find("{%")) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let Some(start) = next else {
            push_text(&mut stack, rest);
            break;
        };

        push_text(&mut stack, &rest[..start]);
        let is_var = rest[start..].starts_with("{{");
        let close = if is_var { "}}" } else { "%}" };
        let Some(len) = rest[start + 2..].find(close) else {
            return Err(Error::render(id, format!("unterminated '{}'", &rest[start..start + 2])));
        };
        let inner = rest[start + 2..start + 2 + len].trim();
        rest = &rest[start + 2 + len + 2..];

        if is_var {
            if inner.is_empty() {
                return Err(Error::render(id, "empty variable tag"));
            }
            current(&mut stack).push(Node::Var(inner.to_string()));
            continue;
        }

        let words: Vec<&str> = inner.split_whitespace().collect();
        match words.as_slice() {
            ["for", var, "in", list] => {
                stack.push((Some((var.to_string(), list.to_string())), Vec::new()))
            }
            ["endfor"] => {
                if stack.len() < 2 {
                    return Err(Error::render(id, "'endfor' without 'for'"));
                }
                if let Some((Some((var, list)), body)) = stack.pop() {
                    current(&mut stack).push(Node::Loop { var, list, body });
                }
            }
            ["sortbyattr", input, keys @ .., "as", output] if !keys.is_empty() => {
                current(&mut stack).push(Node::Sort {
                    input: input.to_string(),
                    keys: keys.iter().map(|k| k.to_string()).collect(),
                    output: output.to_string(),
                });
            }
            ["sortbyattr", ..] => {
                return Err(Error::render(
                    id,
                    format!("expected 'sortbyattr <list> <field>... as <name>', got '{}'", inner),
                ));
            }
            _ => return Err(Error::render(id, format!("unsupported tag '{}'", inner))),
        }
    }

    if stack.len() != 1 {
        return Err(Error::render(id, "'for' without 'endfor'"));
    }
    Ok(stack.pop().map(|(_, nodes)| nodes).unwrap_or_default())
}

fn current(stack: &mut [(OpenLoop, Vec<Node>)]) -> &mut Vec<Node> {
    let last = stack.len() - 1;
    &mut stack[last].1
}

fn push_text(stack: &mut [(OpenLoop, Vec<Node>)], text: &str) {
    if !text.is_empty() {
        current(stack).push(Node::Text(text.to_string()));
    }
}

/// Escape text for inclusion in HTML.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn is_html(template_id: &str) -> bool {
    template_id == BUILTIN_HTML || template_id.ends_with(".html") || template_id.ends_with(".htm")
}

/// Sort key of one event field. Numeric fields compare as numbers.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum SortKey {
    Number(u64),
    Text(String),
}

fn sort_key(view: &EventView, field: &str) -> Option<SortKey> {
    match field {
        "sevr" => Some(SortKey::Number(view.sevr.into())),
        "status" => Some(SortKey::Number(view.status.into())),
        "reason_code" => Some(SortKey::Number(view.reason_code.into())),
        _ => view.field(field).map(SortKey::Text),
    }
}

struct Evaluator<'a> {
    id: &'a str,
    ctx: &'a RenderContext<'a>,
    escape: bool,
    /// Lists bound by `sortbyattr`.
    lists: HashMap<String, Vec<EventView>>,
}

impl Evaluator<'_> {
    fn eval(
        &mut self,
        nodes: &[Node],
        scope: Option<(&str, &EventView)>,
        out: &mut String,
    ) -> Result<()> {
        for node in nodes {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Var(name) => {
                    let value = self.lookup(name, scope)?;
                    if self.escape {
                        out.push_str(&escape_html(&value));
                    } else {
                        out.push_str(&value);
                    }
                }
                Node::Loop { var, list, body } => {
                    if scope.is_some() {
                        return Err(Error::render(self.id, "nested loops are not supported"));
                    }
                    let views = self.list(list)?;
                    for view in &views {
                        self.eval(body, Some((var.as_str(), view)), out)?;
                    }
                }
                Node::Sort {
                    input,
                    keys,
                    output,
                } => {
                    if scope.is_some() {
                        return Err(Error::render(self.id, "'sortbyattr' inside a loop"));
                    }
                    let sorted = self.sorted(input, keys)?;
                    self.lists.insert(output.clone(), sorted);
                }
            }
        }
        Ok(())
    }

    fn list(&self, name: &str) -> Result<Vec<EventView>> {
        if let Some(views) = self.lists.get(name) {
            return Ok(views.clone());
        }
        if name == EVENTS {
            return Ok(self.ctx.events.iter().map(AlarmEvent::view).collect());
        }
        Err(Error::render(self.id, format!("unknown list '{}'", name)))
    }

    fn sorted(&self, input: &str, keys: &[String]) -> Result<Vec<EventView>> {
        let mut keyed = self
            .list(input)?
            .into_iter()
            .map(|view| {
                let key = keys
                    .iter()
                    .map(|field| {
                        sort_key(&view, field).ok_or_else(|| {
                            Error::render(self.id, format!("unknown event field '{}'", field))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok((key, view))
            })
            .collect::<Result<Vec<_>>>()?;
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(keyed.into_iter().map(|(_, view)| view).collect())
    }

    fn lookup(&self, name: &str, scope: Option<(&str, &EventView)>) -> Result<String> {
        if let Some((var, view)) = scope {
            if let Some((head, field)) = name.split_once('.') {
                if head == var {
                    return view.field(field).ok_or_else(|| {
                        Error::render(self.id, format!("unknown event field '{}'", field))
                    });
                }
            }
        }
        self.ctx
            .variable(name)
            .ok_or_else(|| Error::render(self.id, format!("unknown variable '{}'", name)))
    }
}

/// File-backed renderer with compiled-in fallbacks.
pub struct TemplateRenderer {
    dirs: Vec<PathBuf>,
    cache: Mutex<HashMap<String, Arc<Vec<Node>>>>,
}

impl TemplateRenderer {
    /// Search `dirs` in order for template files.
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self {
            dirs,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Parse a colon-separated directory list.
    pub fn from_search_path(path: &str) -> Self {
        let dirs = path
            .split(':')
            .filter(|d| !d.is_empty())
            .map(PathBuf::from)
            .collect();
        Self::new(dirs)
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    fn locate(&self, template_id: &str) -> Option<PathBuf> {
        let candidate = Path::new(template_id);
        if candidate.is_absolute() {
            return candidate.is_file().then(|| candidate.to_path_buf());
        }
        self.dirs
            .iter()
            .map(|dir| dir.join(template_id))
            .find(|path| path.is_file())
    }

    fn load(&self, template_id: &str) -> Result<Arc<Vec<Node>>> {
        if let Some(nodes) = self.cache.lock().get(template_id) {
            return Ok(Arc::clone(nodes));
        }

        let source = match template_id {
            BUILTIN_PLAIN => BUILTIN_PLAIN_SOURCE.to_string(),
            BUILTIN_HTML => BUILTIN_HTML_SOURCE.to_string(),
            _ => {
                let path = self.locate(template_id).ok_or_else(|| {
                    Error::render(template_id, "template not found in search path")
                })?;
                debug!("Loading template {} from {}", template_id, path.display());
                std::fs::read_to_string(&path)?
            }
        };

        let nodes = Arc::new(parse(template_id, &source)?);
        self.cache
            .lock()
            .insert(template_id.to_string(), Arc::clone(&nodes));
        Ok(nodes)
    }
}

impl Renderer for TemplateRenderer {
    fn render(&self, template_id: &str, ctx: &RenderContext<'_>) -> Result<String> {
        let nodes = self.load(template_id)?;
        let mut evaluator = Evaluator {
            id: template_id,
            ctx,
            escape: is_html(template_id),
            lists: HashMap::new(),
        };
        let mut out = String::new();
        evaluator.eval(&nodes, None, &mut out)?;
        Ok(out)
    }
}
