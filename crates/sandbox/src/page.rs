//! Browser page automation
//!
//! [`PageDriver`] is the seam between the harness and whatever controls the
//! browser. [`PlaywrightPage`] is the default: a long-lived Node.js process
//! running a small Playwright script, spoken to with newline-delimited JSON
//! over stdin/stdout.
//!
//! ```text
//! harness ──{"id":1,"method":"goto","params":{..}}──▶ node driver ──▶ browser
//! harness ◀──{"id":1,"result":null}──────────────────
//! harness ◀──{"event":"navigated","url":".."}──────── (unsolicited)
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::PageSettings;
use crate::error::{SandboxError, SandboxResult};
use crate::events::{EventHub, PageEvent};

/// Callback invoked when the page calls an exposed function.
pub type BindingHandler = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// What the harness needs from a controlled browser page.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Hub carrying this page's navigation, console and hot-update events.
    fn events(&self) -> EventHub;

    /// Make `window.<name>(...)` inside the page call `handler`.
    async fn expose_binding(&self, name: &str, handler: BindingHandler) -> SandboxResult<()>;

    async fn goto(&self, url: &str) -> SandboxResult<()>;

    async fn reload(&self) -> SandboxResult<()>;

    /// Run `function` (JavaScript source) in the page with `args` spread
    /// as its parameters, returning the JSON-serialized result.
    async fn evaluate(&self, function: &str, args: Vec<Value>) -> SandboxResult<Value>;

    async fn close(&self) -> SandboxResult<()>;
}

/// Driver script run by Node.js.
const DRIVER_SCRIPT: &str = r#"'use strict';
const readline = require('readline');
const playwright = require('playwright');

const browserName = process.argv[2] || 'chromium';
const headless = process.argv[3] !== 'false';
let browser;
let page;

function send(message) {
  process.stdout.write(JSON.stringify(message) + '\n');
}

function emit(event, payload) {
  send(Object.assign({ event }, payload));
}

async function ensurePage() {
  if (page) return page;
  browser = await playwright[browserName].launch({ headless });
  page = await browser.newPage();
  page.on('framenavigated', (frame) => {
    if (frame === page.mainFrame()) emit('navigated', { url: frame.url() });
  });
  page.on('console', (message) => emit('console', { text: message.text() }));
  return page;
}

const methods = {
  async open() {
    await ensurePage();
  },
  async expose({ name }) {
    const p = await ensurePage();
    await p.exposeFunction(name, (...args) => emit('binding', { name, args }));
  },
  async goto({ url }) {
    const p = await ensurePage();
    await p.goto(url);
  },
  async reload() {
    const p = await ensurePage();
    await p.reload();
  },
  async evaluate({ source, args }) {
    const p = await ensurePage();
    return p.evaluate(({ source, args }) => {
      const fn = (0, eval)('(' + source + ')');
      return fn(...args);
    }, { source, args });
  },
  async close() {
    if (browser) await browser.close();
    browser = undefined;
    page = undefined;
  },
};

readline.createInterface({ input: process.stdin }).on('line', async (line) => {
  let message;
  try {
    message = JSON.parse(line);
  } catch (_) {
    return;
  }
  const method = methods[message.method];
  if (!method) {
    send({ id: message.id, error: 'unknown method: ' + message.method });
    return;
  }
  try {
    const result = await method(message.params || {});
    send({ id: message.id, result: result === undefined ? null : result });
  } catch (error) {
    send({ id: message.id, error: String((error && error.message) || error) });
  }
  if (message.method === 'close') process.exit(0);
});
"#;

const DRIVER_FILE: &str = "page-driver.cjs";

#[derive(Debug, Serialize)]
struct Request<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum DriverEvent {
    Navigated {
        url: String,
    },
    Console {
        text: String,
    },
    Binding {
        name: String,
        #[serde(default)]
        args: Vec<Value>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Incoming {
    Response {
        id: u64,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<String>,
    },
    Event(DriverEvent),
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;
type Bindings = Arc<Mutex<HashMap<String, BindingHandler>>>;

/// Playwright page behind a Node.js driver process.
pub struct PlaywrightPage {
    child: tokio::sync::Mutex<Child>,
    stdin: tokio::sync::Mutex<ChildStdin>,
    pending: Pending,
    bindings: Bindings,
    hub: EventHub,
    next_id: AtomicU64,
    request_timeout: Duration,
    reader: JoinHandle<()>,
    closed: AtomicBool,
}

impl PlaywrightPage {
    /// Start the driver and open a blank page.
    ///
    /// The driver script is written into `script_dir`.
    pub async fn launch(settings: &PageSettings, script_dir: &Path) -> SandboxResult<Self> {
        tokio::fs::create_dir_all(script_dir).await?;
        let script_path = script_dir.join(DRIVER_FILE);
        tokio::fs::write(&script_path, DRIVER_SCRIPT).await?;

        let mut cmd = Command::new(&settings.node_binary);
        cmd.arg(&script_path)
            .arg(settings.browser.as_str())
            .arg(settings.headless.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(node_path) = &settings.node_path {
            cmd.env("NODE_PATH", node_path);
        }

        let mut child = cmd.spawn().map_err(|e| {
            SandboxError::PageDriver(format!(
                "failed to spawn {}: {}",
                settings.node_binary.display(),
                e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::PageDriver("driver stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::PageDriver("driver stdout unavailable".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "page_driver", "{}", line);
                }
            });
        }

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let bindings: Bindings = Arc::new(Mutex::new(HashMap::new()));
        let hub = EventHub::new();
        let reader = tokio::spawn(read_loop(stdout, pending.clone(), bindings.clone(), hub.clone()));

        let page = Self {
            child: tokio::sync::Mutex::new(child),
            stdin: tokio::sync::Mutex::new(stdin),
            pending,
            bindings,
            hub,
            next_id: AtomicU64::new(1),
            request_timeout: settings.request_timeout(),
            reader,
            closed: AtomicBool::new(false),
        };

        page.request("open", json!({})).await?;
        info!(browser = settings.browser.as_str(), "Page driver ready");
        Ok(page)
    }

    async fn request(&self, method: &str, params: Value) -> SandboxResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let mut line = serde_json::to_string(&Request { id, method, params })?;
        line.push('\n');
        trace!(id, method, "Driver request");

        let written = {
            let mut stdin = self.stdin.lock().await;
            match stdin.write_all(line.as_bytes()).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            self.pending.lock().remove(&id);
            return Err(SandboxError::PageDriver(format!("{} failed: {}", method, e)));
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(SandboxError::PageDriver(message)),
            Ok(Err(_)) => Err(SandboxError::PageDriver(format!(
                "driver exited before answering {}",
                method
            ))),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(SandboxError::Timeout(format!("page driver {}", method)))
            }
        }
    }
}

async fn read_loop(stdout: ChildStdout, pending: Pending, bindings: Bindings, hub: EventHub) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Page driver read error: {}", e);
                break;
            }
        };

        match serde_json::from_str::<Incoming>(&line) {
            Ok(Incoming::Response { id, result, error }) => {
                let reply = match error {
                    Some(message) => Err(message),
                    None => Ok(result),
                };
                match pending.lock().remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => debug!(id, "Response for unknown request"),
                }
            }
            Ok(Incoming::Event(DriverEvent::Navigated { url })) => {
                hub.emit(PageEvent::Navigated { url });
            }
            Ok(Incoming::Event(DriverEvent::Console { text })) => {
                hub.emit(PageEvent::Console { text });
            }
            Ok(Incoming::Event(DriverEvent::Binding { name, args })) => {
                let handler = bindings.lock().get(&name).cloned();
                match handler {
                    Some(handler) => handler(args),
                    None => debug!(binding = %name, "Call to unregistered binding"),
                }
            }
            Err(e) => debug!("Ignoring driver output {:?}: {}", line, e),
        }
    }

    // Dropping the senders fails every in-flight request.
    pending.lock().clear();
    debug!("Page driver output closed");
}

#[async_trait]
impl PageDriver for PlaywrightPage {
    fn events(&self) -> EventHub {
        self.hub.clone()
    }

    async fn expose_binding(&self, name: &str, handler: BindingHandler) -> SandboxResult<()> {
        self.bindings.lock().insert(name.to_string(), handler);
        self.request("expose", json!({ "name": name })).await?;
        Ok(())
    }

    async fn goto(&self, url: &str) -> SandboxResult<()> {
        debug!(url, "Navigating page");
        self.request("goto", json!({ "url": url })).await?;
        Ok(())
    }

    async fn reload(&self) -> SandboxResult<()> {
        self.request("reload", json!({})).await?;
        Ok(())
    }

    async fn evaluate(&self, function: &str, args: Vec<Value>) -> SandboxResult<Value> {
        self.request("evaluate", json!({ "source": function, "args": args }))
            .await
            .map_err(|e| match e {
                SandboxError::PageDriver(message) => SandboxError::Evaluation(message),
                other => other,
            })
    }

    async fn close(&self) -> SandboxResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let closed = self.request("close", json!({})).await;

        let mut child = self.child.lock().await;
        if tokio::time::timeout(Duration::from_secs(5), child.wait()).await.is_err() {
            warn!("Page driver did not exit, killing it");
            child.kill().await?;
        }
        self.reader.abort();

        match closed {
            // The driver may exit before its reply is flushed.
            Ok(_) | Err(SandboxError::PageDriver(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
