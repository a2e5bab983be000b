use crate::error::{RenderError, ResourceError};
use crate::util::command_exists;
use headless_chrome::protocol::cdp::types::Event;
use headless_chrome::protocol::cdp::Log::LogEntryLevel;
use headless_chrome::protocol::cdp::Page::{self, CaptureScreenshotFormatOption};
use headless_chrome::protocol::cdp::Runtime::{ConsoleAPICalledEventTypeOption, RemoteObject};
use headless_chrome::{Browser, LaunchOptionsBuilder, Tab};
use image::imageops::{self, FilterType};
use image::RgbaImage;
use log::debug;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::env;
use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::future::Future;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const CANVAS_CHECK: &str = "!!document.querySelector('canvas')";
const CANVAS_POLL: Duration = Duration::from_millis(100);
/// Lets `draw()` run at least once after the canvas appears.
const SETTLE: Duration = Duration::from_millis(200);
/// Large enough for any viewport the config allows; captures are clipped.
const WINDOW: (u32, u32) = (1600, 1200);
const IDLE_BROWSER_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 400,
            height: 400,
        }
    }
}

/// Why a render did not come out clean.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum RenderIssue {
    LoadTimeout,
    UncaughtException(String),
    ConsoleError(String),
    NoDrawingSurface,
    CaptureFailed(String),
}

impl fmt::Display for RenderIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderIssue::LoadTimeout => write!(f, "page load timed out"),
            RenderIssue::UncaughtException(msg) => write!(f, "uncaught exception: {msg}"),
            RenderIssue::ConsoleError(msg) => write!(f, "console error: {msg}"),
            RenderIssue::NoDrawingSurface => write!(f, "no canvas was created"),
            RenderIssue::CaptureFailed(msg) => write!(f, "capture failed: {msg}"),
        }
    }
}

impl From<RenderError> for RenderIssue {
    fn from(err: RenderError) -> Self {
        match err {
            RenderError::Timeout(_) => RenderIssue::LoadTimeout,
            RenderError::Capture(msg) => RenderIssue::CaptureFailed(msg),
        }
    }
}

/// Numbered, one issue per line; the form sent to the repair prompt.
pub fn describe_issues(issues: &[RenderIssue]) -> String {
    issues
        .iter()
        .enumerate()
        .map(|(idx, issue)| format!("{}. {issue}", idx + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone)]
pub struct Capture {
    pub image: RgbaImage,
    pub console_errors: Vec<String>,
    pub uncaught_errors: Vec<String>,
    pub has_drawing_surface: bool,
}

impl Capture {
    pub fn issues(&self) -> Vec<RenderIssue> {
        let mut issues: Vec<RenderIssue> = self
            .uncaught_errors
            .iter()
            .cloned()
            .map(RenderIssue::UncaughtException)
            .collect();
        issues.extend(
            self.console_errors
                .iter()
                .cloned()
                .map(RenderIssue::ConsoleError),
        );
        if !self.has_drawing_surface {
            issues.push(RenderIssue::NoDrawingSurface);
        }
        issues
    }

    pub fn is_clean(&self) -> bool {
        self.has_drawing_surface
            && self.uncaught_errors.is_empty()
            && self.console_errors.is_empty()
    }
}

/// An isolated rendering context owned by one session.
pub trait RenderContext: Send {
    fn capture(
        &mut self,
        source: &str,
        viewport: Viewport,
        timeout: Duration,
    ) -> impl Future<Output = Result<Capture, RenderError>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Hands out independent contexts so concurrent sessions never share a page.
pub trait Renderer: Send + Sync {
    type Context: RenderContext;

    fn open(&self) -> impl Future<Output = Result<Self::Context, ResourceError>> + Send;
}

pub fn resolve_chrome_executable(override_bin: Option<&str>) -> Option<String> {
    if let Some(bin) = override_bin.map(str::trim).filter(|b| !b.is_empty()) {
        return Some(bin.to_string());
    }
    if let Ok(bin) = env::var("SKETCH_LOOP_CHROME") {
        if !bin.trim().is_empty() {
            return Some(bin.trim().to_string());
        }
    }
    [
        "chromium",
        "chromium-browser",
        "google-chrome",
        "google-chrome-stable",
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    ]
    .into_iter()
    .find(|candidate| command_exists(candidate))
    .map(str::to_string)
}

/// Headless Chrome driven over the DevTools protocol. One browser process is
/// shared by every context; each context gets its own tab.
#[derive(Default)]
pub struct ChromeRenderer {
    bin: Option<String>,
    browser: Arc<Mutex<Option<Browser>>>,
}

impl ChromeRenderer {
    pub fn new(bin: Option<String>) -> Self {
        Self {
            bin,
            browser: Arc::default(),
        }
    }
}

impl Renderer for ChromeRenderer {
    type Context = ChromeContext;

    async fn open(&self) -> Result<ChromeContext, ResourceError> {
        let bin = resolve_chrome_executable(self.bin.as_deref()).ok_or_else(|| {
            ResourceError::RendererUnavailable(
                "no chromium/chrome binary found; set SKETCH_LOOP_CHROME".to_string(),
            )
        })?;
        if bin.contains('/') && !Path::new(&bin).is_file() {
            return Err(ResourceError::RendererUnavailable(format!(
                "browser binary not found: {bin}"
            )));
        }

        let slot = Arc::clone(&self.browser);
        let (tab, events) = tokio::task::spawn_blocking(move || open_tab(&slot, &bin))
            .await
            .map_err(|err| ResourceError::Context(format!("browser worker panicked: {err}")))??;
        let pages = tempfile::Builder::new()
            .prefix("sketch-loop-pages-")
            .tempdir()
            .map_err(|err| ResourceError::Context(err.to_string()))?;
        debug!("opened chrome tab, pages under {}", pages.path().display());
        Ok(ChromeContext {
            tab: Some(tab),
            events,
            pages: Some(pages),
            captures: 0,
        })
    }
}

fn open_tab(
    slot: &Mutex<Option<Browser>>,
    bin: &str,
) -> Result<(Arc<Tab>, Arc<Mutex<PageEvents>>), ResourceError> {
    let mut browser = slot.lock();
    match browser.as_ref().map(attach_tab) {
        Some(Ok(opened)) => return Ok(opened),
        Some(Err(err)) => {
            debug!("browser stopped answering, relaunching: {err}");
            *browser = None;
        }
        None => {}
    }
    let launched = launch_browser(bin)?;
    let opened = attach_tab(&launched)?;
    *browser = Some(launched);
    Ok(opened)
}

fn launch_browser(bin: &str) -> Result<Browser, ResourceError> {
    let options = LaunchOptionsBuilder::default()
        .headless(true)
        .sandbox(false)
        .path(Some(PathBuf::from(bin)))
        .window_size(Some(WINDOW))
        .idle_browser_timeout(IDLE_BROWSER_TIMEOUT)
        .args(vec![
            OsStr::new("--force-device-scale-factor=1"),
            OsStr::new("--force-color-profile=srgb"),
            OsStr::new("--allow-file-access-from-files"),
            OsStr::new("--hide-scrollbars"),
            OsStr::new("--disable-gpu"),
            OsStr::new("--disable-dev-shm-usage"),
            OsStr::new("--disable-extensions"),
        ])
        .build()
        .map_err(|err| ResourceError::RendererUnavailable(err.to_string()))?;
    debug!("launching {bin}");
    Browser::new(options).map_err(|err| {
        ResourceError::RendererUnavailable(format!("failed to launch {bin}: {err:#}"))
    })
}

fn attach_tab(browser: &Browser) -> Result<(Arc<Tab>, Arc<Mutex<PageEvents>>), ResourceError> {
    let context = |err: anyhow::Error| ResourceError::Context(format!("{err:#}"));
    let tab = browser.new_tab().map_err(context)?;
    tab.enable_runtime().map_err(context)?;
    tab.enable_log().map_err(context)?;

    let events = Arc::new(Mutex::new(PageEvents::default()));
    let sink = Arc::clone(&events);
    tab.add_event_listener(Arc::new(move |event: &Event| sink.lock().record(event)))
        .map_err(context)?;
    Ok((tab, events))
}

/// Runtime errors reported by the tab since the last capture started.
#[derive(Debug, Default)]
struct PageEvents {
    uncaught: Vec<String>,
    console: Vec<String>,
}

impl PageEvents {
    fn record(&mut self, event: &Event) {
        match event {
            Event::RuntimeExceptionThrown(thrown) => {
                let details = &thrown.params.exception_details;
                let description = details
                    .exception
                    .as_ref()
                    .and_then(|e| e.description.as_deref());
                self.uncaught
                    .push(exception_message(&details.text, description));
            }
            Event::RuntimeConsoleAPICalled(called)
                if called.params.Type == ConsoleAPICalledEventTypeOption::Error =>
            {
                self.console.push(console_message(&called.params.args));
            }
            Event::LogEntryAdded(added) if added.params.entry.level == LogEntryLevel::Error => {
                self.console.push(added.params.entry.text.clone());
            }
            _ => {}
        }
    }
}

/// First line of the thrown value's description, else the CDP summary text.
fn exception_message(text: &str, description: Option<&str>) -> String {
    description
        .and_then(|d| d.lines().next())
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .unwrap_or_else(|| text.trim())
        .to_string()
}

fn console_message(args: &[RemoteObject]) -> String {
    args.iter()
        .map(|arg| remote_text(arg.value.as_ref(), arg.description.as_deref()))
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn remote_text(value: Option<&Value>, description: Option<&str>) -> String {
    match value {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) | None => description.unwrap_or_default().to_string(),
        Some(other) => other.to_string(),
    }
}

pub struct ChromeContext {
    tab: Option<Arc<Tab>>,
    events: Arc<Mutex<PageEvents>>,
    pages: Option<TempDir>,
    captures: u32,
}

impl RenderContext for ChromeContext {
    async fn capture(
        &mut self,
        source: &str,
        viewport: Viewport,
        timeout: Duration,
    ) -> Result<Capture, RenderError> {
        let closed = || RenderError::Capture("render context already closed".to_string());
        let tab = self.tab.clone().ok_or_else(closed)?;
        let dir = self
            .pages
            .as_ref()
            .map(|p| p.path().to_path_buf())
            .ok_or_else(closed)?;

        self.captures += 1;
        let page = dir.join(format!("page-{:02}.html", self.captures));
        fs::write(&page, source).map_err(|err| RenderError::Capture(err.to_string()))?;

        let job = CaptureJob {
            tab,
            events: Arc::clone(&self.events),
            url: page_url(&page),
            viewport,
            timeout,
        };
        tokio::task::spawn_blocking(move || job.run())
            .await
            .map_err(|err| RenderError::Capture(format!("render worker panicked: {err}")))?
    }

    async fn close(&mut self) {
        if let Some(tab) = self.tab.take() {
            match tokio::task::spawn_blocking(move || tab.close(false)).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => debug!("failed to close chrome tab: {err:#}"),
                Err(err) => debug!("tab close worker panicked: {err}"),
            }
        }
        if let Some(pages) = self.pages.take() {
            let path = pages.path().display().to_string();
            if let Err(err) = pages.close() {
                debug!("failed to remove page dir {path}: {err}");
            }
        }
    }
}

struct CaptureJob {
    tab: Arc<Tab>,
    events: Arc<Mutex<PageEvents>>,
    url: String,
    viewport: Viewport,
    timeout: Duration,
}

impl CaptureJob {
    fn run(self) -> Result<Capture, RenderError> {
        let started = Instant::now();
        *self.events.lock() = PageEvents::default();
        self.tab.set_default_timeout(self.timeout);
        debug!(
            "rendering {} at {}x{}",
            self.url, self.viewport.width, self.viewport.height
        );

        let loaded = self
            .tab
            .navigate_to(&self.url)
            .and_then(|tab| tab.wait_until_navigated());
        if let Err(err) = loaded {
            if started.elapsed() >= self.timeout {
                return Err(RenderError::Timeout(self.timeout));
            }
            return Err(RenderError::Capture(format!("{err:#}")));
        }

        let has_drawing_surface = self.wait_for_canvas(started);
        if has_drawing_surface {
            thread::sleep(SETTLE);
        }
        let image = self.screenshot()?;
        let events = mem::take(&mut *self.events.lock());
        Ok(Capture {
            image,
            console_errors: events.console,
            uncaught_errors: events.uncaught,
            has_drawing_surface,
        })
    }

    /// Polls until a canvas exists, the load budget runs out, or the page
    /// has already thrown.
    fn wait_for_canvas(&self, started: Instant) -> bool {
        loop {
            match self.tab.evaluate(CANVAS_CHECK, false) {
                Ok(result) if result.value.as_ref().and_then(Value::as_bool) == Some(true) => {
                    return true;
                }
                Ok(_) => {}
                Err(err) => debug!("canvas check failed: {err:#}"),
            }
            if started.elapsed() >= self.timeout || !self.events.lock().uncaught.is_empty() {
                return false;
            }
            thread::sleep(CANVAS_POLL);
        }
    }

    fn screenshot(&self) -> Result<RgbaImage, RenderError> {
        let Viewport { width, height } = self.viewport;
        let clip = Page::Viewport {
            x: 0.0,
            y: 0.0,
            width: f64::from(width),
            height: f64::from(height),
            scale: 1.0,
        };
        let png = self
            .tab
            .capture_screenshot(CaptureScreenshotFormatOption::Png, None, Some(clip), true)
            .map_err(|err| RenderError::Capture(format!("screenshot failed: {err:#}")))?;
        let image = image::load_from_memory(&png)
            .map_err(|err| RenderError::Capture(format!("unreadable screenshot: {err}")))?
            .to_rgba8();
        if image.dimensions() == (width, height) {
            Ok(image)
        } else {
            Ok(imageops::resize(&image, width, height, FilterType::Triangle))
        }
    }
}

fn page_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::solid_image;
    use serde_json::json;

    #[test]
    fn capture_issue_order() {
        let capture = Capture {
            image: solid_image(2, 2, [255, 255, 255, 255]),
            console_errors: vec!["late".to_string()],
            uncaught_errors: vec!["boom".to_string()],
            has_drawing_surface: false,
        };
        assert!(!capture.is_clean());
        assert_eq!(
            capture.issues(),
            vec![
                RenderIssue::UncaughtException("boom".to_string()),
                RenderIssue::ConsoleError("late".to_string()),
                RenderIssue::NoDrawingSurface,
            ]
        );
        assert_eq!(
            describe_issues(&capture.issues()),
            "1. uncaught exception: boom\n2. console error: late\n3. no canvas was created"
        );
    }

    #[test]
    fn missing_canvas_alone_is_unclean() {
        let capture = Capture {
            image: solid_image(2, 2, [255, 255, 255, 255]),
            console_errors: Vec::new(),
            uncaught_errors: Vec::new(),
            has_drawing_surface: false,
        };
        assert!(!capture.is_clean());
        assert_eq!(capture.issues(), vec![RenderIssue::NoDrawingSurface]);
    }

    #[test]
    fn timeout_maps_to_load_timeout_issue() {
        let issue: RenderIssue = RenderError::Timeout(Duration::from_secs(10)).into();
        assert_eq!(issue, RenderIssue::LoadTimeout);
    }

    #[test]
    fn exception_message_prefers_thrown_description() {
        let description = "ReferenceError: fil is not defined\n    at setup (page-01.html:9:3)";
        assert_eq!(
            exception_message("Uncaught", Some(description)),
            "ReferenceError: fil is not defined"
        );
        assert_eq!(exception_message(" Uncaught ", None), "Uncaught");
        assert_eq!(exception_message("Uncaught", Some("")), "Uncaught");
    }

    #[test]
    fn console_values_render_as_text() {
        assert_eq!(remote_text(Some(&json!("bad color")), None), "bad color");
        assert_eq!(remote_text(Some(&json!(42)), None), "42");
        assert_eq!(
            remote_text(None, Some("TypeError: x is null")),
            "TypeError: x is null"
        );
        assert_eq!(remote_text(Some(&Value::Null), None), "");
    }

    #[test]
    fn pages_load_from_file_urls() {
        assert_eq!(
            page_url(Path::new("/tmp/pages/page-01.html")),
            "file:///tmp/pages/page-01.html"
        );
    }

    #[tokio::test]
    async fn missing_browser_is_a_resource_error() {
        let renderer = ChromeRenderer::new(Some("/nonexistent/chrome".to_string()));
        assert!(matches!(
            renderer.open().await.err(),
            Some(ResourceError::RendererUnavailable(_))
        ));
    }
}
