//! chromiumoxide-backed implementation of the browser capability surface.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType, InsertTextParams, MouseButton,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::layout::Point;
use chromiumoxide::page::{Page, ScreenshotParamsBuilder};
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::capability::{BrowserCapability, PrimitiveInput};
use crate::error::CapabilityError;
use crate::snapshot::{PageSnapshot, RawNode, ScrollState, TabInfo, Viewport};

#[derive(Clone)]
pub struct ChromiumConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
    pub viewport: Viewport,
}

impl Default for ChromiumConfig {
    fn default() -> Self {
        Self { headless: true, user_agent: None, viewport: Viewport::default() }
    }
}

/// One exclusively-owned browser session. Tab handles, like element
/// indices, are valid within the snapshot that produced them only.
pub struct ChromiumSession {
    browser: OxideBrowser,
    page: Mutex<Page>,
    viewport: Viewport,
}

impl ChromiumSession {
    pub async fn launch(cfg: ChromiumConfig) -> Result<Self, CapabilityError> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // Unique user data dir per run avoids ProcessSingleton profile lock
        // conflicts when sessions are spawned in quick succession.
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("webpilot-profile-{}-{}", std::process::id(), ts));
        let _ = std::fs::create_dir_all(&profile_dir);
        builder = builder
            .user_data_dir(profile_dir.clone())
            .arg(format!("--user-data-dir={}", profile_dir.display()))
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder
            .build()
            .map_err(CapabilityError::protocol)?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg).await.map_err(cap_err)?;
        tokio::spawn(async move { while handler.next().await.is_some() {} });

        let page = browser.new_page("about:blank").await.map_err(cap_err)?;
        if let Some(ua) = cfg.user_agent {
            page.set_user_agent(ua).await.map_err(cap_err)?;
        }
        // Non-zero viewport up front; screenshots fail on a 0-width target.
        let _ = page
            .execute(
                SetDeviceMetricsOverrideParams::builder()
                    .width(cfg.viewport.width as i64)
                    .height(cfg.viewport.height as i64)
                    .device_scale_factor(1.0)
                    .mobile(false)
                    .build()
                    .map_err(CapabilityError::protocol)?,
            )
            .await;
        Ok(Self { browser, page: Mutex::new(page), viewport: cfg.viewport })
    }

    /// Attach to an already-running browser over its devtools websocket.
    pub async fn connect(ws_url: &str, viewport: Viewport) -> Result<Self, CapabilityError> {
        let (browser, mut handler) = OxideBrowser::connect(ws_url).await.map_err(cap_err)?;
        tokio::spawn(async move { while handler.next().await.is_some() {} });
        let page = browser.new_page("about:blank").await.map_err(cap_err)?;
        Ok(Self { browser, page: Mutex::new(page), viewport })
    }

    async fn eval_string(&self, page: &Page, js: &str) -> Result<String, CapabilityError> {
        page.evaluate(js)
            .await
            .map_err(cap_err)?
            .into_value::<String>()
            .map_err(|e| CapabilityError::protocol(format!("evaluate result: {e}")))
    }

    async fn eval_bool(&self, page: &Page, js: &str) -> Result<bool, CapabilityError> {
        page.evaluate(js)
            .await
            .map_err(cap_err)?
            .into_value::<bool>()
            .map_err(|e| CapabilityError::protocol(format!("evaluate result: {e}")))
    }

    async fn tab_list(&self, current: &Page) -> Result<Vec<TabInfo>, CapabilityError> {
        let pages = self.browser.pages().await.map_err(cap_err)?;
        let mut tabs = Vec::with_capacity(pages.len());
        for (i, p) in pages.iter().enumerate() {
            let url = p.url().await.map_err(cap_err)?.unwrap_or_default();
            let active = p.target_id() == current.target_id();
            let title = if active {
                self.eval_string(p, "document.title").await.unwrap_or_default()
            } else {
                String::new()
            };
            tabs.push(TabInfo { id: format!("tab-{i}"), url, title, active });
        }
        Ok(tabs)
    }

    async fn page_for_tab(&self, tab_id: &str) -> Result<Page, CapabilityError> {
        let pos: usize = tab_id
            .strip_prefix("tab-")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| CapabilityError::invalid_target(format!("bad tab id {tab_id}")))?;
        let pages = self.browser.pages().await.map_err(cap_err)?;
        pages
            .into_iter()
            .nth(pos)
            .ok_or_else(|| CapabilityError::invalid_target(format!("tab {tab_id} is gone")))
    }
}

#[async_trait]
impl BrowserCapability for ChromiumSession {
    async fn snapshot(&self) -> Result<PageSnapshot, CapabilityError> {
        let page = self.page.lock().await;
        let raw = self.eval_string(&page, SNAPSHOT_JS).await?;
        let capture: JsCapture = serde_json::from_str(&raw)
            .map_err(|e| CapabilityError::protocol(format!("snapshot parse: {e}")))?;
        let tabs = self.tab_list(&page).await?;
        debug!(url = %capture.url, nodes = capture.tree.len(), "captured page snapshot");
        Ok(PageSnapshot {
            url: capture.url,
            title: capture.title,
            viewport: Viewport {
                width: capture.viewport_width,
                height: capture.viewport_height,
            },
            scroll: ScrollState {
                x: capture.scroll_x,
                y: capture.scroll_y,
                pixels_below: capture.pixels_below,
            },
            tabs,
            tree: capture.tree,
            captured_at_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        })
    }

    async fn navigate(&self, url: &str) -> Result<(), CapabilityError> {
        let page = self.page.lock().await;
        page.goto(url).await.map_err(cap_err)?;
        page.wait_for_navigation().await.map_err(cap_err)?;
        Ok(())
    }

    async fn dispatch(&self, input: PrimitiveInput) -> Result<(), CapabilityError> {
        match input {
            PrimitiveInput::ClickAt { x, y } => {
                let page = self.page.lock().await;
                let cmd = DispatchMouseEventParams::builder()
                    .x(x)
                    .y(y)
                    .button(MouseButton::Left)
                    .click_count(1);
                page.move_mouse(Point { x, y })
                    .await
                    .map_err(cap_err)?
                    .execute(
                        cmd.clone()
                            .r#type(DispatchMouseEventType::MousePressed)
                            .build()
                            .map_err(CapabilityError::protocol)?,
                    )
                    .await
                    .map_err(cap_err)?;
                page.execute(
                    cmd.r#type(DispatchMouseEventType::MouseReleased)
                        .build()
                        .map_err(CapabilityError::protocol)?,
                )
                .await
                .map_err(cap_err)?;
            }
            PrimitiveInput::TypeInto { selector, text } => {
                let page = self.page.lock().await;
                let js = format!(
                    "(() => {{ const el = document.querySelector({}); if (!el) return false; el.focus(); return true; }})()",
                    js_string(&selector)
                );
                if !self.eval_bool(&page, &js).await? {
                    return Err(CapabilityError::invalid_target(format!(
                        "no element for selector {selector}"
                    )));
                }
                page.execute(InsertTextParams { text }).await.map_err(cap_err)?;
            }
            PrimitiveInput::KeyPress { key } => {
                let page = self.page.lock().await;
                let js = format!(
                    r#"(function() {{
                        const el = document.activeElement || document.body;
                        const opts = {{key: {k}, code: {k}, bubbles: true}};
                        el.dispatchEvent(new KeyboardEvent("keydown", opts));
                        el.dispatchEvent(new KeyboardEvent("keyup", opts));
                    }})()"#,
                    k = js_string(&key)
                );
                page.evaluate(js).await.map_err(cap_err)?;
            }
            PrimitiveInput::ScrollBy { dx, dy } => {
                let page = self.page.lock().await;
                page.evaluate(format!("window.scrollBy({dx}, {dy})"))
                    .await
                    .map_err(cap_err)?;
            }
            PrimitiveInput::SelectOption { selector, value } => {
                let page = self.page.lock().await;
                let js = format!(
                    r#"(() => {{
                        const sel = document.querySelector({s});
                        if (!sel || !sel.options) return false;
                        const opt = Array.from(sel.options).find(o => o.value === {v} || o.text === {v});
                        if (!opt) return false;
                        sel.value = opt.value;
                        sel.dispatchEvent(new Event('change', {{ bubbles: true }}));
                        return true;
                    }})()"#,
                    s = js_string(&selector),
                    v = js_string(&value)
                );
                if !self.eval_bool(&page, &js).await? {
                    return Err(CapabilityError::invalid_target(format!(
                        "option \"{value}\" not found in {selector}"
                    )));
                }
            }
            PrimitiveInput::ActivateTab { tab_id } => {
                let target = self.page_for_tab(&tab_id).await?;
                target.bring_to_front().await.map_err(cap_err)?;
                *self.page.lock().await = target;
            }
            PrimitiveInput::GoBack => {
                let page = self.page.lock().await;
                page.evaluate("history.back()").await.map_err(cap_err)?;
                page.wait_for_navigation().await.map_err(cap_err)?;
            }
        }
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, CapabilityError> {
        let page = self.page.lock().await;
        page.screenshot(
            ScreenshotParamsBuilder::default()
                .full_page(false)
                .omit_background(true)
                .build(),
        )
        .await
        .map_err(cap_err)
    }

    async fn close(&self) -> Result<(), CapabilityError> {
        // Dropping the handles is enough for a launched browser; an explicit
        // blank navigation flushes pending work on connected ones.
        let page = self.page.lock().await;
        let _ = page.goto("about:blank").await;
        Ok(())
    }
}

impl ChromiumSession {
    pub fn viewport(&self) -> Viewport {
        self.viewport
    }
}

fn cap_err(e: CdpError) -> CapabilityError {
    match e {
        CdpError::Timeout => CapabilityError::timeout("cdp call timed out"),
        other => {
            let msg = other.to_string();
            let lower = msg.to_lowercase();
            if lower.contains("websocket") || lower.contains("channel") || lower.contains("closed")
            {
                CapabilityError::disconnected(msg)
            } else {
                CapabilityError::protocol(msg)
            }
        }
    }
}

fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".into())
}

#[derive(Deserialize)]
struct JsCapture {
    url: String,
    title: String,
    viewport_width: u32,
    viewport_height: u32,
    scroll_x: f64,
    scroll_y: f64,
    pixels_below: f64,
    tree: Vec<RawNode>,
}

/// Injected page walker. Produces the raw node tree with page-global
/// geometry (iframe offsets folded in), visibility/occlusion hints and a
/// best-effort CSS selector per interactive element.
const SNAPSHOT_JS: &str = r#"
(() => {
    const INTERACTIVE = 'a, button, input, select, textarea, [role="button"], [role="link"], [role="tab"], [role="menuitem"], [onclick], [contenteditable="true"], [tabindex]';
    const SKIP = new Set(['SCRIPT', 'STYLE', 'NOSCRIPT', 'TEMPLATE', 'HEAD', 'META', 'LINK']);
    const MAX_DEPTH = 96;

    function selectorFor(el) {
        const tag = el.tagName.toLowerCase();
        if (el.id) return '#' + CSS.escape(el.id);
        if (el.name && (tag === 'input' || tag === 'select' || tag === 'textarea')) {
            return tag + '[name=' + JSON.stringify(el.name) + ']';
        }
        const aria = el.getAttribute('aria-label');
        if (aria) return tag + '[aria-label=' + JSON.stringify(aria) + ']';
        const testid = el.getAttribute('data-testid');
        if (testid) return '[data-testid=' + JSON.stringify(testid) + ']';
        const parts = [];
        let node = el;
        while (node && node !== node.ownerDocument.body && parts.length < 4) {
            let s = node.tagName.toLowerCase();
            if (node.id) { parts.unshift('#' + CSS.escape(node.id)); break; }
            const parent = node.parentElement;
            if (parent) {
                const siblings = Array.from(parent.children).filter(c => c.tagName === node.tagName);
                if (siblings.length > 1) s += ':nth-of-type(' + (siblings.indexOf(node) + 1) + ')';
            }
            parts.unshift(s);
            node = parent;
        }
        return parts.join(' > ');
    }

    function ownText(el) {
        let t = '';
        for (const c of el.childNodes) {
            if (c.nodeType === Node.TEXT_NODE) t += c.textContent;
        }
        t = t.trim().replace(/\s+/g, ' ');
        if (!t && (el.tagName === 'A' || el.tagName === 'BUTTON')) {
            t = (el.textContent || '').trim().replace(/\s+/g, ' ');
        }
        return t.length > 120 ? t.substring(0, 117) + '...' : t;
    }

    function walk(el, doc, win, offX, offY, frameTag, depth) {
        if (depth > MAX_DEPTH) return null;
        if (SKIP.has(el.tagName)) return null;

        const rect = el.getBoundingClientRect();
        const style = win.getComputedStyle(el);
        const visible = rect.width >= 2 && rect.height >= 2
            && style.display !== 'none' && style.visibility !== 'hidden'
            && parseFloat(style.opacity) >= 0.1;
        const interactable = el.matches(INTERACTIVE) && !el.disabled;

        let occluded = false;
        if (interactable && visible) {
            const cx = rect.x + rect.width / 2, cy = rect.y + rect.height / 2;
            if (cx >= 0 && cy >= 0 && cx < win.innerWidth && cy < win.innerHeight) {
                const top = doc.elementFromPoint(cx, cy);
                occluded = !!top && top !== el && !el.contains(top) && !top.contains(el);
            }
        }

        const attributes = {};
        for (const a of ['type', 'placeholder', 'href', 'name', 'title', 'alt']) {
            const v = el.getAttribute(a);
            if (v) attributes[a] = v;
        }
        if ((el.tagName === 'INPUT' || el.tagName === 'TEXTAREA')
            && el.type !== 'password' && el.value) {
            attributes['value'] = String(el.value).substring(0, 60);
        }
        if (el.checked) attributes['checked'] = 'true';

        const node = {
            tag: el.tagName.toLowerCase(),
            role: el.getAttribute('role'),
            text: el.getAttribute('aria-label') || ownText(el),
            attributes,
            bounds: { x: rect.x + offX, y: rect.y + offY, width: rect.width, height: rect.height },
            visible,
            interactable,
            occluded,
            selector: interactable ? selectorFor(el) : null,
            frame: frameTag,
            children: []
        };

        if (el.tagName === 'IFRAME') {
            try {
                const idoc = el.contentDocument;
                const iwin = el.contentWindow;
                if (idoc && idoc.body) {
                    const tag = frameTag ? frameTag + '/' + (el.name || el.id || 'iframe') : (el.name || el.id || 'iframe');
                    const child = walk(idoc.body, idoc, iwin, rect.x + offX, rect.y + offY, tag, depth + 1);
                    if (child) node.children.push(child);
                }
            } catch (e) { /* cross-origin frame: leave it opaque */ }
            return node;
        }

        for (const c of el.children) {
            const child = walk(c, doc, win, offX, offY, frameTag, depth + 1);
            if (child) node.children.push(child);
        }
        return node;
    }

    const root = walk(document.body, document, window, 0, 0, null, 0);
    const below = Math.max(0, (document.documentElement.scrollHeight || 0) - window.scrollY - window.innerHeight);
    return JSON.stringify({
        url: location.href,
        title: document.title,
        viewport_width: window.innerWidth,
        viewport_height: window.innerHeight,
        scroll_x: window.scrollX,
        scroll_y: window.scrollY,
        pixels_below: below,
        tree: root ? [root] : []
    });
})()
"#;
