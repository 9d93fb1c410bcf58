//! Chromium-backed session using chromiumoxide.

use super::{BrowserSession, NetworkCallRecord, SessionFactory, WaitPolicy};
use crate::config::ScrapeConfig;
use crate::error::SessionError;
use crate::stealth;
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::EventRequestWillBeSent;
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::page::Page;
use chrono::Utc;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Find the Chromium binary path.
pub fn find_chromium() -> Option<PathBuf> {
    // 1. PAGESPEC_CHROMIUM_PATH env
    if let Ok(p) = std::env::var("PAGESPEC_CHROMIUM_PATH") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    // 2. ~/.pagespec/chromium/
    if let Some(home) = dirs::home_dir() {
        let candidates = if cfg!(target_os = "macos") {
            vec![
                home.join(".pagespec/chromium/chrome-mac-arm64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing"),
                home.join(".pagespec/chromium/chrome-mac-x64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing"),
                home.join(".pagespec/chromium/chrome"),
            ]
        } else {
            vec![
                home.join(".pagespec/chromium/chrome-linux64/chrome"),
                home.join(".pagespec/chromium/chrome"),
            ]
        };
        for c in candidates {
            if c.exists() {
                return Some(c);
            }
        }
    }

    // 3. System PATH
    for name in ["google-chrome", "chromium", "chromium-browser"] {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }

    // 4. Common macOS location
    if cfg!(target_os = "macos") {
        let common =
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome");
        if common.exists() {
            return Some(common);
        }
    }

    None
}

/// Launches one Chromium process and opens a fresh page per attempt.
pub struct ChromiumSessionFactory {
    browser: Browser,
    config: ScrapeConfig,
}

impl ChromiumSessionFactory {
    /// Launch a headless Chromium instance configured per `config`.
    pub async fn launch(config: &ScrapeConfig) -> Result<Self, SessionError> {
        let chrome_path = find_chromium().ok_or_else(|| {
            SessionError::Launch(
                "Chromium not found. Set PAGESPEC_CHROMIUM_PATH or install google-chrome"
                    .to_string(),
            )
        })?;

        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions");
        if config.headless {
            builder = builder.arg("--headless=new");
        }
        if config.stealth {
            builder = builder
                .arg("--disable-blink-features=AutomationControlled")
                .arg("--disable-infobars")
                .arg("--no-first-run")
                .arg("--no-default-browser-check")
                .arg("--disable-default-apps");
        }
        if let Some(proxy) = &config.proxy {
            builder = builder.arg(format!("--proxy-server={proxy}"));
        }
        let browser_config = builder
            .build()
            .map_err(|e| SessionError::Launch(format!("browser config: {e}")))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| SessionError::Launch(e.to_string()))?;

        // Spawn the CDP handler task
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                let _ = event;
            }
        });

        Ok(Self {
            browser,
            config: config.clone(),
        })
    }
}

#[async_trait]
impl SessionFactory for ChromiumSessionFactory {
    async fn open(&self) -> Result<Box<dyn BrowserSession>, SessionError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| SessionError::Launch(format!("new page: {e}")))?;

        if self.config.stealth {
            if let Err(e) = page.set_user_agent(stealth::random_user_agent()).await {
                tracing::warn!("user agent override failed: {e}");
            }
            page.execute(AddScriptToEvaluateOnNewDocumentParams::new(
                stealth::MASKING_SCRIPT,
            ))
            .await
            .map_err(|e| SessionError::Launch(format!("init script: {e}")))?;
        }

        Ok(Box::new(ChromiumSession {
            page,
            timeout_ms: self.config.default_timeout_ms,
            requests: Arc::new(Mutex::new(Vec::new())),
            capture_task: Mutex::new(None),
        }))
    }
}

/// One Chromium page.
pub struct ChromiumSession {
    page: Page,
    timeout_ms: u64,
    requests: Arc<Mutex<Vec<NetworkCallRecord>>>,
    capture_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChromiumSession {
    async fn eval_value(&self, script: &str) -> Result<serde_json::Value, SessionError> {
        let result = tokio::time::timeout(
            Duration::from_millis(self.timeout_ms),
            self.page.evaluate(script),
        )
        .await
        .map_err(|_| SessionError::Timeout(self.timeout_ms))?
        .map_err(|e| SessionError::Evaluation(e.to_string()))?;

        // `undefined` carries no value; surface it as null.
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn navigate(&self, url: &str, wait: WaitPolicy) -> Result<(), SessionError> {
        let result = tokio::time::timeout(
            Duration::from_millis(self.timeout_ms),
            self.page.goto(url),
        )
        .await;

        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(SessionError::Navigation(e.to_string())),
            Err(_) => {
                return Err(SessionError::Navigation(format!(
                    "timed out after {}ms",
                    self.timeout_ms
                )))
            }
        }

        match wait {
            WaitPolicy::None => Ok(()),
            WaitPolicy::DocumentReady => {
                let _ = self.page.wait_for_navigation().await;
                Ok(())
            }
            WaitPolicy::IdleNetwork => {
                let _ = self.page.wait_for_navigation().await;
                // chromiumoxide has no networkidle event; poll readyState
                // and require one quiet interval, bounded by the timeout.
                let deadline = tokio::time::Instant::now()
                    + Duration::from_millis(self.timeout_ms.min(15_000));
                loop {
                    let state = self
                        .eval_value("document.readyState")
                        .await
                        .ok()
                        .and_then(|v| v.as_str().map(String::from))
                        .unwrap_or_default();
                    if state == "complete" {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        return Ok(());
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Ok(());
                    }
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            }
        }
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, SessionError> {
        self.eval_value(script).await
    }

    async fn click(&self, selector: &str) -> Result<(), SessionError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|_| SessionError::ElementNotFound(selector.to_string()))?;
        element
            .click()
            .await
            .map(|_| ())
            .map_err(|e| SessionError::Evaluation(format!("click {selector}: {e}")))
    }

    async fn inner_text(&self, selector: &str) -> Result<String, SessionError> {
        let sel = serde_json::to_string(selector)
            .map_err(|e| SessionError::Evaluation(e.to_string()))?;
        let script = format!(
            "(() => {{ const el = document.querySelector({sel}); return el ? el.innerText : null; }})()"
        );
        match self.eval_value(&script).await? {
            serde_json::Value::String(text) => Ok(text),
            _ => Err(SessionError::ElementNotFound(selector.to_string())),
        }
    }

    async fn title(&self) -> Result<String, SessionError> {
        let value = self.eval_value("document.title").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn current_url(&self) -> Result<String, SessionError> {
        let url = self
            .page
            .url()
            .await
            .map_err(|e| SessionError::Evaluation(e.to_string()))?
            .map(|u| u.to_string())
            .unwrap_or_default();
        Ok(url)
    }

    async fn begin_network_capture(&self) -> Result<(), SessionError> {
        let mut listener = self
            .page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(|e| SessionError::Evaluation(format!("network listener: {e}")))?;

        let requests = Arc::clone(&self.requests);
        let task = tokio::spawn(async move {
            while let Some(event) = listener.next().await {
                let record = NetworkCallRecord {
                    url: event.request.url.clone(),
                    method: event.request.method.clone(),
                    resource_kind: event
                        .r#type
                        .as_ref()
                        .map(|t| format!("{t:?}").to_lowercase())
                        .unwrap_or_else(|| "other".to_string()),
                    timestamp: Utc::now(),
                };
                if let Ok(mut log) = requests.lock() {
                    log.push(record);
                }
            }
        });

        let mut slot = self
            .capture_task
            .lock()
            .map_err(|_| SessionError::Evaluation("capture task lock poisoned".to_string()))?;
        if let Some(old) = slot.replace(task) {
            old.abort();
        }
        Ok(())
    }

    fn captured_requests(&self) -> Vec<NetworkCallRecord> {
        self.requests
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    async fn close(self: Box<Self>) -> Result<(), SessionError> {
        if let Ok(mut slot) = self.capture_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
        let _ = self.page.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionFactory;

    #[tokio::test]
    #[ignore] // Requires Chromium to be installed
    async fn test_navigate_and_evaluate() {
        let config = ScrapeConfig {
            stealth: false,
            ..ScrapeConfig::default()
        };
        let factory = ChromiumSessionFactory::launch(&config)
            .await
            .expect("failed to launch browser");
        let session = factory.open().await.expect("failed to open session");

        session
            .navigate(
                "data:text/html,<h1>Hello</h1><details><summary>more</summary><p>hidden</p></details>",
                WaitPolicy::DocumentReady,
            )
            .await
            .expect("navigation failed");

        let heading = session
            .evaluate("document.querySelector('h1').textContent")
            .await
            .expect("evaluation failed");
        assert_eq!(heading.as_str().unwrap(), "Hello");

        let url = session.current_url().await.expect("url failed");
        assert!(url.starts_with("data:text/html"));

        session.close().await.expect("close failed");
    }
}
