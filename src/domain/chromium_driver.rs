//! Production [`PageDriver`](crate::domain::pool::PageDriver) backed by
//! `chromiumoxide`. Every method lowers directly onto the corresponding
//! CDP call; no retry or timing logic lives here — that belongs to the
//! executor (§4.4) and the pool's refresh/recovery discipline (§4.2,
//! §4.3).

use std::sync::Arc;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::input::{DispatchKeyEventParams, DispatchKeyEventType};
use chromiumoxide::page::Page;
use futures::StreamExt;

use crate::domain::pool::{PageDriver, PageDriverFactory};
use crate::error::{PoolError, Result};

/// Drives one `chromiumoxide` page. Each court owns exactly one of these
/// (§4.2), created once at startup and replaced wholesale on recovery
/// (§4.3) rather than mutated in place.
pub struct ChromiumPageDriver {
    page: Page,
}

impl ChromiumPageDriver {
    pub fn new(page: Page) -> Self {
        ChromiumPageDriver { page }
    }
}

#[async_trait]
impl PageDriver for ChromiumPageDriver {
    async fn navigate(&self, url: &str) -> Result<()> {
        self.page
            .goto(url)
            .await
            .map_err(|e| PoolError::NavigationFailed { court: 0, message: e.to_string() })?;
        self.page
            .wait_for_navigation()
            .await
            .map_err(|e| PoolError::NavigationFailed { court: 0, message: e.to_string() })?;
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        self.page.reload().await.map_err(|e| PoolError::EvaluationFailed(e.to_string()))?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.page.url().await.map_err(|e| PoolError::EvaluationFailed(e.to_string()))?.unwrap_or_default())
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value> {
        let result = self.page.evaluate(script).await.map_err(|e| PoolError::EvaluationFailed(e.to_string()))?;
        result.into_value::<serde_json::Value>().map_err(|e| PoolError::EvaluationFailed(e.to_string()).into())
    }

    async fn text_content(&self) -> Result<String> {
        let value = self.evaluate("document.body ? document.body.innerText : ''").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn click(&self, selector: &str) -> Result<()> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|e| PoolError::EvaluationFailed(format!("selector {selector} not found: {e}")))?;
        element.click().await.map_err(|e| PoolError::EvaluationFailed(e.to_string()))?;
        Ok(())
    }

    async fn move_mouse(&self, x: f64, y: f64) -> Result<()> {
        use chromiumoxide::cdp::browser_protocol::input::{DispatchMouseEventParams, DispatchMouseEventType};
        let params = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseMoved)
            .x(x)
            .y(y)
            .build()
            .map_err(PoolError::EvaluationFailed)?;
        self.page.execute(params).await.map_err(|e| PoolError::EvaluationFailed(e.to_string()))?;
        Ok(())
    }

    async fn type_char(&self, ch: char) -> Result<()> {
        let mut buf = [0u8; 4];
        let text = ch.encode_utf8(&mut buf).to_string();
        let params = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::Char)
            .text(text)
            .build()
            .map_err(PoolError::EvaluationFailed)?;
        self.page.execute(params).await.map_err(|e| PoolError::EvaluationFailed(e.to_string()))?;
        Ok(())
    }

    async fn press_backspace(&self) -> Result<()> {
        let params = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::RawKeyDown)
            .key("Backspace")
            .build()
            .map_err(PoolError::EvaluationFailed)?;
        self.page.execute(params).await.map_err(|e| PoolError::EvaluationFailed(e.to_string()))?;
        Ok(())
    }

    async fn set_field_value(&self, field_name: &str, value: &str) -> Result<()> {
        let script = format!(
            "(() => {{ const el = document.querySelector('[name=\"{field_name}\"]'); \
              if (el) {{ el.value = {value:?}; el.dispatchEvent(new Event('input', {{bubbles: true}})); }} }})()"
        );
        self.evaluate(&script).await?;
        Ok(())
    }
}

/// Creates pages from a single shared headless `Browser` instance, one
/// per court (§4.2). The browser process itself is launched once at
/// pool-initialisation time.
pub struct ChromiumDriverFactory {
    browser: Arc<Browser>,
}

impl ChromiumDriverFactory {
    /// Launches a headless Chromium instance and spawns its event-handling
    /// task, returning a factory that creates one page per `create` call.
    pub async fn launch() -> Result<Self> {
        let config = BrowserConfig::builder()
            .build()
            .map_err(PoolError::EvaluationFailed)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| PoolError::EvaluationFailed(format!("failed to launch browser: {e}")))?;

        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    log::warn!(target: "pool", "browser handler event error: {e}");
                }
            }
        });

        Ok(ChromiumDriverFactory { browser: Arc::new(browser) })
    }
}

#[async_trait]
impl PageDriverFactory for ChromiumDriverFactory {
    async fn create(&self, url: &str) -> Result<Arc<dyn PageDriver>> {
        let page = self
            .browser
            .new_page(url)
            .await
            .map_err(|e| PoolError::NavigationFailed { court: 0, message: e.to_string() })?;
        page.wait_for_navigation()
            .await
            .map_err(|e| PoolError::NavigationFailed { court: 0, message: e.to_string() })?;
        Ok(Arc::new(ChromiumPageDriver::new(page)))
    }
}
