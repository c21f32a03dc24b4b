use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BrowserSection;

use super::{ContextError, ContextEvent, ContextHost, ContextResult, IsolatedContext};

/// [`ContextHost`] backed by one Chromium process. The browser launches
/// lazily on the first context; each context maps to its own page.
pub struct ChromiumContextHost {
    config: BrowserSection,
    browser: AsyncMutex<Option<Browser>>,
    handler_task: Mutex<Option<JoinHandle<()>>>,
    pages: Mutex<HashMap<String, Page>>,
    events_tx: mpsc::UnboundedSender<ContextEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ContextEvent>>>,
}

impl ChromiumContextHost {
    pub fn new(config: BrowserSection) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            browser: AsyncMutex::new(None),
            handler_task: Mutex::new(None),
            pages: Mutex::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    fn build_chromium_config(&self) -> ContextResult<ChromiumConfig> {
        let mut builder = ChromiumConfig::builder()
            .chrome_executable(&self.config.executable_path)
            .request_timeout(self.config.navigation_timeout());
        if !self.config.headless {
            builder = builder.with_head();
        }
        if !self.config.sandbox {
            builder = builder.no_sandbox();
        }
        builder = builder.args(vec![
            "--no-first-run".to_string(),
            "--mute-audio".to_string(),
            "--password-store=basic".to_string(),
        ]);
        builder.build().map_err(ContextError::Configuration)
    }

    async fn ensure_browser(&self) -> ContextResult<()> {
        let mut slot = self.browser.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        let chromium_config = self.build_chromium_config()?;
        info!(
            target: "enroll::context",
            executable = %self.config.executable_path,
            headless = self.config.headless,
            "launching chromium for approval contexts"
        );
        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| ContextError::Launch(err.to_string()))?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(target: "enroll::context", error = %err, "chromium handler reported error");
                }
            }
        });
        *self.handler_task.lock().unwrap() = Some(handler_task);
        *slot = Some(browser);
        Ok(())
    }

    fn page(&self, context_id: &str) -> Option<Page> {
        self.pages.lock().unwrap().get(context_id).cloned()
    }

    fn emit(&self, event: ContextEvent) {
        // The drain task may be gone during shutdown; nothing to do then.
        let _ = self.events_tx.send(event);
    }
}

#[async_trait]
impl ContextHost for ChromiumContextHost {
    async fn create(&self, url: &str) -> ContextResult<IsolatedContext> {
        self.ensure_browser().await?;
        let page = {
            let guard = self.browser.lock().await;
            let browser = guard
                .as_ref()
                .ok_or_else(|| ContextError::Unexpected("browser vanished".to_string()))?;
            browser.new_page(CreateTargetParams::new(url)).await?
        };
        let context_id = Uuid::new_v4().to_string();
        let surface_id = Uuid::new_v4().to_string();
        self.pages
            .lock()
            .unwrap()
            .insert(context_id.clone(), page);
        debug!(target: "enroll::context", context = %context_id, url, "opened browser context");
        Ok(IsolatedContext {
            context_id: Some(context_id),
            surface_id: Some(surface_id),
        })
    }

    async fn wait_ready(
        &self,
        context: &IsolatedContext,
        timeout: Duration,
    ) -> ContextResult<bool> {
        let context_id = context
            .context_id
            .as_deref()
            .ok_or_else(|| ContextError::UnknownContext("<missing id>".to_string()))?;
        let page = self
            .page(context_id)
            .ok_or_else(|| ContextError::UnknownContext(context_id.to_string()))?;
        let settled = match tokio::time::timeout(timeout, page.wait_for_navigation()).await {
            Ok(result) => {
                result?;
                true
            }
            Err(_) => false,
        };
        if settled {
            if let Some(surface_id) = context.surface_id.clone() {
                self.emit(ContextEvent::Navigated {
                    context_id: context_id.to_string(),
                    surface_id,
                });
            }
        }
        Ok(settled)
    }

    async fn close(&self, context_id: &str) -> ContextResult<()> {
        let page = self.pages.lock().unwrap().remove(context_id);
        match page {
            Some(page) => {
                page.close().await?;
                debug!(target: "enroll::context", context = %context_id, "closed browser context");
                self.emit(ContextEvent::Closed {
                    context_id: context_id.to_string(),
                });
            }
            None => {
                debug!(target: "enroll::context", context = %context_id, "close on unknown context ignored");
            }
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ContextEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    async fn shutdown(&self) -> ContextResult<()> {
        self.pages.lock().unwrap().clear();
        let browser = self.browser.lock().await.take();
        if let Some(mut browser) = browser {
            if let Err(err) = browser.close().await {
                warn!(target: "enroll::context", error = %err, "failed to close browser gracefully");
            }
        }
        let handler_task = self.handler_task.lock().unwrap().take();
        if let Some(handle) = handler_task {
            handle.await?;
        }
        Ok(())
    }
}

impl Drop for ChromiumContextHost {
    fn drop(&mut self) {
        if let Some(handle) = self.handler_task.lock().unwrap().as_ref() {
            if !handle.is_finished() {
                warn!(target: "enroll::context", "context host dropped without explicit shutdown");
            }
        }
    }
}
