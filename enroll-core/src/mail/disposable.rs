use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::debug;
use url::Url;

use crate::config::MailSection;
use crate::identity::Identity;

use super::{CodeQuery, Inbox, MailError, MailProvider, MailResult};

const PROVIDER_ID: &str = "disposable";

#[derive(Debug, Deserialize)]
struct MessageHeader {
    id: String,
    #[serde(default)]
    from: String,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    subject: String,
    #[serde(default)]
    body: MessageBody,
}

#[derive(Debug, Default, Deserialize)]
struct MessageBody {
    #[serde(default)]
    text: String,
    #[serde(default)]
    html: String,
}

/// Talks to an Inbucket-style disposable mail service. Mailboxes exist
/// implicitly, so creating one is just minting a name; reading and deleting
/// go through the REST API.
pub struct DisposableInboxProvider {
    config: MailSection,
    client: reqwest::Client,
    code_pattern: Regex,
}

impl DisposableInboxProvider {
    pub fn new(config: MailSection) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            code_pattern: Regex::new(r"\b([0-9]{6})\b").expect("valid regex"),
        }
    }

    fn api_url(&self, path: &str) -> MailResult<Url> {
        let base = self
            .config
            .api_base_url
            .as_deref()
            .ok_or_else(|| MailError::NotConfigured(PROVIDER_ID.to_string()))?;
        let mut base = base.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        Url::parse(&base)
            .and_then(|base| base.join(path))
            .map_err(|err| MailError::Provider(format!("bad api url: {err}")))
    }

    fn mailbox_name(inbox: &Inbox) -> MailResult<&str> {
        inbox
            .handle
            .as_deref()
            .ok_or_else(|| MailError::Provider(format!("inbox {} has no handle", inbox.address)))
    }

    async fn list_messages(&self, name: &str) -> MailResult<Vec<MessageHeader>> {
        let url = self.api_url(&format!("api/v1/mailbox/{name}"))?;
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MailError::Provider(format!(
                "mailbox listing returned {status}"
            )));
        }
        Ok(response.json::<Vec<MessageHeader>>().await?)
    }

    async fn read_message(&self, name: &str, id: &str) -> MailResult<Message> {
        let url = self.api_url(&format!("api/v1/mailbox/{name}/{id}"))?;
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MailError::Provider(format!(
                "message fetch returned {status}"
            )));
        }
        Ok(response.json::<Message>().await?)
    }

    fn header_matches(&self, header: &MessageHeader, query: &CodeQuery) -> bool {
        if !self.config.sender_filter.is_empty()
            && !header.from.contains(&self.config.sender_filter)
        {
            return false;
        }
        // Headers without a parseable date pass; the `since` filter only
        // rejects mail known to predate the session.
        match header.date {
            Some(date) => date >= query.since,
            None => true,
        }
    }

    fn extract_code(&self, message: &Message) -> Option<String> {
        for haystack in [&message.subject, &message.body.text, &message.body.html] {
            if let Some(captures) = self.code_pattern.captures(haystack) {
                return Some(captures[1].to_string());
            }
        }
        None
    }
}

#[async_trait]
impl MailProvider for DisposableInboxProvider {
    fn id(&self) -> &'static str {
        PROVIDER_ID
    }

    fn is_configured(&self) -> bool {
        self.config.api_base_url.is_some() && self.config.inbox_domain.is_some()
    }

    fn can_auto_verify(&self) -> bool {
        true
    }

    async fn create_inbox(&self, identity: &Identity) -> MailResult<Inbox> {
        let domain = self
            .config
            .inbox_domain
            .as_deref()
            .ok_or_else(|| MailError::NotConfigured(PROVIDER_ID.to_string()))?;
        let hint: String = identity
            .last_name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(6)
            .collect::<String>()
            .to_ascii_lowercase();
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(|c| (c as char).to_ascii_lowercase())
            .collect();
        let name = if hint.is_empty() {
            suffix
        } else {
            format!("{hint}-{suffix}")
        };
        Ok(Inbox {
            address: format!("{name}@{domain}"),
            provider: PROVIDER_ID.to_string(),
            handle: Some(name),
        })
    }

    /// Polls the mailbox until a matching message carries a six-digit code
    /// or the configured wait elapses; `Ok(None)` when nothing arrived.
    async fn fetch_verification_code(
        &self,
        inbox: &Inbox,
        query: &CodeQuery,
    ) -> MailResult<Option<String>> {
        let name = Self::mailbox_name(inbox)?;
        let deadline = Instant::now() + Duration::from_secs(self.config.code_wait_seconds);
        let poll_interval = Duration::from_millis(self.config.code_poll_interval_ms.max(200));
        loop {
            let headers = self.list_messages(name).await?;
            // Newest messages come last; prefer them.
            for header in headers.iter().rev() {
                if !self.header_matches(header, query) {
                    continue;
                }
                let message = self.read_message(name, &header.id).await?;
                if let Some(code) = self.extract_code(&message) {
                    debug!(
                        target: "enroll::mail",
                        mailbox = name,
                        subject = %header.subject,
                        "verification code found"
                    );
                    return Ok(Some(code));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn release_inbox(&self, inbox: &Inbox) -> MailResult<()> {
        let name = Self::mailbox_name(inbox)?;
        let url = self.api_url(&format!("api/v1/mailbox/{name}"))?;
        let response = self.client.delete(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MailError::Provider(format!(
                "mailbox delete returned {status}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn identity() -> Identity {
        Identity {
            first_name: "alex".into(),
            last_name: "santos".into(),
            password: "x".into(),
            birth_year: 1990,
            birth_month: 1,
            birth_day: 1,
        }
    }

    fn provider() -> DisposableInboxProvider {
        let mut config = MailSection::default();
        config.inbox_domain = Some("inbox.test".to_string());
        config.api_base_url = Some("http://127.0.0.1:9000".to_string());
        DisposableInboxProvider::new(config)
    }

    #[tokio::test]
    async fn create_inbox_uses_identity_hint() {
        let inbox = provider().create_inbox(&identity()).await.unwrap();
        assert!(inbox.address.ends_with("@inbox.test"));
        let name = inbox.handle.as_deref().unwrap();
        assert!(name.starts_with("santos-"));
        assert!(inbox.address.starts_with(name));
    }

    #[test]
    fn extract_code_prefers_subject_then_bodies() {
        let provider = provider();
        let message = Message {
            subject: "Your code is 493021".to_string(),
            body: MessageBody {
                text: "use 111111".to_string(),
                html: String::new(),
            },
        };
        assert_eq!(provider.extract_code(&message).as_deref(), Some("493021"));

        let message = Message {
            subject: "Welcome!".to_string(),
            body: MessageBody {
                text: "Enter 770128 to continue".to_string(),
                html: String::new(),
            },
        };
        assert_eq!(provider.extract_code(&message).as_deref(), Some("770128"));

        let message = Message {
            subject: "hello".to_string(),
            body: MessageBody::default(),
        };
        assert_eq!(provider.extract_code(&message), None);
    }

    #[test]
    fn header_filter_checks_sender_and_date() {
        let provider = provider();
        let since = Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap();
        let query = CodeQuery { since };

        let fresh = MessageHeader {
            id: "1".into(),
            from: "no-reply@service.test".into(),
            subject: "code".into(),
            date: Some(since + chrono::Duration::minutes(1)),
        };
        assert!(provider.header_matches(&fresh, &query));

        let stale = MessageHeader {
            id: "2".into(),
            from: "no-reply@service.test".into(),
            subject: "code".into(),
            date: Some(since - chrono::Duration::minutes(1)),
        };
        assert!(!provider.header_matches(&stale, &query));

        let wrong_sender = MessageHeader {
            id: "3".into(),
            from: "newsletter@spam.test".into(),
            subject: "code".into(),
            date: Some(since + chrono::Duration::minutes(1)),
        };
        assert!(!provider.header_matches(&wrong_sender, &query));

        let undated = MessageHeader {
            id: "4".into(),
            from: "no-reply@service.test".into(),
            subject: "code".into(),
            date: None,
        };
        assert!(provider.header_matches(&undated, &query));
    }

    #[test]
    fn api_url_joins_with_and_without_trailing_slash() {
        let provider = provider();
        let url = provider.api_url("api/v1/mailbox/abc").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:9000/api/v1/mailbox/abc");

        let mut config = MailSection::default();
        config.api_base_url = Some("http://127.0.0.1:9000/".to_string());
        config.inbox_domain = Some("inbox.test".to_string());
        let provider = DisposableInboxProvider::new(config);
        let url = provider.api_url("api/v1/mailbox/abc").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:9000/api/v1/mailbox/abc");
    }
}
