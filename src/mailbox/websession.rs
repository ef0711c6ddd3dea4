//! Cookie-authenticated web session adapter: a JSON mail API reached with a
//! stored Cookie header instead of protocol-level auth.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, COOKIE};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{Folder, MailError, MailboxSession, MessageHeader};
use crate::models::account::{Account, Credentials};
use crate::net::Dialer;

#[derive(Debug, Deserialize)]
struct WebFolder {
    name: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    total: u32,
}

#[derive(Debug, Deserialize, Default)]
struct WebMessage {
    #[serde(default)]
    from: Vec<String>,
    #[serde(default)]
    to: Vec<String>,
    #[serde(default)]
    cc: Vec<String>,
    #[serde(default)]
    bcc: Vec<String>,
}

pub struct WebSessionMailbox {
    client: reqwest::Client,
    base: String,
    request_timeout: Duration,
}

pub fn connect(
    account: &Account,
    credentials: &Credentials,
    dialer: &Dialer,
    request_timeout: Duration,
) -> Result<WebSessionMailbox, MailError> {
    let Credentials::Cookies { cookies } = credentials else {
        return Err(MailError::Auth(
            "web session requires stored session cookies".into(),
        ));
    };
    let Some(base) = account.endpoint.clone() else {
        return Err(MailError::Protocol(
            "web session account has no endpoint url".into(),
        ));
    };

    let mut headers = HeaderMap::new();
    let cookie_value = HeaderValue::from_str(cookies)
        .map_err(|_| MailError::Auth("stored cookies contain invalid bytes".into()))?;
    headers.insert(COOKIE, cookie_value);

    let mut builder = reqwest::Client::builder()
        .timeout(request_timeout)
        .default_headers(headers)
        .cookie_store(true);
    if let Some(proxy) = dialer.reqwest_proxy()? {
        builder = builder.proxy(proxy);
    }
    let client = builder
        .build()
        .map_err(|e| MailError::Connection(e.to_string()))?;

    Ok(WebSessionMailbox {
        client,
        base: base.trim_end_matches('/').to_string(),
        request_timeout,
    })
}

impl WebSessionMailbox {
    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, MailError> {
        let resp = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                MailError::Timeout(self.request_timeout)
            } else {
                MailError::Connection(e.to_string())
            }
        })?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(MailError::Auth(format!(
                "session cookies rejected ({status})"
            )));
        }
        if !status.is_success() {
            return Err(MailError::Protocol(format!("unexpected status {status}")));
        }
        resp.json()
            .await
            .map_err(|e| MailError::Protocol(format!("malformed response: {e}")))
    }

    async fn folders(&self) -> Result<Vec<Folder>, MailError> {
        let url = format!("{}/api/folders", self.base);
        let listing: Vec<WebFolder> = self.get_json(&url).await?;
        Ok(listing
            .into_iter()
            .map(|f| Folder {
                path: f.path.unwrap_or_else(|| f.name.clone()),
                name: f.name,
                total: f.total,
            })
            .collect())
    }
}

#[async_trait::async_trait]
impl MailboxSession for WebSessionMailbox {
    async fn list_folders(&mut self) -> Result<Vec<Folder>, MailError> {
        self.folders().await
    }

    async fn open_folder(&mut self, folder: &Folder) -> Result<u32, MailError> {
        let listing = self.folders().await?;
        listing
            .into_iter()
            .find(|f| f.path == folder.path)
            .map(|f| f.total)
            .ok_or_else(|| MailError::Protocol(format!("folder {} not found", folder.path)))
    }

    async fn fetch_headers(
        &mut self,
        folder: &Folder,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<MessageHeader>, MailError> {
        let url = format!(
            "{}/api/folders/{}/messages?offset={}&limit={}",
            self.base, folder.path, offset, limit
        );
        let page: Vec<WebMessage> = self.get_json(&url).await?;
        Ok(page
            .into_iter()
            .map(|m| MessageHeader {
                from: m.from,
                to: m.to,
                cc: m.cc,
                bcc: m.bcc,
            })
            .collect())
    }

    async fn close(&mut self) -> Result<(), MailError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn web_folder_defaults() {
        let json = r#"[{"name":"Inbox","total":3},{"name":"Archive","path":"archive-1"}]"#;
        let listing: Vec<WebFolder> = serde_json::from_str(json).unwrap();
        assert_eq!(listing[0].total, 3);
        assert!(listing[0].path.is_none());
        assert_eq!(listing[1].path.as_deref(), Some("archive-1"));
    }
}
