//! Transactional email adapters for deployment notifications.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::credentials::Credential;
use crate::error::ProviderError;
use crate::plan::Capability;
use crate::providers::http::{Auth, HttpApi};
use crate::providers::{ProviderAdapter, ProviderOutcome, ProviderResult, parse_inputs, unsupported};

pub const SENDGRID_BASE_URL: &str = "https://api.sendgrid.com";
pub const MAILGUN_BASE_URL: &str = "https://api.mailgun.net";

const CAPABILITIES: [Capability; 1] = [Capability::SendNotification];

fn default_subject() -> String {
    "Your application has been deployed".to_string()
}

#[derive(Debug, Deserialize)]
struct Notification {
    to: Vec<String>,
    from: String,
    #[serde(default = "default_subject")]
    subject: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    html: Option<String>,
    /// Sending domain (Mailgun only).
    #[serde(default)]
    domain: Option<String>,
}

impl Notification {
    fn validate(&self) -> Result<(), ProviderError> {
        if self.to.is_empty() {
            return Err(ProviderError::permanent("notification has no recipients"));
        }
        if self.text.is_none() && self.html.is_none() {
            return Err(ProviderError::permanent(
                "notification needs a text or html body",
            ));
        }
        Ok(())
    }
}

pub struct SendGridAdapter {
    api: HttpApi,
}

impl SendGridAdapter {
    pub fn new(api: HttpApi) -> Self {
        Self { api }
    }

    async fn send(&self, req: Notification, auth: &Auth<'_>) -> ProviderOutcome {
        req.validate()?;
        let mut content = Vec::new();
        if let Some(text) = &req.text {
            content.push(json!({ "type": "text/plain", "value": text }));
        }
        if let Some(html) = &req.html {
            content.push(json!({ "type": "text/html", "value": html }));
        }
        let recipients: Vec<Value> = req.to.iter().map(|email| json!({ "email": email })).collect();
        let body = json!({
            "personalizations": [{ "to": recipients, "subject": req.subject }],
            "from": { "email": req.from },
            "content": content,
        });
        let resp = self
            .api
            .json(Method::POST, "v3/mail/send", auth, Some(&body))
            .await?;
        if resp.status != StatusCode::ACCEPTED {
            return Err(ProviderError::PermanentApi {
                status: Some(resp.status.as_u16()),
                message: "SendGrid did not accept the message".to_string(),
            });
        }
        info!(recipients = req.to.len(), "notification queued via SendGrid");
        Ok(ProviderResult::new(
            format!("sent notification to {} recipients", req.to.len()),
            json!({ "accepted": true, "to": req.to }),
        ))
    }
}

#[async_trait]
impl ProviderAdapter for SendGridAdapter {
    fn provider_id(&self) -> &str {
        "sendgrid"
    }

    fn capabilities(&self) -> &[Capability] {
        &CAPABILITIES
    }

    async fn execute(
        &self,
        capability: Capability,
        inputs: &Value,
        credential: &Credential,
    ) -> ProviderOutcome {
        let auth = Auth::Bearer(credential.secret().expose());
        match capability {
            Capability::SendNotification => {
                self.send(parse_inputs(capability, inputs)?, &auth).await
            }
            other => Err(unsupported("sendgrid", other)),
        }
    }
}

pub struct MailgunAdapter {
    api: HttpApi,
}

impl MailgunAdapter {
    pub fn new(api: HttpApi) -> Self {
        Self { api }
    }

    async fn send(&self, req: Notification, auth: &Auth<'_>) -> ProviderOutcome {
        req.validate()?;
        let domain = req
            .domain
            .as_deref()
            .ok_or_else(|| ProviderError::permanent("Mailgun notifications need a domain"))?;
        let mut form: Vec<(&str, &str)> = vec![
            ("from", req.from.as_str()),
            ("subject", req.subject.as_str()),
        ];
        for recipient in &req.to {
            form.push(("to", recipient.as_str()));
        }
        if let Some(text) = &req.text {
            form.push(("text", text.as_str()));
        }
        if let Some(html) = &req.html {
            form.push(("html", html.as_str()));
        }
        let resp = self
            .api
            .form(&format!("v3/{domain}/messages"), auth, &form)
            .await?;
        info!(%domain, recipients = req.to.len(), "notification queued via Mailgun");
        Ok(ProviderResult::new(
            format!("sent notification to {} recipients", req.to.len()),
            json!({
                "accepted": true,
                "to": req.to,
                "message_id": resp.body.get("id").cloned().unwrap_or(Value::Null),
            }),
        ))
    }
}

#[async_trait]
impl ProviderAdapter for MailgunAdapter {
    fn provider_id(&self) -> &str {
        "mailgun"
    }

    fn capabilities(&self) -> &[Capability] {
        &CAPABILITIES
    }

    async fn execute(
        &self,
        capability: Capability,
        inputs: &Value,
        credential: &Credential,
    ) -> ProviderOutcome {
        let auth = Auth::Basic {
            user: "api",
            password: credential.secret().expose(),
        };
        match capability {
            Capability::SendNotification => {
                self.send(parse_inputs(capability, inputs)?, &auth).await
            }
            other => Err(unsupported("mailgun", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_requires_recipients_and_body() {
        let req: Notification = serde_json::from_value(json!({
            "to": [],
            "from": "ops@example.com",
            "text": "hi"
        }))
        .unwrap();
        assert!(req.validate().is_err());

        let req: Notification = serde_json::from_value(json!({
            "to": ["dev@example.com"],
            "from": "ops@example.com"
        }))
        .unwrap();
        assert!(req.validate().is_err());
    }
}
