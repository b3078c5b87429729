use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::credentials::Credential;
use crate::error::ProviderError;
use crate::plan::Capability;
use crate::providers::http::{Auth, HttpApi};
use crate::providers::{ProviderAdapter, ProviderOutcome, ProviderResult, parse_inputs, unsupported};

pub const DEFAULT_BASE_URL: &str = "https://api.godaddy.com";

const CAPABILITIES: [Capability; 1] = [Capability::ConfigureDns];

fn default_ttl() -> u32 {
    3600
}

fn default_subdomain() -> String {
    "www".to_string()
}

#[derive(Debug, Deserialize)]
struct ConfigureDns {
    domain: String,
    /// Hostname or URL the subdomain should point at.
    target: String,
    #[serde(default = "default_subdomain")]
    subdomain: String,
    /// Apex A record, when the hosting platform hands out an address.
    #[serde(default)]
    ip: Option<String>,
    #[serde(default = "default_ttl")]
    ttl: u32,
}

/// GoDaddy domains API. The credential secret is `KEY:SECRET`.
pub struct GoDaddyAdapter {
    api: HttpApi,
}

impl GoDaddyAdapter {
    pub fn new(api: HttpApi) -> Self {
        Self { api }
    }

    async fn replace_record(
        &self,
        domain: &str,
        kind: &str,
        name: &str,
        data: &str,
        ttl: u32,
        auth: &Auth<'_>,
    ) -> Result<(), ProviderError> {
        let body = json!([{ "data": data, "ttl": ttl }]);
        self.api
            .json(
                Method::PUT,
                &format!("v1/domains/{domain}/records/{kind}/{name}"),
                auth,
                Some(&body),
            )
            .await?;
        Ok(())
    }

    async fn configure(&self, req: ConfigureDns, auth: &Auth<'_>) -> ProviderOutcome {
        let host = target_host(&req.target)?;
        let mut records = vec![json!({
            "type": "CNAME",
            "name": req.subdomain,
            "data": host,
            "ttl": req.ttl,
        })];
        self.replace_record(&req.domain, "CNAME", &req.subdomain, &host, req.ttl, auth)
            .await?;
        if let Some(ip) = &req.ip {
            self.replace_record(&req.domain, "A", "@", ip, req.ttl, auth)
                .await?;
            records.push(json!({ "type": "A", "name": "@", "data": ip, "ttl": req.ttl }));
        }
        info!(domain = %req.domain, target = %host, "DNS records updated");
        Ok(ProviderResult::new(
            format!("pointed {}.{} at {host}", req.subdomain, req.domain),
            json!({
                "domain": req.domain,
                "records": records,
                "url": format!("https://{}.{}", req.subdomain, req.domain),
            }),
        ))
    }
}

fn target_host(target: &str) -> Result<String, ProviderError> {
    let host = target
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or_default();
    if host.is_empty() {
        return Err(ProviderError::permanent(format!(
            "DNS target '{target}' has no host"
        )));
    }
    Ok(host.to_string())
}

#[async_trait]
impl ProviderAdapter for GoDaddyAdapter {
    fn provider_id(&self) -> &str {
        "godaddy"
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
        let key = credential.secret().expose();
        if !key.contains(':') {
            return Err(ProviderError::Auth(
                "GoDaddy credential must be formatted as KEY:SECRET".to_string(),
            ));
        }
        let auth = Auth::SsoKey(key);
        match capability {
            Capability::ConfigureDns => {
                self.configure(parse_inputs(capability, inputs)?, &auth)
                    .await
            }
            other => Err(unsupported("godaddy", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_host_strips_scheme_and_path() {
        assert_eq!(
            target_host("https://shop.up.railway.app/health").unwrap(),
            "shop.up.railway.app"
        );
        assert_eq!(target_host("shop.vercel.app").unwrap(), "shop.vercel.app");
        assert!(target_host("https://").is_err());
    }
}
