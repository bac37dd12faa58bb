//! HTTP email backends for the supported providers.
//!
//! One backend type covers every provider: the provider decides the endpoint,
//! the authentication scheme and the JSON payload shape.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::services::delivery::{error_from_response, DeliveryError, DeliveryResponse, EmailBackend};
use crate::services::providers::{EmailProvider, ProviderCredentials};

/// Sender identity shared by all providers.
#[derive(Debug, Clone)]
pub struct MailSender {
    pub address: String,
    pub name: Option<String>,
}

pub struct HttpEmailBackend {
    client: reqwest::Client,
    provider: EmailProvider,
    api_key: String,
    api_secret: Option<String>,
    sender: MailSender,
}

impl HttpEmailBackend {
    pub fn new(
        client: reqwest::Client,
        provider: EmailProvider,
        credentials: &ProviderCredentials,
        sender: MailSender,
    ) -> Self {
        Self {
            client,
            provider,
            api_key: credentials.api_key.clone().unwrap_or_default(),
            api_secret: credentials.api_secret.clone(),
            sender,
        }
    }

    fn endpoint(&self) -> &'static str {
        match self.provider {
            EmailProvider::Mailjet => "https://api.mailjet.com/v3.1/send",
            EmailProvider::MailerSend => "https://api.mailersend.com/v1/email",
            EmailProvider::Postmark => "https://api.postmarkapp.com/email",
            EmailProvider::SendGrid => "https://api.sendgrid.com/v3/mail/send",
        }
    }

    /// Provider-specific JSON body for a plain-text message.
    fn payload(&self, subject: &str, body: &str, recipients: &[String]) -> Value {
        let from_name = self.sender.name.clone();
        match self.provider {
            EmailProvider::Mailjet => {
                let to: Vec<Value> = recipients.iter().map(|r| json!({ "Email": r })).collect();
                let mut from = json!({ "Email": self.sender.address });
                if let Some(name) = from_name {
                    from["Name"] = json!(name);
                }
                json!({
                    "Messages": [{
                        "From": from,
                        "To": to,
                        "Subject": subject,
                        "TextPart": body,
                    }]
                })
            }
            EmailProvider::MailerSend => {
                let to: Vec<Value> = recipients.iter().map(|r| json!({ "email": r })).collect();
                let mut from = json!({ "email": self.sender.address });
                if let Some(name) = from_name {
                    from["name"] = json!(name);
                }
                json!({
                    "from": from,
                    "to": to,
                    "subject": subject,
                    "text": body,
                })
            }
            EmailProvider::Postmark => {
                let from = match from_name {
                    Some(name) => format!("{} <{}>", name, self.sender.address),
                    None => self.sender.address.clone(),
                };
                json!({
                    "From": from,
                    "To": recipients.join(","),
                    "Subject": subject,
                    "TextBody": body,
                })
            }
            EmailProvider::SendGrid => {
                let to: Vec<Value> = recipients.iter().map(|r| json!({ "email": r })).collect();
                let mut from = json!({ "email": self.sender.address });
                if let Some(name) = from_name {
                    from["name"] = json!(name);
                }
                json!({
                    "personalizations": [{ "to": to }],
                    "from": from,
                    "subject": subject,
                    "content": [{ "type": "text/plain", "value": body }],
                })
            }
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.provider {
            EmailProvider::Mailjet => request.basic_auth(&self.api_key, self.api_secret.as_ref()),
            EmailProvider::MailerSend | EmailProvider::SendGrid => request.bearer_auth(&self.api_key),
            EmailProvider::Postmark => request
                .header("X-Postmark-Server-Token", &self.api_key)
                .header("Accept", "application/json"),
        }
    }
}

/// Pull a provider message id out of the response headers or JSON body.
fn extract_message_id(headers: &reqwest::header::HeaderMap, body: &str) -> Option<String> {
    if let Some(id) = headers.get("x-message-id").and_then(|v| v.to_str().ok()) {
        return Some(id.to_string());
    }

    let json: Value = serde_json::from_str(body).ok()?;
    if let Some(id) = json.get("MessageID").and_then(Value::as_str) {
        return Some(id.to_string());
    }
    // Mailjet v3.1: Messages[0].To[0].MessageUUID
    json.pointer("/Messages/0/To/0/MessageUUID")
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

#[async_trait]
impl EmailBackend for HttpEmailBackend {
    fn name(&self) -> &'static str {
        self.provider.as_str()
    }

    async fn send_email(
        &self,
        subject: &str,
        body: &str,
        recipients: &[String],
    ) -> Result<DeliveryResponse, DeliveryError> {
        let payload = self.payload(subject, body, recipients);
        let request = self.authorize(self.client.post(self.endpoint())).json(&payload);

        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(error_from_response(self.provider.as_str(), response).await);
        }

        let status = response.status();
        let headers = response.headers().clone();
        let text = response.text().await.unwrap_or_default();

        tracing::debug!(
            "{} accepted email for {} recipient(s) ({})",
            self.provider.as_str(),
            recipients.len(),
            status
        );

        let mut delivered = DeliveryResponse::new(format!(
            "accepted by {} for {} recipient(s)",
            self.provider.as_str(),
            recipients.len()
        ));
        if let Some(id) = extract_message_id(&headers, &text) {
            delivered = delivered.with_message_id(id);
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(provider: EmailProvider, name: Option<&str>) -> HttpEmailBackend {
        let credentials = ProviderCredentials {
            api_key: Some("key".to_string()),
            api_secret: Some("secret".to_string()),
        };
        HttpEmailBackend::new(
            reqwest::Client::new(),
            provider,
            &credentials,
            MailSender {
                address: "noreply@example.com".to_string(),
                name: name.map(|s| s.to_string()),
            },
        )
    }

    fn recipients() -> Vec<String> {
        vec!["a@x.com".to_string(), "b@x.com".to_string()]
    }

    #[test]
    fn mailjet_payload_lists_every_recipient() {
        let p = backend(EmailProvider::Mailjet, Some("Alerts")).payload("Hi", "Test", &recipients());
        assert_eq!(p["Messages"][0]["Subject"], "Hi");
        assert_eq!(p["Messages"][0]["TextPart"], "Test");
        assert_eq!(p["Messages"][0]["To"][1]["Email"], "b@x.com");
        assert_eq!(p["Messages"][0]["From"]["Name"], "Alerts");
    }

    #[test]
    fn postmark_joins_recipients() {
        let p = backend(EmailProvider::Postmark, Some("Alerts")).payload("Hi", "Test", &recipients());
        assert_eq!(p["To"], "a@x.com,b@x.com");
        assert_eq!(p["From"], "Alerts <noreply@example.com>");
        assert_eq!(p["TextBody"], "Test");
    }

    #[test]
    fn sendgrid_and_mailersend_payloads() {
        let p = backend(EmailProvider::SendGrid, None).payload("Hi", "Test", &recipients());
        assert_eq!(p["personalizations"][0]["to"][0]["email"], "a@x.com");
        assert_eq!(p["content"][0]["value"], "Test");
        assert!(p["from"].get("name").is_none());

        let p = backend(EmailProvider::MailerSend, None).payload("Hi", "Test", &recipients());
        assert_eq!(p["to"][1]["email"], "b@x.com");
        assert_eq!(p["text"], "Test");
    }

    #[test]
    fn message_id_from_header_or_body() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert_eq!(
            extract_message_id(&headers, r#"{"MessageID":"pm-1","ErrorCode":0}"#),
            Some("pm-1".to_string())
        );
        assert_eq!(
            extract_message_id(
                &headers,
                r#"{"Messages":[{"Status":"success","To":[{"MessageUUID":"mj-1"}]}]}"#
            ),
            Some("mj-1".to_string())
        );
        assert_eq!(extract_message_id(&headers, ""), None);

        headers.insert("x-message-id", "sg-1".parse().unwrap());
        assert_eq!(extract_message_id(&headers, ""), Some("sg-1".to_string()));
    }
}
