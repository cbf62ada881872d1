//! Notification channels
//!
//! Channel implementations are swappable behind [`NotificationChannel`]; the
//! scheduler and dispatcher only see the capability contract. Shipping
//! channels: Chatwoot (WhatsApp messaging) and Resend (email copies).

use async_trait::async_trait;
use cuenty_shared::{ChatwootConfig, EmailConfig, NotificationKind};
use serde::Serialize;
use time::Date;

use crate::error::{EngineError, EngineResult};

// =============================================================================
// Payload
// =============================================================================

/// Credentials delivered when a slot is assigned
#[derive(Debug, Clone, Serialize)]
pub struct CredentialBundle {
    pub account_email: String,
    pub account_password: String,
    pub profile_label: Option<String>,
}

/// Everything a template needs to render a customer-facing message
#[derive(Debug, Clone, Serialize)]
pub struct NotificationPayload {
    pub service: String,
    pub plan: String,
    pub recipient_phone: Option<String>,
    pub recipient_email: Option<String>,
    pub expires_on: Date,
    pub days_remaining: Option<i64>,
    pub credentials: Option<CredentialBundle>,
}

/// Confirmation returned by a channel on successful delivery
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub message_ref: Option<String>,
}

/// Capability contract every channel implements
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &'static str;

    /// The handle this channel would deliver to, if the payload carries one
    fn recipient(&self, payload: &NotificationPayload) -> Option<String>;

    async fn deliver(
        &self,
        recipient: &str,
        kind: NotificationKind,
        payload: &NotificationPayload,
    ) -> EngineResult<DeliveryReceipt>;
}

// =============================================================================
// Templates
// =============================================================================

pub fn message_subject(kind: NotificationKind, payload: &NotificationPayload) -> String {
    match kind {
        NotificationKind::ReminderSoon => {
            format!("Your {} subscription renews soon", payload.service)
        }
        NotificationKind::ReminderUrgent => {
            format!("Action needed: {} renewal due", payload.service)
        }
        NotificationKind::CredentialDelivery => {
            format!("Your {} account is ready", payload.service)
        }
        NotificationKind::ExpiryNotice => {
            format!("Your {} subscription has expired", payload.service)
        }
        NotificationKind::RenewalReceipt => {
            format!("{} renewed successfully", payload.service)
        }
    }
}

pub fn message_text(kind: NotificationKind, payload: &NotificationPayload) -> String {
    match kind {
        NotificationKind::ReminderSoon => format!(
            "Hi! Your {} subscription ({}) renews on {}. That's {} day(s) away. \
             Reply to this message if you need help.",
            payload.service,
            payload.plan,
            payload.expires_on,
            payload.days_remaining.unwrap_or(0)
        ),
        NotificationKind::ReminderUrgent => format!(
            "Heads up! Your {} subscription ({}) is due on {}. Renew now to keep \
             your access without interruption.",
            payload.service, payload.plan, payload.expires_on
        ),
        NotificationKind::CredentialDelivery => {
            let mut text = format!(
                "Your {} account is ready!\n\nPlan: {}\n",
                payload.service, payload.plan
            );
            if let Some(creds) = &payload.credentials {
                text.push_str(&format!(
                    "Email: {}\nPassword: {}\n",
                    creds.account_email, creds.account_password
                ));
                if let Some(profile) = &creds.profile_label {
                    text.push_str(&format!("Profile: {}\n", profile));
                }
            }
            text.push_str(&format!("\nValid until: {}", payload.expires_on));
            text
        }
        NotificationKind::ExpiryNotice => format!(
            "Your {} subscription ({}) expired on {} and the profile has been \
             released. You can purchase a new plan any time.",
            payload.service, payload.plan, payload.expires_on
        ),
        NotificationKind::RenewalReceipt => format!(
            "Renewal confirmed! Your {} subscription continues without \
             interruption. New expiry date: {}.",
            payload.service, payload.expires_on
        ),
    }
}

fn message_html(kind: NotificationKind, payload: &NotificationPayload) -> String {
    format!(
        "<h2>{}</h2><p>{}</p>",
        message_subject(kind, payload),
        message_text(kind, payload).replace('\n', "<br>")
    )
}

// =============================================================================
// Chatwoot (WhatsApp)
// =============================================================================

/// WhatsApp messaging through a Chatwoot installation.
///
/// Delivery is the Chatwoot flow: find or create the contact by phone, open a
/// conversation on the WhatsApp inbox, post the rendered message.
#[derive(Clone)]
pub struct ChatwootChannel {
    config: ChatwootConfig,
    client: reqwest::Client,
}

impl ChatwootChannel {
    pub fn new(config: ChatwootConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn api(&self, path: &str) -> String {
        format!(
            "{}/api/v1/accounts/{}{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.account_id,
            path
        )
    }

    async fn find_or_create_contact(&self, phone: &str) -> EngineResult<i64> {
        let search = self
            .client
            .get(self.api("/contacts/search"))
            .query(&[("q", phone)])
            .header("api_access_token", &self.config.api_token)
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        if search.status().is_success() {
            let body: serde_json::Value = search
                .json()
                .await
                .map_err(|e| EngineError::Transport(e.to_string()))?;
            if let Some(id) = body
                .pointer("/payload/0/id")
                .and_then(serde_json::Value::as_i64)
            {
                return Ok(id);
            }
        }

        let created = self
            .client
            .post(self.api("/contacts"))
            .header("api_access_token", &self.config.api_token)
            .json(&serde_json::json!({
                "name": phone,
                "phone_number": phone,
            }))
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        if !created.status().is_success() {
            return Err(EngineError::Transport(format!(
                "Chatwoot contact creation returned {}",
                created.status()
            )));
        }
        let body: serde_json::Value = created
            .json()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        body.pointer("/payload/contact/id")
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| EngineError::Transport("Chatwoot contact response missing id".to_string()))
    }

    async fn open_conversation(&self, contact_id: i64) -> EngineResult<i64> {
        let response = self
            .client
            .post(self.api("/conversations"))
            .header("api_access_token", &self.config.api_token)
            .json(&serde_json::json!({
                "contact_id": contact_id,
                "inbox_id": self.config.inbox_id,
            }))
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EngineError::Transport(format!(
                "Chatwoot conversation returned {}",
                response.status()
            )));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        body.pointer("/id")
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| {
                EngineError::Transport("Chatwoot conversation response missing id".to_string())
            })
    }
}

#[async_trait]
impl NotificationChannel for ChatwootChannel {
    fn name(&self) -> &'static str {
        "chatwoot"
    }

    fn recipient(&self, payload: &NotificationPayload) -> Option<String> {
        payload.recipient_phone.clone()
    }

    async fn deliver(
        &self,
        recipient: &str,
        kind: NotificationKind,
        payload: &NotificationPayload,
    ) -> EngineResult<DeliveryReceipt> {
        let contact_id = self.find_or_create_contact(recipient).await?;
        let conversation_id = self.open_conversation(contact_id).await?;

        let response = self
            .client
            .post(self.api(&format!("/conversations/{}/messages", conversation_id)))
            .header("api_access_token", &self.config.api_token)
            .json(&serde_json::json!({
                "content": message_text(kind, payload),
                "message_type": "outgoing",
            }))
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EngineError::Transport(format!(
                "Chatwoot message returned {}",
                response.status()
            )));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        let message_ref = body
            .pointer("/id")
            .and_then(serde_json::Value::as_i64)
            .map(|id| id.to_string());

        tracing::info!(
            recipient = %recipient,
            kind = %kind,
            conversation_id,
            "WhatsApp message sent via Chatwoot"
        );
        Ok(DeliveryReceipt { message_ref })
    }
}

// =============================================================================
// Resend (email)
// =============================================================================

/// Transactional email via the Resend API
#[derive(Clone)]
pub struct ResendEmailChannel {
    config: EmailConfig,
    client: reqwest::Client,
}

impl ResendEmailChannel {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotificationChannel for ResendEmailChannel {
    fn name(&self) -> &'static str {
        "resend"
    }

    fn recipient(&self, payload: &NotificationPayload) -> Option<String> {
        payload.recipient_email.clone()
    }

    async fn deliver(
        &self,
        recipient: &str,
        kind: NotificationKind,
        payload: &NotificationPayload,
    ) -> EngineResult<DeliveryReceipt> {
        if !self.config.is_enabled() {
            return Err(EngineError::Config(
                "Resend API key not configured".to_string(),
            ));
        }

        let body = serde_json::json!({
            "from": self.config.email_from,
            "to": [recipient],
            "subject": message_subject(kind, payload),
            "html": message_html(kind, payload),
        });

        let response = self
            .client
            .post("https://api.resend.com/emails")
            .header(
                "Authorization",
                format!("Bearer {}", self.config.resend_api_key),
            )
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Transport(format!(
                "Resend returned {}: {}",
                status, body
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        let message_ref = body
            .pointer("/id")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);

        tracing::info!(to = %recipient, kind = %kind, "Email sent");
        Ok(DeliveryReceipt { message_ref })
    }
}

// =============================================================================
// Tests
// =============================================================================
