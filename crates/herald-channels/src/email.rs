//! Email channel — SMTP delivery via async lettre.
//!
//! Rich (HTML) bodies go out as multipart/alternative with a plain-text
//! rendition generated from the HTML; plain bodies go out as text/plain.

use std::sync::LazyLock;

use async_trait::async_trait;
use herald_core::config::SmtpAccountConfig;
use herald_core::traits::validate_common;
use herald_core::{
    ChannelAdapter, ChannelType, ContentKind, DeliveryReport, HeraldError, Notification, Result,
};
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use regex::Regex;

static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());
static LINE_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>|</p>|</div>|</h[1-6]>|</li>").unwrap());
static BLANK_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// One SMTP account.
pub struct SmtpAdapter {
    account: String,
    host: String,
    from: Mailbox,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpAdapter {
    /// Build the adapter and its connection pool. Requires a running Tokio
    /// runtime.
    pub fn new(account: &str, config: &SmtpAccountConfig) -> Result<Self> {
        let address: Address = config.from.parse().map_err(|e| {
            HeraldError::Config(format!("email account '{account}': invalid from address: {e}"))
        })?;
        let from = Mailbox::new(config.from_name.clone(), address);

        let mut builder = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| HeraldError::Config(format!("SMTP relay {}: {e}", config.host)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };
        builder = builder.port(config.port);

        if !config.password.is_empty() {
            let username = if config.username.is_empty() {
                config.from.clone()
            } else {
                config.username.clone()
            };
            builder = builder.credentials(Credentials::new(username, config.password.clone()));
        }

        Ok(Self {
            account: account.to_string(),
            host: config.host.clone(),
            from,
            mailer: builder.build(),
        })
    }

    /// Assemble the MIME message for a notification.
    pub fn build_message(&self, notification: &Notification) -> Result<Message> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(notification.subject.clone());
        for to in &notification.recipients {
            builder = builder.to(parse_mailbox(to)?);
        }
        for cc in &notification.cc {
            builder = builder.cc(parse_mailbox(cc)?);
        }
        for bcc in &notification.bcc {
            builder = builder.bcc(parse_mailbox(bcc)?);
        }

        let built = match notification.effective_content_kind() {
            ContentKind::Rich => builder.multipart(MultiPart::alternative_plain_html(
                html_to_plain(&notification.body),
                notification.body.clone(),
            )),
            ContentKind::Plain => builder
                .header(ContentType::TEXT_PLAIN)
                .body(notification.body.clone()),
        };
        built.map_err(|e| HeraldError::Delivery(format!("Build email: {e}")))
    }
}

#[async_trait]
impl ChannelAdapter for SmtpAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Email
    }

    fn validate(&self, notification: &Notification) -> Result<()> {
        validate_common(ChannelType::Email, notification)?;
        if notification.subject.trim().is_empty() {
            return Err(HeraldError::Validation("email subject is required".into()));
        }
        if notification.all_recipients().next().is_none() {
            return Err(HeraldError::Validation(
                "email has no recipients (To, CC, or BCC required)".into(),
            ));
        }
        for address in notification.all_recipients() {
            parse_mailbox(address).map_err(|_| {
                HeraldError::Validation(format!("invalid email address: {address}"))
            })?;
        }
        Ok(())
    }

    async fn deliver(&self, notification: &Notification) -> Result<DeliveryReport> {
        let message = self.build_message(notification)?;
        let response = self
            .mailer
            .send(message)
            .await
            .map_err(|e| HeraldError::Delivery(format!("SMTP send via {}: {e}", self.host)))?;

        let count = notification.all_recipients().count();
        tracing::info!("📤 Email ({}) sent to {count} recipient(s)", self.account);
        Ok(
            DeliveryReport::delivered(format!("Email sent to {count} recipient(s)"))
                .with_response("smtp_code", response.code().to_string().into())
                .with_response("host", self.host.clone().into()),
        )
    }
}

fn parse_mailbox(raw: &str) -> Result<Mailbox> {
    raw.trim()
        .parse()
        .map_err(|e| HeraldError::Validation(format!("invalid email address {raw}: {e}")))
}

/// Plain-text rendition of an HTML body.
pub fn html_to_plain(html: &str) -> String {
    let text = LINE_BREAK.replace_all(html, "\n");
    let text = TAG.replace_all(&text, "");
    let text = decode_entities(&text).replace("\r\n", "\n");
    BLANK_RUN.replace_all(&text, "\n\n").trim().to_string()
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
