use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::config::Config;
use crate::models::brand::BrandSettings;
use crate::services::provider::{OutgoingEmail, ProviderClient, ProviderError};
use crate::services::renderer::{personalize, PersonalizeInput, BROADCAST_UNSUBSCRIBE_PLACEHOLDER};

/// A targeted subscriber, resolved by the dispatch query.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub subscriber_id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub unsubscribe_token: String,
}

/// One prepared email body plus everything needed to address it.
pub struct SendContent<'a> {
    /// Prepared body: linkified, short-linked, `{{…}}` tokens intact.
    pub body: &'a str,
    pub subject: &'a str,
    pub from: &'a str,
    pub reply_to: Option<&'a str>,
    pub template_id: &'a str,
    pub brand: &'a BrandSettings,
    /// Target segment for the broadcast strategy; `None` fails that path.
    pub segment_id: Option<&'a str>,
}

/// A recipient the provider acknowledged.
#[derive(Debug, Clone)]
pub struct RecipientOutcome {
    pub subscriber_id: Uuid,
    pub email: String,
    pub provider_message_id: Option<String>,
}

/// A broadcast-path recipient that could not be synced to the provider.
#[derive(Debug, Clone)]
pub struct ContactFailure {
    pub subscriber_id: Uuid,
    pub email: String,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct SendReport {
    pub accepted: Vec<RecipientOutcome>,
    pub contact_failures: Vec<ContactFailure>,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("no provider segment configured for broadcast send")]
    MissingSegment,
    #[error("no recipients could be synced to the provider segment")]
    NoReachableRecipients,
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Delivery strategy. Chosen once per tick from configuration and handed
/// to the sequence processor and campaign dispatcher.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn dispatch(
        &self,
        content: &SendContent<'_>,
        recipients: &[Recipient],
    ) -> Result<SendReport, SendError>;
}

/// Per-recipient transactional sends through the provider's batch API.
pub struct TransactionalSender {
    pub provider: Arc<ProviderClient>,
    pub config: Arc<Config>,
}

#[async_trait]
impl Sender for TransactionalSender {
    async fn dispatch(
        &self,
        content: &SendContent<'_>,
        recipients: &[Recipient],
    ) -> Result<SendReport, SendError> {
        let emails: Vec<OutgoingEmail> = recipients
            .iter()
            .map(|recipient| {
                let unsubscribe_url = self.config.unsubscribe_url(&recipient.unsubscribe_token);
                let html = personalize(
                    content.body,
                    &PersonalizeInput {
                        template_id: content.template_id,
                        subject: content.subject,
                        brand: content.brand,
                        subscriber_name: recipient.name.as_deref(),
                        unsubscribe_url: &unsubscribe_url,
                        site_url: &self.config.site_url,
                    },
                );
                OutgoingEmail {
                    from: content.from.to_string(),
                    to: vec![recipient.email.clone()],
                    subject: content.subject.to_string(),
                    html,
                    reply_to: content.reply_to.map(str::to_string),
                }
            })
            .collect();

        let ids = self.provider.send_batch(&emails).await?;

        let accepted = recipients
            .iter()
            .zip(ids)
            .map(|(recipient, id)| RecipientOutcome {
                subscriber_id: recipient.subscriber_id,
                email: recipient.email.clone(),
                provider_message_id: id,
            })
            .collect();

        Ok(SendReport {
            accepted,
            contact_failures: Vec::new(),
        })
    }
}

/// Provider-side broadcast to a lazily-synced audience segment. One
/// rendered HTML for every recipient; the provider expands the
/// unsubscribe placeholder per recipient.
pub struct BroadcastSender {
    pub provider: Arc<ProviderClient>,
    pub config: Arc<Config>,
}

#[async_trait]
impl Sender for BroadcastSender {
    async fn dispatch(
        &self,
        content: &SendContent<'_>,
        recipients: &[Recipient],
    ) -> Result<SendReport, SendError> {
        let segment_id = content.segment_id.ok_or(SendError::MissingSegment)?;

        let mut reachable = Vec::new();
        let mut contact_failures = Vec::new();

        for (i, recipient) in recipients.iter().enumerate() {
            if i > 0 {
                self.provider.pace().await;
            }
            match self
                .provider
                .ensure_contact(&recipient.email, recipient.name.as_deref())
                .await
            {
                Ok(contact) => {
                    if !contact.existed {
                        match contact.contact_id {
                            Some(contact_id) => {
                                self.provider.pace().await;
                                if let Err(e) = self
                                    .provider
                                    .add_contact_to_segment(segment_id, &contact_id)
                                    .await
                                {
                                    warn!(email = %recipient.email, error = %e, "failed to add contact to segment");
                                    contact_failures.push(ContactFailure {
                                        subscriber_id: recipient.subscriber_id,
                                        email: recipient.email.clone(),
                                        error: e.to_string(),
                                    });
                                    continue;
                                }
                            }
                            None => {
                                contact_failures.push(ContactFailure {
                                    subscriber_id: recipient.subscriber_id,
                                    email: recipient.email.clone(),
                                    error: "provider created contact without returning an id"
                                        .to_string(),
                                });
                                continue;
                            }
                        }
                    }
                    reachable.push(recipient.clone());
                }
                Err(e) => {
                    warn!(email = %recipient.email, error = %e, "failed to ensure provider contact");
                    contact_failures.push(ContactFailure {
                        subscriber_id: recipient.subscriber_id,
                        email: recipient.email.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if reachable.is_empty() {
            return Err(SendError::NoReachableRecipients);
        }

        // One shared render; the provider expands the placeholder.
        let html = personalize(
            content.body,
            &PersonalizeInput {
                template_id: content.template_id,
                subject: content.subject,
                brand: content.brand,
                subscriber_name: None,
                unsubscribe_url: BROADCAST_UNSUBSCRIBE_PLACEHOLDER,
                site_url: &self.config.site_url,
            },
        );

        let broadcast_id = self
            .provider
            .create_broadcast(
                segment_id,
                content.from,
                content.subject,
                &html,
                content.reply_to,
            )
            .await?;
        let sent_id = self.provider.send_broadcast(&broadcast_id).await?;

        let accepted = reachable
            .into_iter()
            .map(|recipient| RecipientOutcome {
                subscriber_id: recipient.subscriber_id,
                email: recipient.email,
                provider_message_id: Some(sent_id.clone()),
            })
            .collect();

        Ok(SendReport {
            accepted,
            contact_failures,
        })
    }
}

/// Pick the delivery strategy from configuration: broadcast only when the
/// switch is on and a default segment exists to sync contacts into,
/// transactional otherwise.
pub fn choose_sender(provider: Arc<ProviderClient>, config: Arc<Config>) -> Arc<dyn Sender> {
    if config.use_broadcast_api && config.default_segment_id.is_some() {
        Arc::new(BroadcastSender { provider, config })
    } else {
        Arc::new(TransactionalSender { provider, config })
    }
}

/// Targeting query shared by campaigns and the A/B orchestrator: a named
/// list's active members, or every active subscriber.
pub async fn target_subscribers(
    pool: &PgPool,
    contact_list_id: Option<Uuid>,
) -> sqlx::Result<Vec<Recipient>> {
    let rows: Vec<(Uuid, String, Option<String>, String)> = match contact_list_id {
        Some(list_id) => {
            sqlx::query_as(
                r#"
                SELECT s.id, s.email, s.name, s.unsubscribe_token
                FROM subscribers s
                JOIN list_memberships m ON m.subscriber_id = s.id
                WHERE m.list_id = $1 AND s.status = 'active'
                ORDER BY s.created_at
                "#,
            )
            .bind(list_id)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as(
                r#"
                SELECT id, email, name, unsubscribe_token
                FROM subscribers
                WHERE status = 'active'
                ORDER BY created_at
                "#,
            )
            .fetch_all(pool)
            .await?
        }
    };

    Ok(rows
        .into_iter()
        .map(|(subscriber_id, email, name, unsubscribe_token)| Recipient {
            subscriber_id,
            email,
            name,
            unsubscribe_token,
        })
        .collect())
}
